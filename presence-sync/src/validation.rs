/// Input validation for ids, names and channel traffic
use presence_store::keys;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Player name cannot be empty")]
    PlayerNameEmpty,

    #[error("Player name too long (max 16 characters, got {0})")]
    PlayerNameTooLong(usize),

    #[error("Player name contains invalid characters (only alphanumeric and underscore allowed)")]
    PlayerNameInvalidChars,

    #[error("Player id '{0}' is not a valid uuid")]
    PlayerIdInvalid(String),

    #[error("Proxy id cannot be empty")]
    ProxyIdEmpty,

    #[error("Proxy id too long (max 64 characters, got {0})")]
    ProxyIdTooLong(usize),

    #[error("Proxy id contains invalid characters (only alphanumeric, '-' and '_' allowed)")]
    ProxyIdInvalidChars,

    #[error("Proxy id '{0}' is reserved")]
    ProxyIdReserved(String),

    #[error("Channel name cannot be empty or contain whitespace")]
    ChannelInvalid,

    #[error("Command cannot be empty")]
    CommandEmpty,
}

/// Validates a Minecraft player name
///
/// Rules:
/// - Cannot be empty
/// - Max 16 characters (Minecraft username limit)
/// - Only alphanumeric characters and underscores
pub fn validate_player_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::PlayerNameEmpty);
    }

    if name.len() > 16 {
        return Err(ValidationError::PlayerNameTooLong(name.len()));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::PlayerNameInvalidChars);
    }

    Ok(())
}

/// Parses a player id given as text
pub fn parse_player_id(raw: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ValidationError::PlayerIdInvalid(raw.to_string()))
}

/// Validates a proxy id
///
/// Rules:
/// - Cannot be empty, max 64 characters
/// - Only alphanumeric characters, '-' and '_'
/// - Must not collide with the broadcast target or the data channel suffix
pub fn validate_proxy_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::ProxyIdEmpty);
    }

    if id.len() > 64 {
        return Err(ValidationError::ProxyIdTooLong(id.len()));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::ProxyIdInvalidChars);
    }

    if id == keys::ALL_PROXIES || keys::addressed_channel(id) == keys::DATA_CHANNEL {
        return Err(ValidationError::ProxyIdReserved(id.to_string()));
    }

    Ok(())
}

/// Validates a pub/sub channel name
pub fn validate_channel(channel: &str) -> Result<(), ValidationError> {
    if channel.is_empty() || channel.chars().any(char::is_whitespace) {
        return Err(ValidationError::ChannelInvalid);
    }
    Ok(())
}

/// Normalizes remote command text: trims it and strips one leading '/'.
pub fn normalize_command(text: &str) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    let command = trimmed.strip_prefix('/').unwrap_or(trimmed);
    if command.is_empty() {
        return Err(ValidationError::CommandEmpty);
    }
    Ok(command)
}
