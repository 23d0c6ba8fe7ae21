use arrayvec::ArrayString;

/// Minecraft player name - max 16 characters, stored inline (no heap allocation).
pub type PlayerName = ArrayString<16>;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
  pub channel: String,
  pub payload: String,
}

impl ChannelMessage {
  pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
    Self {
      channel: channel.into(),
      payload: payload.into(),
    }
  }
}

/// Fields of the `player:<uuid>` hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerField {
  Server,
  Proxy,
  Ip,
  /// Last-seen marker: `0` while online, epoch millis of the disconnect otherwise.
  Online,
}

impl PlayerField {
  pub const ALL: [PlayerField; 4] = [
    PlayerField::Server,
    PlayerField::Proxy,
    PlayerField::Ip,
    PlayerField::Online,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      PlayerField::Server => "server",
      PlayerField::Proxy => "proxy",
      PlayerField::Ip => "ip",
      PlayerField::Online => "online",
    }
  }
}

/// When a player was last seen on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
  /// Currently connected to some proxy.
  Online,
  /// Disconnected at this epoch-millis timestamp.
  At(i64),
  /// No presence record exists.
  Never,
}

impl LastSeen {
  /// Parse the stored `online` field. `0` is the online sentinel.
  pub fn from_stored(value: Option<&str>) -> Option<Self> {
    match value {
      None => Some(LastSeen::Never),
      Some(raw) => match raw.trim().parse::<i64>().ok()? {
        0 => Some(LastSeen::Online),
        ts => Some(LastSeen::At(ts)),
      },
    }
  }

  /// Stored representation, `None` for `Never`.
  pub fn to_stored(self) -> Option<String> {
    match self {
      LastSeen::Online => Some("0".to_string()),
      LastSeen::At(ts) => Some(ts.to_string()),
      LastSeen::Never => None,
    }
  }

  /// Millisecond view used by external callers: 0 online, -1 never seen.
  pub fn as_millis(self) -> i64 {
    match self {
      LastSeen::Online => 0,
      LastSeen::At(ts) => ts,
      LastSeen::Never => -1,
    }
  }
}
