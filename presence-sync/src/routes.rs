use crate::AppState;
use crate::error::SyncError;
use crate::instance::InstanceState;
use crate::validation;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    proxy_id: String,
    active: bool,
}

#[derive(Serialize)]
pub(crate) struct ProxiesResponse {
    proxies: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct PlayersResponse {
    players: Vec<Uuid>,
}

#[derive(Serialize)]
pub(crate) struct CountResponse {
    count: usize,
}

#[derive(Serialize)]
pub(crate) struct PlayerResponse {
    uuid: Uuid,
    name: Option<String>,
    server: Option<String>,
    proxy: Option<String>,
    /// 0 while online, -1 if never seen
    last_seen: i64,
}

#[derive(Serialize)]
pub(crate) struct ServersResponse {
    servers: BTreeMap<String, Vec<Uuid>>,
}

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active = state.instance.state() == InstanceState::Active;
    let status = if active {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        proxy_id: state.instance.proxy_id().to_string(),
        active,
    };
    (status, Json(body))
}

pub(crate) async fn proxies(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ProxiesResponse {
        proxies: state.instance.active_proxy_ids(),
    })
}

pub(crate) async fn players(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, SyncError> {
    let mut players: Vec<Uuid> = state.instance.all_online_ids().await?.into_iter().collect();
    players.sort();
    Ok(Json(PlayersResponse { players }))
}

pub(crate) async fn count(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, SyncError> {
    let count = state.instance.count_online().await?;
    Ok(Json(CountResponse { count }))
}

pub(crate) async fn player(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<impl IntoResponse, SyncError> {
    let uuid = validation::parse_player_id(&raw_id)?;
    let instance = &state.instance;

    let response = PlayerResponse {
        uuid,
        name: instance.name_of(&uuid, false).await?,
        server: instance.server_of(&uuid).await?,
        proxy: instance.proxy_of(&uuid).await?,
        last_seen: instance.last_seen_of(&uuid).await?.as_millis(),
    };
    Ok((StatusCode::OK, Json(response)))
}

pub(crate) async fn servers(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, SyncError> {
    let servers = state.instance.players_by_server().await?;
    Ok(Json(ServersResponse { servers }))
}
