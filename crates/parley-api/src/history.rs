use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::info;

use parley_gateway::GatewayError;
use parley_types::api::{ClearResponse, HistoryResponse};
use parley_types::models::{Identity, RoomKey};

use crate::AppState;
use crate::error::ApiError;

/// GET /rooms/{room_key}/messages
pub async fn get_history(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(room_key): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let room_key = parse_room(&room_key)?;
    let messages = state.dispatcher.history(&identity, &room_key).await?;
    Ok(Json(HistoryResponse { messages }))
}

/// DELETE /rooms/{room_key}/messages
///
/// Open viewers of the room receive `RoomCleared` over the gateway.
pub async fn clear_history(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(room_key): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let room_key = parse_room(&room_key)?;
    let deleted = state.dispatcher.clear_room(&identity, &room_key).await?;
    info!("{} cleared {} messages from {}", identity.user_id, deleted, room_key);
    Ok(Json(ClearResponse { deleted }))
}

fn parse_room(raw: &str) -> Result<RoomKey, ApiError> {
    RoomKey::parse(raw).map_err(|e| ApiError::Gateway(GatewayError::from(e)))
}
