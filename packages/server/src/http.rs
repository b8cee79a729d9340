//! Operational HTTP endpoints.

use std::sync::Arc;

use axum::{Json, extract::State};
use serde::Serialize;

use renraku_shared::envelope::PresenceStatus;

use crate::state::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
pub struct RoomMemberDto {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RoomSummaryDto {
    pub room_id: String,
    pub member_count: usize,
    pub members: Vec<RoomMemberDto>,
}

/// List live rooms with presence-annotated membership
pub async fn get_rooms(State(state): State<Arc<AppState>>) -> Json<Vec<RoomSummaryDto>> {
    let snapshot = state.registry.room_snapshot().await;
    let mut rooms = Vec::with_capacity(snapshot.len());
    for (room_id, members) in snapshot {
        let mut dtos = Vec::with_capacity(members.len());
        for member in members {
            let presence = state.registry.presence_of(&member).await;
            dtos.push(RoomMemberDto {
                user_id: member.into_string(),
                status: presence
                    .map(|record| record.status)
                    .unwrap_or(PresenceStatus::Offline),
                last_seen: presence.map(|record| record.last_seen),
            });
        }
        rooms.push(RoomSummaryDto {
            room_id: room_id.as_str().to_string(),
            member_count: dtos.len(),
            members: dtos,
        });
    }
    Json(rooms)
}
