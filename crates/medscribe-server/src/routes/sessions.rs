//! Session endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use medscribe_domain::DomainError;
use medscribe_types::{ConversationTurn, SessionId, Timestamp};

use crate::error::ServerError;
use crate::state::AppState;

/// Response for session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

/// A session's ordered history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session_id: String,
    pub turns: Vec<ConversationTurn>,
    pub turn_count: usize,
    pub created_at: Timestamp,
}

/// POST /api/v1/sessions
pub async fn create_session_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<CreateSessionResponse>) {
    let session_id = state.orchestrator.sessions().create_session().await;
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session_id.to_string(),
        }),
    )
}

/// GET /api/v1/sessions/{id}
pub async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, ServerError> {
    let session_id = SessionId::from(id);
    let snapshot = state
        .orchestrator
        .sessions()
        .snapshot(&session_id)
        .await
        .map_err(DomainError::from)?;

    let turns = snapshot.turns().to_vec();
    Ok(Json(SessionDetail {
        session_id: session_id.to_string(),
        turn_count: turns.len(),
        turns,
        created_at: snapshot.created_at(),
    }))
}
