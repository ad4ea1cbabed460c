//! Report generation endpoint.
//!
//! The response body is raw text written progressively as fragments arrive.
//! Clients reconstruct the report by concatenation. A failure appends a line
//! starting with `[[medscribe:error:` and ends the body.

use std::convert::Infallible;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::Response,
};
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;

use medscribe_domain::GenerationRequest;
use medscribe_types::{ReportMetadata, SessionId, TemplateKind};

use crate::error::ServerError;
use crate::state::AppState;

/// Header carrying the session the generation ran in.
pub const SESSION_HEADER: &str = "x-session-id";

/// Request body for the streaming endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    /// Existing session. A new session is created when omitted.
    #[serde(default)]
    pub session_id: Option<String>,

    pub kind: TemplateKind,

    #[serde(default)]
    pub metadata: ReportMetadata,

    pub instruction: String,

    #[serde(default)]
    pub author: Option<String>,

    /// Signature image, base64 encoded.
    #[serde(default)]
    pub signature_base64: Option<String>,
}

impl ReportRequest {
    fn into_generation(self) -> Result<GenerationRequest, ServerError> {
        let signature = match self.signature_base64 {
            Some(encoded) if !encoded.is_empty() => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| ServerError::BadRequest(format!("invalid signature: {e}")))?,
            ),
            _ => None,
        };

        Ok(GenerationRequest {
            session_id: self.session_id.map(SessionId::from),
            kind: self.kind,
            metadata: self.metadata,
            instruction: self.instruction,
            author: self.author,
            signature,
        })
    }
}

/// POST /api/v1/reports/stream
pub async fn stream_report_handler(
    State(state): State<AppState>,
    Json(request): Json<ReportRequest>,
) -> Result<Response, ServerError> {
    let request = request.into_generation()?;
    let started = state.orchestrator.stream(request).await?;

    let body = started
        .chunks
        .filter_map(|chunk| async move { chunk.to_wire() })
        .map(|text| Ok::<_, Infallible>(Bytes::from(text)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(SESSION_HEADER, started.session_id.as_str())
        .body(Body::from_stream(body))
        .map_err(|e| ServerError::Internal(format!("Failed to build response: {}", e)))
}
