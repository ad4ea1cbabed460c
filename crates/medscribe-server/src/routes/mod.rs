//! API routes.

pub mod health;
pub mod recovery;
pub mod reports;
pub mod sessions;

pub use health::{HealthResponse, health_routes};
pub use recovery::{ListPendingResponse, list_pending_handler, retry_pending_handler};
pub use reports::{ReportRequest, SESSION_HEADER, stream_report_handler};
pub use sessions::{
    CreateSessionResponse, SessionDetail, create_session_handler, get_session_handler,
};
