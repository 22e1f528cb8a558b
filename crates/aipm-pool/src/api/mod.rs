//! HTTP front door.
//!
//! Translates `/execute` requests into pool tasks and pool status into
//! `/health` responses. Task failures are reported in the response body;
//! only malformed requests get an error status.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{ExecuteRequest, ExecuteResponse, HealthResponse, SessionHealth};
pub use routes::create_router;
pub use state::AppState;
