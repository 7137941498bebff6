//! HTTP API: REST endpoints and shared state.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use handlers::{AckResponse, ExecuteRequest, HealthResponse};
pub use routes::create_router;
pub use state::AppState;
