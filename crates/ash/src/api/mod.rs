//! HTTP API layer.

pub mod error;
mod handlers;
mod internal;
pub mod routes;
mod sse;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
