//! HTTP surface: routes, handlers, shared state, errors.

pub mod auth;
pub mod chat;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
