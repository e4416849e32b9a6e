//! HTTP/SSE surface for the engine.

pub mod handlers;

pub use handlers::{build_router, AppState, SharedState};
