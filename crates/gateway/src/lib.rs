//! Toolgate Gateway
//!
//! HTTP facade over the supervised tool worker. Serves the tool catalogue and
//! tool calls as JSON, plus health, metrics and the optional browser UI.

pub mod http;
pub mod tool_client;

pub use http::{build_router, ApiError, AppState};
pub use tool_client::ToolClient;
