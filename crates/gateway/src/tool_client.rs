//! Tool client used by the HTTP handlers
//!
//! Wraps a [`SupervisorHandle`] and turns worker replies into plain results:
//! the worker's `result` object on success, [`ToolgateError::Rpc`] when the
//! worker answered with an error object.

use serde_json::Value;
use toolgate_common::{Result, ToolgateError};
use toolgate_supervisor::{Reply, SupervisorHandle, WorkerState};

/// Client for the supervised tool worker
#[derive(Clone)]
pub struct ToolClient {
    supervisor: SupervisorHandle,
}

impl ToolClient {
    pub fn new(supervisor: SupervisorHandle) -> Self {
        Self { supervisor }
    }

    /// List the worker's tools
    pub async fn list_tools(&self) -> Result<Value> {
        outcome(self.supervisor.list_tools().await)
    }

    /// Call a tool by name
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        outcome(self.supervisor.call_tool(name, arguments).await)
    }

    /// Current worker state
    pub fn health(&self) -> WorkerState {
        self.supervisor.state()
    }
}

fn outcome(reply: Reply) -> Result<Value> {
    reply?
        .into_outcome()
        .map_err(|e| ToolgateError::rpc(e.code, e.message))
}
