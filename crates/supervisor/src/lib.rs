//! Toolgate Supervisor
//!
//! Keeps one long-lived tool worker process alive and multiplexes caller
//! requests onto it. Requests are queued in FIFO order and written one at a
//! time; each reply is matched to the request in flight, which times out after
//! a fixed window. A worker that exits is respawned after a backoff delay.

pub mod dispatcher;
pub mod health;
pub mod pending;
pub mod process;
pub mod queue;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use health::{RestartPolicy, WorkerState};
pub use pending::{Completion, PendingRequest, Reply, RequestId};
pub use process::{CommandLauncher, ExitReport, Launcher, WorkerEvent, WorkerProcess};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorOptions};
