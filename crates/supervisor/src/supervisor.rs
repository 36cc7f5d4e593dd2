//! Worker supervisor
//!
//! One background task owns the worker, the queue and the health state. Callers
//! talk to it through a cloneable [`SupervisorHandle`]; the worker's pipes talk
//! to it through [`WorkerEvent`]s. Everything the task does is driven by one of:
//!
//! - a command from a handle (enqueue, shutdown)
//! - an output line or exit notification from the current worker
//! - a timer (request timeout, rejection pacing, respawn backoff)
//!
//! Events are tagged with the worker generation that produced them, so output
//! from a process that was already replaced is ignored.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toolgate_common::{Result, ToolgateConfig, ToolgateError, METRICS};
use toolgate_proto::{RpcRequest, RpcResponse};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::health::{HealthMonitor, RestartPolicy, WorkerState};
use crate::pending::{Completion, PendingRequest, RequestId};
use crate::process::{ExitReport, Launcher, OutputStream, WorkerEvent, WorkerLink};

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Substring that marks a freshly started worker as ready
    pub readiness_marker: String,

    /// Per-request reply timeout, armed when the request is written
    pub request_timeout: Duration,

    /// Pause between `ServiceUnavailable` rejections
    pub unavailable_retry: Duration,

    pub max_queue_size: Option<usize>,

    /// How long shutdown waits for the worker to exit
    pub shutdown_grace: Duration,

    pub restart: RestartPolicy,
}

impl SupervisorOptions {
    pub fn from_config(config: &ToolgateConfig) -> Self {
        Self {
            readiness_marker: config.worker.readiness_marker.clone(),
            request_timeout: config.request_timeout(),
            unavailable_retry: config.unavailable_retry(),
            max_queue_size: config.dispatch.max_queue_size,
            shutdown_grace: config.shutdown_grace(),
            restart: RestartPolicy::from(&config.restart),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_config(&ToolgateConfig::default())
    }
}

enum Command {
    Enqueue(PendingRequest),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<WorkerState>,
}

impl SupervisorHandle {
    /// Queue a request; never blocks
    ///
    /// The returned completion resolves exactly once with the worker's reply or
    /// a terminal error.
    pub fn enqueue(&self, method: &str, params: Value) -> Completion {
        self.submit(RpcRequest::new(RequestId::new().to_string(), method, params))
    }

    /// Ask the worker for its tool catalogue
    pub async fn list_tools(&self) -> Result<RpcResponse> {
        self.submit(RpcRequest::list_tools(RequestId::new().to_string())).await
    }

    /// Invoke a tool by name
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<RpcResponse> {
        if name.is_empty() {
            return Err(ToolgateError::invalid_input("tool name must not be empty"));
        }
        self.submit(RpcRequest::call_tool(
            RequestId::new().to_string(),
            name,
            arguments,
        ))
        .await
    }

    fn submit(&self, request: RpcRequest) -> Completion {
        let (entry, completion) = match PendingRequest::new(&request) {
            Ok(pair) => pair,
            Err(e) => return Completion::failed(e),
        };

        // If the supervisor is gone the command is dropped here, and the
        // entry resolves itself as unavailable
        let _ = self.commands.send(Command::Enqueue(entry));
        completion
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Stop the worker and fail every outstanding request
    ///
    /// Returns once the supervisor task has finished shutting down.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// State owned by the supervisor task
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    options: SupervisorOptions,
    health: HealthMonitor,
    dispatcher: Dispatcher,
    worker: Option<WorkerLink>,
    generation: u64,
    respawn_at: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Supervisor {
    /// Spawn the supervisor task and its first worker
    pub fn start(
        launcher: Arc<dyn Launcher>,
        options: SupervisorOptions,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (health, state) =
            HealthMonitor::new(options.readiness_marker.clone(), options.restart.clone());
        let dispatcher = Dispatcher::new(
            options.request_timeout,
            options.unavailable_retry,
            options.max_queue_size,
        );

        let supervisor = Supervisor {
            launcher,
            options,
            health,
            dispatcher,
            worker: None,
            generation: 0,
            respawn_at: None,
            commands,
            events_tx,
            events,
        };

        let task = tokio::spawn(supervisor.run());
        let handle = SupervisorHandle {
            commands: commands_tx,
            state,
        };

        (handle, task)
    }

    async fn run(mut self) {
        info!("Supervising {}", self.launcher.describe());
        self.spawn_worker().await;

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Enqueue(entry)) => {
                        self.dispatcher.enqueue(entry);
                        self.dispatch();
                    }
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        info!("All supervisor handles dropped");
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = sleep_until(deadline) => self.on_timer().await,
            }
        }
    }

    async fn spawn_worker(&mut self) {
        self.generation += 1;

        match self.launcher.launch().await {
            Ok(process) => {
                METRICS.worker.spawns_total.inc();
                let link = process.attach(self.generation, self.events_tx.clone());
                info!(
                    "Started worker generation {} (pid {:?})",
                    self.generation,
                    link.pid()
                );
                self.worker = Some(link);
                self.health.on_spawned();
            }
            Err(e) => {
                error!("Failed to start worker: {}", e);
                self.schedule_respawn();
            }
        }
    }

    fn schedule_respawn(&mut self) {
        self.respawn_at = self.health.on_failure().map(|delay| {
            info!("Respawning worker in {:?}", delay);
            Instant::now() + delay
        });
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Output {
                generation,
                stream,
                line,
            } if generation == self.generation => self.on_output(stream, &line),
            WorkerEvent::Exited { generation, report } if generation == self.generation => {
                self.on_exit(report)
            }
            _ => debug!("Ignoring event from replaced worker"),
        }
    }

    fn on_output(&mut self, stream: OutputStream, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        if self.health.observe(&text) {
            self.dispatcher.clear_retry();
            self.dispatch();
            return;
        }

        match stream {
            OutputStream::Stdout if self.health.state().is_healthy() => {
                self.dispatcher.on_reply(line);
                self.dispatch();
            }
            OutputStream::Stdout => debug!(stdout = %text, "Worker output before ready"),
            OutputStream::Stderr => debug!(stderr = %text, "Worker log"),
        }
    }

    fn on_exit(&mut self, report: ExitReport) {
        warn!("Worker generation {} exited with {}", self.generation, report);
        METRICS.worker.exits_total.inc();
        self.worker = None;

        self.schedule_respawn();
        self.dispatcher.abort_in_flight(ToolgateError::worker_crashed(format!(
            "worker exited with {} while the request was in flight",
            report
        )));
        self.dispatch();
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        self.dispatcher.on_tick(now);

        if self.respawn_at.is_some_and(|at| at <= now) {
            self.respawn_at = None;
            self.spawn_worker().await;
        }

        self.dispatch();
    }

    fn dispatch(&mut self) {
        self.dispatcher.try_dispatch(self.health.state(), self.worker.as_ref());
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.dispatcher.next_deadline(), self.respawn_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down supervisor");
        self.health.terminate();
        self.respawn_at = None;
        self.dispatcher.drain("supervisor is shutting down");

        let Some(mut worker) = self.worker.take() else {
            return;
        };

        let generation = worker.generation();
        worker.terminate();

        let events = &mut self.events;
        let exited = async {
            while let Some(event) = events.recv().await {
                if matches!(event, WorkerEvent::Exited { generation: g, .. } if g == generation) {
                    break;
                }
            }
        };

        if tokio::time::timeout(self.options.shutdown_grace, exited)
            .await
            .is_err()
        {
            warn!(
                "Worker did not exit within {:?}",
                self.options.shutdown_grace
            );
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
