//! In-memory worker used by the unit tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use toolgate_common::{Result, ToolgateError};
use toolgate_proto::RpcRequest;

use crate::process::{ChildControl, ExitReport, Launcher, WorkerProcess};

pub const READY: &str = "Test MCP Server running on stdio";

const PIPE_CAPACITY: usize = 64 * 1024;

/// Launcher that hands the far end of every worker's pipes to the test
pub struct FakeLauncher {
    workers: mpsc::UnboundedSender<FakeWorker>,
    failures: AtomicU32,
    launches: Mutex<Vec<Instant>>,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            workers: tx,
            failures: AtomicU32::new(0),
            launches: Mutex::new(Vec::new()),
        });
        (launcher, rx)
    }

    /// Make the next `n` launches fail
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// When each launch was attempted
    pub fn launches(&self) -> Vec<Instant> {
        self.launches.lock().clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self) -> Result<WorkerProcess> {
        self.launches.lock().push(Instant::now());

        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ToolgateError::spawn("simulated spawn failure"));
        }

        let (stdin, worker_stdin) = duplex(PIPE_CAPACITY);
        let (worker_stdout, stdout) = duplex(PIPE_CAPACITY);
        let (worker_stderr, stderr) = duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let worker = FakeWorker {
            requests: BufReader::new(worker_stdin).lines(),
            stdout: worker_stdout,
            stderr: worker_stderr,
            exit: exit_tx,
        };
        let _ = self.workers.send(worker);

        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Box::new(FakeChild {
                exit: exit_rx,
                killed: false,
            }),
        })
    }

    fn describe(&self) -> String {
        "fake worker".to_string()
    }
}

/// The test's side of a fake worker process
pub struct FakeWorker {
    requests: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: oneshot::Sender<ExitReport>,
}

impl FakeWorker {
    pub async fn announce_ready(&mut self) {
        self.write_stderr(READY).await;
    }

    pub async fn next_line(&mut self) -> String {
        self.requests
            .next_line()
            .await
            .unwrap()
            .expect("worker stdin closed")
    }

    pub async fn next_request(&mut self) -> RpcRequest {
        serde_json::from_str(&self.next_line().await).unwrap()
    }

    /// Next request, or None if nothing arrives within `within`
    pub async fn try_next_request(&mut self, within: Duration) -> Option<RpcRequest> {
        tokio::time::timeout(within, self.next_request()).await.ok()
    }

    pub async fn write_line(&mut self, line: &str) {
        self.stdout
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    pub async fn write_stderr(&mut self, line: &str) {
        self.stderr
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Raw bytes on stdout, framing included
    pub async fn write_stdout_bytes(&mut self, bytes: &[u8]) {
        self.stdout.write_all(bytes).await.unwrap();
    }

    /// Raw bytes on stderr, framing included
    pub async fn write_stderr_bytes(&mut self, bytes: &[u8]) {
        self.stderr.write_all(bytes).await.unwrap();
    }

    pub async fn reply(&mut self, request: &RpcRequest, result: Value) {
        let record = json!({"jsonrpc": "2.0", "id": request.id, "result": result});
        self.write_line(&record.to_string()).await;
    }

    /// Exit with `code`, closing all pipes
    pub fn exit(self, code: i32) {
        let _ = self.exit.send(ExitReport::exited(code));
    }
}

struct FakeChild {
    exit: oneshot::Receiver<ExitReport>,
    killed: bool,
}

#[async_trait]
impl ChildControl for FakeChild {
    async fn wait(&mut self) -> std::io::Result<ExitReport> {
        if self.killed {
            return Ok(ExitReport::signalled(9));
        }
        // A dropped FakeWorker counts as a crash with unknown status
        Ok((&mut self.exit).await.unwrap_or_default())
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.killed = true;
        Ok(())
    }
}
