//! Worker process handle
//!
//! Owns the subprocess pipes. A [`Launcher`] produces a [`WorkerProcess`]; the
//! supervisor then [`attach`](WorkerProcess::attach)es it, which starts three
//! background tasks:
//!
//! ```text
//!   stdout ─┐
//!           ├─ output pump ── WorkerEvent::Output ──┐
//!   stderr ─┘                                       ├──▶ supervisor task
//!   child.wait() ── exit watcher ── WorkerEvent::Exited ┘
//!
//!   WorkerLink::write ── writer task ──▶ stdin
//! ```
//!
//! Output is framed by newline; each record arrives as one event, as raw
//! bytes. The exit watcher waits briefly for the output pump to drain, so
//! every line the worker printed before dying is delivered ahead of its exit
//! event.
//!
//! Only the returned [`WorkerLink`] can write to the worker's stdin. Writes
//! are handed to the writer task, so a worker that stops reading its input
//! never stalls the caller.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::{Stream, StreamExt};
use toolgate_common::config::WorkerConfig;
use toolgate_common::{Result, ToolgateError};
use tracing::{debug, info, warn};

/// How long the exit watcher waits for buffered output after the child exits
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Notifications from an attached worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One newline-terminated record from stdout or stderr, terminator
    /// stripped and bytes left undecoded
    Output {
        generation: u64,
        stream: OutputStream,
        line: Vec<u8>,
    },

    /// The process terminated; sent once per generation
    Exited { generation: u64, report: ExitReport },
}

/// Lifecycle control of a spawned child
#[async_trait]
pub trait ChildControl: Send {
    /// Wait for the process to exit
    async fn wait(&mut self) -> std::io::Result<ExitReport>;

    /// Send the termination signal without waiting
    fn start_kill(&mut self) -> std::io::Result<()>;

    /// OS process id, if there is one
    fn id(&self) -> Option<u32> {
        None
    }
}

#[async_trait]
impl ChildControl for tokio::process::Child {
    async fn wait(&mut self) -> std::io::Result<ExitReport> {
        let status = tokio::process::Child::wait(self).await?;
        Ok(ExitReport::from_status(status))
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        tokio::process::Child::start_kill(self)
    }

    fn id(&self) -> Option<u32> {
        tokio::process::Child::id(self)
    }
}

/// A freshly spawned worker with its pipes
pub struct WorkerProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub child: Box<dyn ChildControl>,
}

/// Something that can start a worker process
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<WorkerProcess>;

    /// Human readable description for logs
    fn describe(&self) -> String {
        "worker".to_string()
    }
}

/// Launches the configured executable with piped stdio
pub struct CommandLauncher {
    config: WorkerConfig,
}

impl CommandLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        if !self.config.inherit_env {
            cmd.env_clear();
            if let Ok(path) = std::env::var("PATH") {
                cmd.env("PATH", path);
            }
        }

        for key in &self.config.passthrough_env {
            match std::env::var(key) {
                Ok(value) => {
                    cmd.env(key, value);
                }
                Err(_) => warn!("Passthrough variable {} is not set", key),
            }
        }

        // Explicit values win over inherited and passthrough ones
        cmd.envs(&self.config.env);

        cmd
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self) -> Result<WorkerProcess> {
        let mut child = self.build_command().spawn().map_err(|e| {
            ToolgateError::spawn(format!("failed to spawn {}: {}", self.describe(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolgateError::spawn("failed to capture worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolgateError::spawn("failed to capture worker stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolgateError::spawn("failed to capture worker stderr"))?;

        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Box::new(child),
        })
    }

    fn describe(&self) -> String {
        if self.config.args.is_empty() {
            self.config.program.clone()
        } else {
            format!("{} {}", self.config.program, self.config.args.join(" "))
        }
    }
}

impl WorkerProcess {
    /// Start forwarding output and exit notifications as `generation` events
    pub fn attach(self, generation: u64, events: mpsc::UnboundedSender<WorkerEvent>) -> WorkerLink {
        let WorkerProcess {
            stdin,
            stdout,
            stderr,
            mut child,
        } = self;

        let pid = child.id();

        let output_events = events.clone();
        let pump = tokio::spawn(async move {
            let mut merged =
                records(stdout, OutputStream::Stdout).merge(records(stderr, OutputStream::Stderr));
            while let Some((stream, line)) = merged.next().await {
                let event = WorkerEvent::Output {
                    generation,
                    stream,
                    line,
                };
                if output_events.send(event).is_err() {
                    break;
                }
            }
            debug!("Output pump for worker generation {} finished", generation);
        });

        let (writes, pending_writes) = mpsc::unbounded_channel();
        tokio::spawn(write_records(generation, stdin, pending_writes));

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            // A dropped link counts as a kill request
            let exited = tokio::select! {
                result = child.wait() => Some(result),
                _ = kill_rx => None,
            };

            let result = match exited {
                Some(result) => result,
                None => {
                    info!("Terminating worker generation {}", generation);
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to signal worker: {}", e);
                    }
                    child.wait().await
                }
            };

            let report = result.unwrap_or_else(|e| {
                warn!("Failed to wait for worker: {}", e);
                ExitReport::default()
            });

            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, pump).await.is_err() {
                debug!("Worker output still open after exit, not waiting for it");
            }

            let _ = events.send(WorkerEvent::Exited { generation, report });
        });

        WorkerLink {
            generation,
            pid,
            writes,
            kill: Some(kill_tx),
        }
    }
}

/// Newline-framed records from one pipe
///
/// Bytes are passed through undecoded. A read error ends this pipe only.
fn records(
    reader: BoxedReader,
    stream: OutputStream,
) -> impl Stream<Item = (OutputStream, Vec<u8>)> + Send + Unpin {
    SplitStream::new(BufReader::new(reader).split(b'\n'))
        .take_while(move |record| match record {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to read worker {:?}: {}", stream, e);
                false
            }
        })
        .filter_map(move |record| {
            let mut line = record.ok()?;
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Some((stream, line))
        })
}

/// Drain queued records into the worker's stdin
///
/// Runs until the link is dropped or a write fails; after that every
/// [`WorkerLink::write`] reports the channel as closed.
async fn write_records(
    generation: u64,
    mut stdin: BoxedWriter,
    mut pending: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(record) = pending.recv().await {
        let written = match stdin.write_all(&record).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!("Worker generation {} stdin closed: {}", generation, e);
            break;
        }
    }
}

/// Write side of an attached worker
pub struct WorkerLink {
    generation: u64,
    pid: Option<u32>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerLink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue one record, followed by the newline terminator, for the worker
    ///
    /// Never waits on the pipe. Fails with `ChannelClosed` once stdin is gone.
    pub fn write(&self, record: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(record.len() + 1);
        buf.extend_from_slice(record.as_bytes());
        buf.push(b'\n');

        self.writes
            .send(buf)
            .map_err(|_| ToolgateError::channel_closed("worker stdin is closed"))
    }

    /// Resolves once the worker's stdin can no longer be written
    pub async fn closed(&self) {
        self.writes.closed().await
    }

    /// Ask the worker to stop; its exit arrives as a regular `Exited` event
    pub fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

impl fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLink")
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;

    #[test]
    fn test_exit_report_display() {
        assert_eq!(ExitReport::exited(1).to_string(), "exit code 1");
        assert_eq!(ExitReport::signalled(9).to_string(), "signal 9");
        assert_eq!(ExitReport::default().to_string(), "unknown status");
    }

    #[test]
    fn test_command_launcher_describe() {
        let launcher = CommandLauncher::new(WorkerConfig {
            program: "node".to_string(),
            args: vec!["dist/index.js".to_string()],
            ..WorkerConfig::default()
        });

        assert_eq!(launcher.describe(), "node dist/index.js");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let launcher = CommandLauncher::new(WorkerConfig {
            program: "/nonexistent/toolgate-worker".to_string(),
            args: Vec::new(),
            passthrough_env: Vec::new(),
            ..WorkerConfig::default()
        });

        let err = launcher.launch().await.err().unwrap();
        assert!(matches!(err, ToolgateError::Spawn(_)));
    }

    async fn collect_until_exit(
        rx: &mut mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> (Vec<(OutputStream, Vec<u8>)>, ExitReport) {
        let mut outputs = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                WorkerEvent::Output { stream, line, .. } => outputs.push((stream, line)),
                WorkerEvent::Exited { report, .. } => return (outputs, report),
            }
        }
    }

    #[tokio::test]
    async fn test_attach_forwards_lines_then_exit() {
        let (launcher, mut workers) = FakeLauncher::new();
        let process = launcher.launch().await.unwrap();
        let mut worker = workers.recv().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = process.attach(7, tx);

        link.write(r#"{"id":"1"}"#).unwrap();
        assert_eq!(worker.next_line().await, r#"{"id":"1"}"#);

        worker.write_stderr("booting").await;
        worker.write_line("{\"result\":1}").await;
        worker.exit(3);

        let mut outputs = Vec::new();
        let exit = loop {
            match rx.recv().await.unwrap() {
                WorkerEvent::Output { generation, stream, line } => {
                    assert_eq!(generation, 7);
                    outputs.push((stream, line));
                }
                WorkerEvent::Exited { generation, report } => break (generation, report),
            }
        };

        assert_eq!(exit, (7, ExitReport::exited(3)));
        assert!(outputs.contains(&(OutputStream::Stderr, b"booting".to_vec())));
        assert!(outputs.contains(&(OutputStream::Stdout, b"{\"result\":1}".to_vec())));
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_forwarded_raw() {
        let (launcher, mut workers) = FakeLauncher::new();
        let process = launcher.launch().await.unwrap();
        let mut worker = workers.recv().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = process.attach(1, tx);

        worker.write_stderr_bytes(b"caf\xe9 log\r\n").await;
        worker.write_stderr("still reading").await;
        worker.write_stdout_bytes(b"{\"result\":\"\xff\"}\n").await;
        worker.write_line("{\"result\":2}").await;
        worker.exit(0);

        let (outputs, report) = collect_until_exit(&mut rx).await;
        assert_eq!(report, ExitReport::exited(0));

        let stderr: Vec<_> = outputs
            .iter()
            .filter(|(stream, _)| *stream == OutputStream::Stderr)
            .map(|(_, line)| line.clone())
            .collect();
        assert_eq!(stderr, vec![b"caf\xe9 log".to_vec(), b"still reading".to_vec()]);

        let stdout: Vec<_> = outputs
            .iter()
            .filter(|(stream, _)| *stream == OutputStream::Stdout)
            .map(|(_, line)| line.clone())
            .collect();
        assert_eq!(
            stdout,
            vec![b"{\"result\":\"\xff\"}".to_vec(), b"{\"result\":2}".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_write_after_exit_is_channel_closed() {
        let (launcher, mut workers) = FakeLauncher::new();
        let process = launcher.launch().await.unwrap();
        let worker = workers.recv().await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let link = process.attach(1, tx);
        worker.exit(0);

        // The first write discovers the broken pipe
        let _ = link.write("{}");
        tokio::time::timeout(Duration::from_secs(5), link.closed())
            .await
            .unwrap();

        let err = link.write("{}").unwrap_err();
        assert!(matches!(err, ToolgateError::ChannelClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_does_not_wait_for_reader() {
        let (launcher, mut workers) = FakeLauncher::new();
        let process = launcher.launch().await.unwrap();
        let _worker = workers.recv().await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let link = process.attach(1, tx);

        // Far more than the pipe holds, and nobody reads it
        let record = "x".repeat(512 * 1024);
        for _ in 0..4 {
            link.write(&record).unwrap();
        }
    }

    #[tokio::test]
    async fn test_terminate_reports_exit() {
        let (launcher, mut workers) = FakeLauncher::new();
        let process = launcher.launch().await.unwrap();
        let _worker = workers.recv().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = process.attach(2, tx);
        link.terminate();

        match rx.recv().await.unwrap() {
            WorkerEvent::Exited { generation, .. } => assert_eq!(generation, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
