//! OS-level lifecycle of spawned children.
//!
//! Each child gets two reader tasks (stdout, stderr) feeding the output store
//! and one supervisor task racing process exit against the optional timeout
//! timer and a stop channel. The supervisor drains both readers before the
//! record turns terminal, so no output is ever lost to a race with the
//! state transition.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use encoding_rs::Encoding;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::CommandError;
use crate::error::Result;
use crate::output_store::OutputChannel;
use crate::output_store::OutputEntry;
use crate::output_store::OutputQuery;
use crate::output_store::OutputStore;

/// Grace window between the polite terminate signal and the kill escalation.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Upper bound on how long `stop` waits for the record to turn terminal.
const STOP_DEADLINE: Duration = Duration::from_secs(15);
/// Per-process deadline when force-stopping everything at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
/// Exit code reported for a timed-out child, as `timeout(1)` would.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Conventional shell mapping for signal deaths: 128 + signal number.
const EXIT_CODE_SIGNAL_BASE: i32 = 128;
const STOP_CHANNEL_CAPACITY: usize = 4;
const READ_BUF_CAPACITY: usize = 8 * 1024;
const PID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    /// Exited on its own with code 0.
    Completed,
    /// Exited on its own with a non-zero code.
    Failed,
    /// Stopped by the server: explicit stop, timeout, or shutdown.
    Terminated,
    /// The manager itself failed while supervising the child.
    Error,
}

impl ProcessStatus {
    /// Terminal states are sticky: once a record leaves `Running` it never
    /// changes again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = CommandError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            "error" => Ok(Self::Error),
            other => Err(CommandError::InvalidArgument(format!(
                "invalid status: {other} (expected running, completed, failed, terminated or error)"
            ))),
        }
    }
}

/// Snapshot of one process record. Mutated only by the supervising task;
/// everyone else gets a copy.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: String,
    pub command: Vec<String>,
    pub directory: PathBuf,
    pub description: String,
    pub encoding: String,
    /// Environment overlay merged on top of the server environment.
    pub envs: HashMap<String, String>,
    pub labels: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

/// Everything needed to spawn one child.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub command: Vec<String>,
    pub directory: PathBuf,
    pub description: String,
    /// Written to the child's stdin once, then the stream is closed.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub envs: HashMap<String, String>,
    /// Codec label for decoding output; `utf-8` when absent.
    pub encoding: Option<String>,
    pub labels: Vec<String>,
}

/// Per-id outcome of a `clean` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanStatus {
    Cleaned,
    /// Still running; stop it first.
    Running,
    NotFound,
}

struct StopRequest {
    force: bool,
    reason: Option<String>,
}

struct ManagedProcess {
    info: StdMutex<ProcessInfo>,
    done: AtomicBool,
    done_notify: Notify,
    stop_tx: mpsc::Sender<StopRequest>,
}

impl ManagedProcess {
    fn snapshot(&self) -> ProcessInfo {
        self.info.lock().expect("process info lock poisoned").clone()
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn wait_done(&self) {
        loop {
            let notified = self.done_notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

/// In-memory registry of spawned children plus the retention sweeper.
pub struct ProcessManager {
    store: Arc<OutputStore>,
    registry: Mutex<HashMap<String, Arc<ManagedProcess>>>,
    retention: Duration,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl ProcessManager {
    /// Build the manager and start its retention sweeper. Must be called
    /// within a tokio runtime.
    pub fn new(store: Arc<OutputStore>, retention: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            registry: Mutex::new(HashMap::new()),
            retention,
            sweeper: StdMutex::new(None),
        });
        let handle = tokio::spawn(Self::sweep_loop(Arc::downgrade(&manager)));
        *manager.sweeper.lock().expect("sweeper lock poisoned") = Some(handle);
        manager
    }

    pub fn store(&self) -> &Arc<OutputStore> {
        &self.store
    }

    /// Validate the spec, spawn the child and its helper tasks, and return
    /// the freshly allocated process id. The record is `Running` when this
    /// returns.
    pub async fn start_process(&self, spec: ProcessSpec) -> Result<String> {
        if spec.command.is_empty() {
            return Err(CommandError::InvalidArgument(
                "command cannot be empty".to_string(),
            ));
        }
        match tokio::fs::metadata(&spec.directory).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(CommandError::InvalidArgument(format!(
                    "directory does not exist: {}",
                    spec.directory.display()
                )));
            }
        }
        let encoding_label = spec.encoding.clone().unwrap_or_else(|| "utf-8".to_string());
        let encoding = Encoding::for_label(encoding_label.as_bytes()).ok_or_else(|| {
            CommandError::InvalidArgument(format!("unknown encoding label: {encoding_label}"))
        })?;

        let pid = self.allocate_pid().await;
        self.store.register(&pid).await?;

        let mut command = Command::new(&spec.command[0]);
        command
            .args(&spec.command[1..])
            .current_dir(&spec.directory)
            .envs(&spec.envs)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = self.store.clear(&pid).await;
                return Err(match err.kind() {
                    ErrorKind::NotFound => CommandError::Execution(format!(
                        "command not found: {}",
                        spec.command[0]
                    )),
                    ErrorKind::PermissionDenied => CommandError::PermissionDenied(format!(
                        "cannot execute {}: {err}",
                        spec.command[0]
                    )),
                    _ => CommandError::Execution(format!(
                        "failed to start '{}': {err}",
                        spec.command.join(" ")
                    )),
                });
            }
        };

        if let Some(data) = spec.stdin.clone()
            && let Some(mut stdin) = child.stdin.take()
        {
            tokio::spawn(async move {
                // The child may exit before reading everything; that is fine.
                if let Err(err) = stdin.write_all(&data).await {
                    debug!("stdin write ended early: {err}");
                }
                // Dropping the handle closes the stream.
            });
        }

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                let _ = self.store.clear(&pid).await;
                return Err(CommandError::Execution(
                    "child stdio pipes were unexpectedly not available".to_string(),
                ));
            }
        };

        let stdout_reader = tokio::spawn(read_lines(
            self.store.clone(),
            pid.clone(),
            OutputChannel::Stdout,
            stdout,
            encoding,
        ));
        let stderr_reader = tokio::spawn(read_lines(
            self.store.clone(),
            pid.clone(),
            OutputChannel::Stderr,
            stderr,
            encoding,
        ));

        let (stop_tx, stop_rx) = mpsc::channel(STOP_CHANNEL_CAPACITY);
        let record = Arc::new(ManagedProcess {
            info: StdMutex::new(ProcessInfo {
                pid: pid.clone(),
                command: spec.command,
                directory: spec.directory,
                description: spec.description,
                encoding: encoding_label,
                envs: spec.envs,
                labels: spec.labels,
                timeout_secs: spec.timeout.map(|t| t.as_secs()),
                status: ProcessStatus::Running,
                start_time: Utc::now(),
                end_time: None,
                exit_code: None,
                error_message: None,
            }),
            done: AtomicBool::new(false),
            done_notify: Notify::new(),
            stop_tx,
        });
        self.registry.lock().await.insert(pid.clone(), record.clone());

        tokio::spawn(supervise(
            record,
            child,
            [stdout_reader, stderr_reader],
            spec.timeout,
            stop_rx,
        ));
        Ok(pid)
    }

    async fn allocate_pid(&self) -> String {
        let registry = self.registry.lock().await;
        loop {
            let id = Uuid::new_v4().simple().to_string();
            let short = id[..PID_LEN].to_string();
            if !registry.contains_key(&short) {
                return short;
            }
        }
    }

    async fn get_record(&self, pid: &str) -> Result<Arc<ManagedProcess>> {
        self.registry
            .lock()
            .await
            .get(pid)
            .cloned()
            .ok_or_else(|| CommandError::ProcessNotFound(pid.to_string()))
    }

    pub async fn get_process_info(&self, pid: &str) -> Result<ProcessInfo> {
        Ok(self.get_record(pid).await?.snapshot())
    }

    /// Block until the record is terminal, optionally bounded. The snapshot
    /// returned reflects the terminal state, readers drained.
    pub async fn wait_for_completion(
        &self,
        pid: &str,
        timeout: Option<Duration>,
    ) -> Result<ProcessInfo> {
        let record = self.get_record(pid).await?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, record.wait_done())
                .await
                .map_err(|_| {
                    CommandError::ProcessControl(format!(
                        "timed out waiting for process {pid} to finish"
                    ))
                })?,
            None => record.wait_done().await,
        }
        Ok(record.snapshot())
    }

    pub async fn read_output(
        &self,
        pid: &str,
        channel: OutputChannel,
        query: &OutputQuery,
    ) -> Result<Vec<OutputEntry>> {
        // Unknown pids are rejected before touching the disk.
        self.get_record(pid).await?;
        self.store.read(pid, channel, query).await
    }

    /// Watcher firing whenever the process emits output on any channel.
    pub async fn watch_output(&self, pid: &str) -> Result<Arc<Notify>> {
        self.get_record(pid).await?;
        self.store.watcher(pid).await
    }

    /// Stop a process. Graceful stop sends the polite terminate signal and
    /// escalates to a kill after a short grace window; force kills
    /// immediately. Idempotent: stopping an already-terminal record is a
    /// successful no-op. Returns once the record is terminal.
    pub async fn stop_process(
        &self,
        pid: &str,
        force: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let record = self.get_record(pid).await?;
        if record.is_done() {
            return Ok(());
        }
        // A send failure means the supervisor already finished; wait_done
        // resolves immediately in that case.
        let _ = record.stop_tx.send(StopRequest { force, reason }).await;
        tokio::time::timeout(STOP_DEADLINE, record.wait_done())
            .await
            .map_err(|_| {
                CommandError::ProcessControl(format!(
                    "process {pid} did not stop within {}s",
                    STOP_DEADLINE.as_secs()
                ))
            })?;
        Ok(())
    }

    /// Snapshots matching the filters, ordered by start time ascending.
    /// Label matching is subset: every requested label must be present.
    pub async fn list_processes(
        &self,
        status: Option<ProcessStatus>,
        labels: &[String],
    ) -> Vec<ProcessInfo> {
        let snapshots: Vec<ProcessInfo> = self
            .registry
            .lock()
            .await
            .values()
            .map(|record| record.snapshot())
            .collect();
        let mut result: Vec<ProcessInfo> = snapshots
            .into_iter()
            .filter(|info| status.is_none_or(|wanted| info.status == wanted))
            .filter(|info| labels.iter().all(|l| info.labels.iter().any(|have| have == l)))
            .collect();
        result.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        result
    }

    /// Remove terminal records and their logs. Running records are reported
    /// as in-use and left alone; already-cleaned ids report not-found without
    /// failing the batch.
    pub async fn clean_processes(
        &self,
        pids: &[String],
    ) -> Result<BTreeMap<String, CleanStatus>> {
        if pids.is_empty() {
            return Err(CommandError::InvalidArgument(
                "process id list cannot be empty".to_string(),
            ));
        }
        let mut results = BTreeMap::new();
        for pid in pids {
            if results.contains_key(pid) {
                continue;
            }
            let record = self.registry.lock().await.get(pid).cloned();
            let status = match record {
                None => CleanStatus::NotFound,
                Some(record) if !record.is_done() => CleanStatus::Running,
                Some(_) => {
                    self.registry.lock().await.remove(pid);
                    match self.store.clear(pid).await {
                        Ok(()) | Err(CommandError::ProcessNotFound(_)) => {}
                        Err(err) => warn!(%pid, "failed to clear output logs: {err}"),
                    }
                    CleanStatus::Cleaned
                }
            };
            results.insert(pid.clone(), status);
        }
        Ok(results)
    }

    async fn sweep_loop(manager: Weak<Self>) {
        let interval = {
            let Some(manager) = manager.upgrade() else { return };
            manager
                .retention
                .clamp(Duration::from_secs(1), Duration::from_secs(30))
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else { return };
            manager.sweep_expired().await;
        }
    }

    async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .registry
            .lock()
            .await
            .iter()
            .filter_map(|(pid, record)| {
                let info = record.snapshot();
                if !info.status.is_terminal() {
                    return None;
                }
                let age = now.signed_duration_since(info.end_time?).to_std().ok()?;
                (age >= self.retention).then(|| pid.clone())
            })
            .collect();
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "evicting expired process records");
        if let Err(err) = self.clean_processes(&expired).await {
            warn!("retention sweep failed: {err}");
        }
    }

    /// Cancel the sweeper, force-stop everything still running with a
    /// bounded deadline, then shut the store down.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }
        let running: Vec<(String, Arc<ManagedProcess>)> = self
            .registry
            .lock()
            .await
            .iter()
            .filter(|(_, record)| !record.is_done())
            .map(|(pid, record)| (pid.clone(), record.clone()))
            .collect();
        for (pid, record) in running {
            let _ = record
                .stop_tx
                .send(StopRequest {
                    force: true,
                    reason: Some("server shutting down".to_string()),
                })
                .await;
            if tokio::time::timeout(SHUTDOWN_DEADLINE, record.wait_done())
                .await
                .is_err()
            {
                warn!(%pid, "process did not exit before the shutdown deadline");
            }
        }
        self.store.shutdown().await;
    }
}

/// Read byte lines from one child stream, decode with the configured codec
/// (replacement policy, so a bad byte never drops a line), strip the
/// terminator and append to the store. A failure here is reported to the
/// supervisor, never to the child.
async fn read_lines<R>(
    store: Arc<OutputStore>,
    pid: String,
    channel: OutputChannel,
    stream: R,
    encoding: &'static Encoding,
) -> std::result::Result<(), String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(READ_BUF_CAPACITY);
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|err| format!("error reading {channel}: {err}"))?;
        if n == 0 {
            break;
        }
        let line = decode_line(&buf, encoding);
        store
            .append(&pid, channel, vec![line])
            .await
            .map_err(|err| format!("failed to persist {channel} output: {err}"))?;
    }
    Ok(())
}

fn decode_line(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (decoded, _, _) = encoding.decode(bytes);
    let mut line = decoded.into_owned();
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

enum ExitCause {
    Exited,
    TimedOut(Duration),
    Stopped(Option<String>),
}

async fn supervise(
    record: Arc<ManagedProcess>,
    mut child: Child,
    readers: [JoinHandle<std::result::Result<(), String>>; 2],
    timeout: Option<Duration>,
    mut stop_rx: mpsc::Receiver<StopRequest>,
) {
    let timer = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    let mut cause = ExitCause::Exited;
    let mut stop_open = true;
    let wait_result = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut timer => {
                cause = ExitCause::TimedOut(timeout.unwrap_or_default());
                let _ = child.start_kill();
                break child.wait().await;
            }
            request = stop_rx.recv(), if stop_open => {
                match request {
                    None => stop_open = false,
                    Some(request) => {
                        cause = ExitCause::Stopped(request.reason);
                        if request.force {
                            let _ = child.start_kill();
                        } else {
                            terminate_then_escalate(&mut child).await;
                        }
                        break child.wait().await;
                    }
                }
            }
        }
    };

    // Drain the readers before the record turns terminal so no output is
    // silently lost.
    let mut reader_failure: Option<String> = None;
    for handle in readers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                if reader_failure.is_none() {
                    reader_failure = Some(message);
                }
            }
            Err(err) => {
                if reader_failure.is_none() {
                    reader_failure = Some(format!("output reader panicked: {err}"));
                }
            }
        }
    }

    {
        let mut info = record.info.lock().expect("process info lock poisoned");
        info.end_time = Some(Utc::now());
        match wait_result {
            Ok(status) => {
                let timed_out = matches!(cause, ExitCause::TimedOut(_));
                let code = exit_code_of(status, timed_out);
                info.exit_code = Some(code);
                info.status = match &cause {
                    ExitCause::TimedOut(limit) => {
                        info.error_message = Some(format!("timed out after {}s", limit.as_secs()));
                        ProcessStatus::Terminated
                    }
                    ExitCause::Stopped(reason) => {
                        if let Some(reason) = reason {
                            info.error_message = Some(reason.clone());
                        }
                        ProcessStatus::Terminated
                    }
                    ExitCause::Exited => {
                        if code == 0 {
                            ProcessStatus::Completed
                        } else {
                            ProcessStatus::Failed
                        }
                    }
                };
            }
            Err(err) => {
                info.status = ProcessStatus::Error;
                info.error_message = Some(format!("failed to reap child: {err}"));
            }
        }
        if let Some(message) = reader_failure {
            warn!(pid = info.pid.as_str(), "{message}");
            match &mut info.error_message {
                Some(existing) => {
                    existing.push_str("; ");
                    existing.push_str(&message);
                }
                None => info.error_message = Some(message),
            }
        }
    }

    record.done.store(true, Ordering::SeqCst);
    record.done_notify.notify_waiters();
}

async fn terminate_then_escalate(child: &mut Child) {
    send_terminate(child);
    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(STOP_GRACE) => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    // The child is its own process group leader (process_group(0) at spawn),
    // so signalling the group takes grandchildren down with it.
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn exit_code_of(status: ExitStatus, timed_out: bool) -> i32 {
    if timed_out {
        return TIMEOUT_EXIT_CODE;
    }
    status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return EXIT_CODE_SIGNAL_BASE + signal;
            }
        }
        -1
    })
}
