//! Policy layer and user-facing facade over the process manager.
//!
//! Enforces the command allow-list, renders the synchronous path into one
//! structured result, and exposes the background operations including the
//! filtered, chunked log retrieval.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use chrono::format::Item;
use chrono::format::StrftimeItems;
use regex_lite::Regex;
use serde::Serialize;
use tokio::time::sleep;

use crate::config::ServerConfig;
use crate::error::CommandError;
use crate::error::Result;
use crate::output_store::OutputChannel;
use crate::output_store::OutputEntry;
use crate::output_store::OutputQuery;
use crate::process_manager::CleanStatus;
use crate::process_manager::ProcessInfo;
use crate::process_manager::ProcessManager;
use crate::process_manager::ProcessSpec;
use crate::process_manager::ProcessStatus;
use crate::process_manager::TIMEOUT_EXIT_CODE;

/// Slack granted past the child's own timeout before the synchronous path
/// gives up waiting on the supervisor.
const WAIT_SLACK: Duration = Duration::from_secs(5);
pub const DEFAULT_LIMIT_LINES: usize = 500;
const DEFAULT_TIME_PREFIX_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Outcome of a synchronous execution. On timeout the same shape travels
/// inside [`CommandError::Timeout`] with whatever was captured.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: ProcessStatus,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    pub fn duration_seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub command: Vec<String>,
    pub directory: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub envs: HashMap<String, String>,
    pub encoding: Option<String>,
    pub limit_lines: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct StartBackgroundRequest {
    pub command: Vec<String>,
    pub directory: PathBuf,
    pub description: String,
    pub labels: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub envs: HashMap<String, String>,
    pub encoding: Option<String>,
    /// Unbounded when absent; background starts get no default timeout.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrepMode {
    /// Keep whole matching lines.
    #[default]
    Line,
    /// Keep only the matched substring of each line, as `grep -o` would.
    Content,
}

impl FromStr for GrepMode {
    type Err = CommandError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "line" => Ok(Self::Line),
            "content" => Ok(Self::Content),
            other => Err(CommandError::InvalidArgument(format!(
                "invalid grep mode: {other} (expected line or content)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogsRequest {
    pub pid: String,
    pub tail: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub with_stdout: bool,
    pub with_stderr: bool,
    pub add_time_prefix: bool,
    /// strftime format for the prefix; a sensible microsecond default when
    /// absent.
    pub time_prefix_format: Option<String>,
    /// How long to wait for more output from a still-running process when
    /// the result looks partial. Zero never blocks.
    pub follow: Duration,
    pub limit_lines: usize,
    pub grep: Option<String>,
    pub grep_mode: GrepMode,
}

impl LogsRequest {
    pub fn new(pid: impl Into<String>) -> Self {
        Self {
            pid: pid.into(),
            tail: None,
            since: None,
            until: None,
            with_stdout: true,
            with_stderr: false,
            add_time_prefix: true,
            time_prefix_format: None,
            follow: Duration::from_secs(1),
            limit_lines: DEFAULT_LIMIT_LINES,
            grep: None,
            grep_mode: GrepMode::Line,
        }
    }
}

/// One block of rendered log output. The first chunk of every `logs` result
/// is a header (`channel: None`) describing the process.
#[derive(Debug, Clone, Serialize)]
pub struct LogChunk {
    pub channel: Option<OutputChannel>,
    pub text: String,
}

pub struct CommandExecutor {
    manager: Arc<ProcessManager>,
    config: Arc<ServerConfig>,
}

impl CommandExecutor {
    pub fn new(manager: Arc<ProcessManager>, config: Arc<ServerConfig>) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    /// `argv[0]` must match an allow-list entry verbatim: no path resolution,
    /// no shell lookup.
    fn check_allowed(&self, command: &[String]) -> Result<()> {
        let Some(program) = command.first() else {
            return Err(CommandError::InvalidArgument(
                "command cannot be empty".to_string(),
            ));
        };
        if !self.config.allowed_commands.iter().any(|allowed| allowed == program) {
            return Err(CommandError::InvalidArgument(format!(
                "command '{program}' is not allowed; allowed commands: {}",
                self.config.allowed_commands.join(", ")
            )));
        }
        Ok(())
    }

    fn check_directory(directory: &Path) -> Result<()> {
        if !directory.is_absolute() {
            return Err(CommandError::InvalidArgument(format!(
                "working directory must be an absolute path: {}",
                directory.display()
            )));
        }
        Ok(())
    }

    /// Run a command to completion and return its full captured output.
    /// Defaults: 15 s timeout, 500 lines kept per stream. A timeout kills the
    /// child and surfaces [`CommandError::Timeout`] carrying the partial
    /// result.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<CommandResult> {
        self.check_allowed(&request.command)?;
        Self::check_directory(&request.directory)?;
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let limit = request.limit_lines.unwrap_or(DEFAULT_LIMIT_LINES);
        let started = Instant::now();
        let description = format!("Execute: {}", request.command.join(" "));

        let pid = self
            .manager
            .start_process(ProcessSpec {
                command: request.command,
                directory: request.directory,
                description,
                stdin: request.stdin,
                timeout: Some(timeout),
                envs: request.envs,
                encoding: Some(self.resolve_encoding(request.encoding)),
                labels: Vec::new(),
            })
            .await?;

        let info = self
            .manager
            .wait_for_completion(&pid, Some(timeout + WAIT_SLACK))
            .await?;
        let stdout = self.collect_channel(&pid, OutputChannel::Stdout, limit).await?;
        let stderr = self.collect_channel(&pid, OutputChannel::Stderr, limit).await?;
        let result = CommandResult {
            stdout,
            stderr,
            exit_status: info.status,
            exit_code: info.exit_code.unwrap_or(-1),
            duration: started.elapsed(),
        };
        if info.status == ProcessStatus::Terminated && result.exit_code == TIMEOUT_EXIT_CODE {
            return Err(CommandError::Timeout {
                timeout_secs: timeout.as_secs(),
                partial: Box::new(result),
            });
        }
        Ok(result)
    }

    async fn collect_channel(
        &self,
        pid: &str,
        channel: OutputChannel,
        limit: usize,
    ) -> Result<String> {
        let entries = self
            .manager
            .read_output(pid, channel, &OutputQuery::default())
            .await?;
        let total = entries.len();
        let mut lines: Vec<String> = entries.into_iter().map(|entry| entry.text).collect();
        let mut text = String::new();
        if total > limit {
            lines.drain(..total - limit);
            text.push_str(&format!(
                "[truncated: showing last {limit} of {total} lines]\n"
            ));
        }
        text.push_str(&lines.join("\n"));
        Ok(text)
    }

    /// Spawn and return the process id immediately. No timeout default: the
    /// process runs until it exits or is stopped.
    pub async fn start_background(&self, request: StartBackgroundRequest) -> Result<String> {
        self.check_allowed(&request.command)?;
        Self::check_directory(&request.directory)?;
        self.manager
            .start_process(ProcessSpec {
                command: request.command,
                directory: request.directory,
                description: request.description,
                stdin: request.stdin,
                timeout: request.timeout,
                envs: request.envs,
                encoding: Some(self.resolve_encoding(request.encoding)),
                labels: request.labels,
            })
            .await
    }

    fn resolve_encoding(&self, requested: Option<String>) -> String {
        requested
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| self.config.default_encoding.clone())
    }

    pub async fn list(
        &self,
        status: Option<ProcessStatus>,
        labels: &[String],
    ) -> Vec<ProcessInfo> {
        self.manager.list_processes(status, labels).await
    }

    pub async fn detail(&self, pid: &str) -> Result<ProcessInfo> {
        self.manager.get_process_info(pid).await
    }

    pub async fn stop(&self, pid: &str, force: bool, reason: Option<String>) -> Result<()> {
        self.manager.stop_process(pid, force, reason).await
    }

    pub async fn clean(&self, pids: &[String]) -> Result<BTreeMap<String, CleanStatus>> {
        self.manager.clean_processes(pids).await
    }

    /// Retrieve logs as a header chunk plus per-channel content chunks of at
    /// most `limit_lines` lines each. When `grep` is set, filtering happens
    /// before `tail` so the tail is taken over the matching lines.
    pub async fn logs(&self, request: LogsRequest) -> Result<Vec<LogChunk>> {
        let grep = request
            .grep
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| {
                CommandError::InvalidArgument(format!("invalid grep pattern: {err}"))
            })?;
        if request.limit_lines == 0 {
            return Err(CommandError::InvalidArgument(
                "limit_lines must be positive".to_string(),
            ));
        }
        let time_format = request
            .time_prefix_format
            .clone()
            .unwrap_or_else(|| DEFAULT_TIME_PREFIX_FORMAT.to_string());
        if request.add_time_prefix {
            validate_time_format(&time_format)?;
        }

        let info = self.manager.get_process_info(&request.pid).await?;
        let mut chunks = vec![LogChunk {
            channel: None,
            text: render_header(&info),
        }];
        if !request.with_stdout && !request.with_stderr {
            return Ok(chunks);
        }

        let mut channels = Vec::new();
        if request.with_stdout {
            channels.push(OutputChannel::Stdout);
        }
        if request.with_stderr {
            channels.push(OutputChannel::Stderr);
        }

        let deadline = Instant::now() + request.follow;
        let watcher = self.manager.watch_output(&request.pid).await?;
        let collected: Vec<Vec<OutputEntry>> = loop {
            let mut per_channel = Vec::with_capacity(channels.len());
            for channel in &channels {
                per_channel.push(
                    self.read_filtered(&request.pid, *channel, &request, grep.as_ref())
                        .await?,
                );
            }
            if entries_look_complete(&per_channel, request.tail) {
                break per_channel;
            }
            let running = self.manager.get_process_info(&request.pid).await?.status
                == ProcessStatus::Running;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !running || remaining.is_zero() {
                break per_channel;
            }
            let notified = watcher.notified();
            tokio::select! {
                _ = notified => {}
                _ = sleep(remaining) => {}
            }
        };

        for (channel, entries) in channels.iter().zip(collected) {
            if entries.is_empty() {
                continue;
            }
            let lines: Vec<String> = entries
                .iter()
                .map(|entry| {
                    if request.add_time_prefix {
                        format!("[{}] {}", entry.timestamp.format(&time_format), entry.text)
                    } else {
                        entry.text.clone()
                    }
                })
                .collect();
            for block in lines.chunks(request.limit_lines) {
                chunks.push(LogChunk {
                    channel: Some(*channel),
                    text: block.join("\n"),
                });
            }
        }
        Ok(chunks)
    }

    async fn read_filtered(
        &self,
        pid: &str,
        channel: OutputChannel,
        request: &LogsRequest,
        grep: Option<&Regex>,
    ) -> Result<Vec<OutputEntry>> {
        let query = OutputQuery {
            since: request.since,
            until: request.until,
            // With a filter active the tail must be taken after filtering.
            tail: if grep.is_some() { None } else { request.tail },
        };
        let mut entries = self.manager.read_output(pid, channel, &query).await?;
        if let Some(regex) = grep {
            entries = apply_grep(entries, regex, request.grep_mode);
            if let Some(tail) = request.tail
                && entries.len() > tail
            {
                entries.drain(..entries.len() - tail);
            }
        }
        Ok(entries)
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

fn apply_grep(entries: Vec<OutputEntry>, regex: &Regex, mode: GrepMode) -> Vec<OutputEntry> {
    match mode {
        GrepMode::Line => entries
            .into_iter()
            .filter(|entry| regex.is_match(&entry.text))
            .collect(),
        GrepMode::Content => entries
            .into_iter()
            .flat_map(|entry| {
                let matches: Vec<OutputEntry> = regex
                    .find_iter(&entry.text)
                    .map(|found| OutputEntry {
                        timestamp: entry.timestamp,
                        channel: entry.channel,
                        text: found.as_str().to_string(),
                    })
                    .collect();
                matches
            })
            .collect(),
    }
}

/// With `tail=N` the result looks complete once every requested channel has
/// N entries; without it, once anything arrived at all.
fn entries_look_complete(per_channel: &[Vec<OutputEntry>], tail: Option<usize>) -> bool {
    match tail {
        Some(tail) => per_channel.iter().all(|entries| entries.len() >= tail),
        None => per_channel.iter().any(|entries| !entries.is_empty()),
    }
}

fn render_header(info: &ProcessInfo) -> String {
    let mut header = format!(
        "process {} (status: {})\ncommand: {}\ndescription: {}",
        info.pid,
        info.status,
        info.command.join(" "),
        info.description
    );
    if let Some(code) = info.exit_code {
        header.push_str(&format!("\nexit code: {code}"));
    }
    header
}

fn validate_time_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(CommandError::InvalidArgument(format!(
            "invalid time prefix format: {format}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry(text: &str) -> OutputEntry {
        OutputEntry {
            timestamp: Utc.timestamp_micros(1_700_000_000_000_000).unwrap(),
            channel: OutputChannel::Stdout,
            text: text.to_string(),
        }
    }

    #[test]
    fn grep_line_keeps_whole_matching_lines() {
        let entries = ["a", "bb", "ccc", "dd", "eee"].map(entry).to_vec();
        let regex = Regex::new("^.{2,}$").unwrap();
        let filtered = apply_grep(entries, &regex, GrepMode::Line);
        let texts: Vec<&str> = filtered.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["bb", "ccc", "dd", "eee"]);
    }

    #[test]
    fn grep_content_yields_match_substrings() {
        let entries = vec![entry("error=42 trailing"), entry("noise"), entry("error=7")];
        let regex = Regex::new(r"error=(\d+)").unwrap();
        let filtered = apply_grep(entries, &regex, GrepMode::Content);
        let texts: Vec<&str> = filtered.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["error=42", "error=7"]);
    }

    #[test]
    fn grep_content_yields_every_match_in_a_line() {
        let entries = vec![entry("x=1 x=2 x=3")];
        let regex = Regex::new(r"x=\d").unwrap();
        let filtered = apply_grep(entries, &regex, GrepMode::Content);
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn completeness_without_tail_needs_any_output() {
        assert!(!entries_look_complete(&[vec![]], None));
        assert!(entries_look_complete(&[vec![entry("x")]], None));
    }

    #[test]
    fn completeness_with_tail_needs_enough_entries() {
        let three = vec![entry("a"), entry("b"), entry("c")];
        assert!(entries_look_complete(&[three.clone()], Some(3)));
        assert!(!entries_look_complete(&[three], Some(4)));
    }

    #[test]
    fn time_format_validation() {
        assert!(validate_time_format("%Y-%m-%d %H:%M:%S%.6f").is_ok());
        assert!(validate_time_format("%H:%M").is_ok());
        assert!(validate_time_format("%Q is not a thing").is_err());
    }

    #[test]
    fn relative_directory_is_rejected() {
        let err = CommandExecutor::check_directory(Path::new("relative/dir"))
            .expect_err("relative path must be rejected");
        assert!(matches!(err, CommandError::InvalidArgument(_)));
        assert!(CommandExecutor::check_directory(Path::new("/tmp")).is_ok());
    }

    #[test]
    fn header_includes_exit_code_only_when_terminal() {
        let mut info = ProcessInfo {
            pid: "abc123".to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            directory: PathBuf::from("/tmp"),
            description: "test".to_string(),
            encoding: "utf-8".to_string(),
            envs: HashMap::new(),
            labels: Vec::new(),
            timeout_secs: None,
            status: ProcessStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            exit_code: None,
            error_message: None,
        };
        assert!(!render_header(&info).contains("exit code"));
        info.status = ProcessStatus::Completed;
        info.exit_code = Some(0);
        let header = render_header(&info);
        assert!(header.contains("exit code: 0"));
        assert!(header.contains("command: echo hi"));
    }
}
