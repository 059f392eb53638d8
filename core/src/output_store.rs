//! Durable, timestamped, range-queryable append log for process output.
//!
//! The store knows nothing about processes beyond the opaque id it is given.
//! Layout on disk is one directory per id with one file per channel
//! (`stdout.log`, `stderr.log`); each record is a single JSON line carrying a
//! microsecond timestamp and the decoded text. Appends write whole lines and
//! flush, so concurrent readers only ever observe completed records: a torn
//! trailing line is skipped and picked up on the next read.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::sync::Notify;

use crate::error::CommandError;
use crate::error::Result;

/// Output stream of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl OutputChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout.log",
            Self::Stderr => "stderr.log",
        }
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputChannel {
    type Err = CommandError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(CommandError::InvalidArgument(format!(
                "invalid output channel: {other}"
            ))),
        }
    }
}

/// One decoded line of process output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: OutputChannel,
    pub text: String,
}

/// Filter for [`OutputStore::read`]. The time window is half-open: `since`
/// inclusive, `until` exclusive. `tail` keeps the last N entries that also
/// satisfy the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub tail: Option<usize>,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    ts: i64,
    text: &'a str,
}

#[derive(Deserialize)]
struct Record {
    ts: i64,
    text: String,
}

struct LogSet {
    dir: PathBuf,
    /// Fires on every append to any channel of this process.
    appended: Arc<Notify>,
    /// Last stamp handed out per channel; appends never go backwards even if
    /// the wall clock does.
    last_ts: StdMutex<HashMap<OutputChannel, i64>>,
    /// Serializes writers on the same process so records land whole.
    write_gate: Mutex<()>,
}

/// File-backed output store, one log per `(process id, channel)` pair.
pub struct OutputStore {
    root: PathBuf,
    logs: Mutex<HashMap<String, Arc<LogSet>>>,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Create the per-process directory and start tracking the id. All other
    /// operations require the id to be registered first.
    pub async fn register(&self, process_id: &str) -> Result<()> {
        if process_id.is_empty() {
            return Err(CommandError::InvalidArgument(
                "process id cannot be empty".to_string(),
            ));
        }
        let dir = self.root.join(process_id);
        fs::create_dir_all(&dir).await.map_err(CommandError::storage)?;
        let set = Arc::new(LogSet {
            dir,
            appended: Arc::new(Notify::new()),
            last_ts: StdMutex::new(HashMap::new()),
            write_gate: Mutex::new(()),
        });
        self.logs.lock().await.insert(process_id.to_string(), set);
        Ok(())
    }

    async fn log_set(&self, process_id: &str) -> Result<Arc<LogSet>> {
        self.logs
            .lock()
            .await
            .get(process_id)
            .cloned()
            .ok_or_else(|| CommandError::ProcessNotFound(process_id.to_string()))
    }

    /// Watcher that fires whenever any channel of `process_id` receives
    /// output. Used by the follow layer above; waiting on it never misses an
    /// append that happens after the call.
    pub async fn watcher(&self, process_id: &str) -> Result<Arc<Notify>> {
        Ok(self.log_set(process_id).await?.appended.clone())
    }

    /// Append one or more lines, stamping each with the current time.
    pub async fn append(
        &self,
        process_id: &str,
        channel: OutputChannel,
        lines: Vec<String>,
    ) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let set = self.log_set(process_id).await?;

        let mut buf = Vec::with_capacity(lines.iter().map(|line| line.len() + 32).sum());
        {
            let mut last = set.last_ts.lock().expect("last_ts lock poisoned");
            let floor = last.entry(channel).or_insert(0);
            for text in &lines {
                let ts = Utc::now().timestamp_micros().max(*floor);
                *floor = ts;
                serde_json::to_writer(&mut buf, &RecordRef { ts, text })
                    .map_err(|err| CommandError::storage(err.into()))?;
                buf.push(b'\n');
            }
        }

        let gate = set.write_gate.lock().await;
        let path = set.dir.join(channel.file_name());
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(CommandError::storage)?;
        file.write_all(&buf).await.map_err(CommandError::storage)?;
        file.flush().await.map_err(CommandError::storage)?;
        drop(gate);

        set.appended.notify_waiters();
        Ok(())
    }

    /// Read the entries present at the call instant, in append order. A
    /// registered id whose channel never produced output yields an empty
    /// sequence; an unknown id is an error.
    ///
    /// `tail` is implemented as a bounded ring over the streaming scan, so
    /// logs larger than memory stay readable.
    pub async fn read(
        &self,
        process_id: &str,
        channel: OutputChannel,
        query: &OutputQuery,
    ) -> Result<Vec<OutputEntry>> {
        let set = self.log_set(process_id).await?;
        let path = set.dir.join(channel.file_name());
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CommandError::OutputRetrieval(format!(
                    "failed to open {}: {err}",
                    path.display()
                )));
            }
        };

        let since_us = query.since.map(|t| t.timestamp_micros());
        let until_us = query.until.map(|t| t.timestamp_micros());
        let mut ring: VecDeque<OutputEntry> = VecDeque::new();
        let mut lines = BufReader::new(file).lines();
        loop {
            let line = lines.next_line().await.map_err(|err| {
                CommandError::OutputRetrieval(format!(
                    "failed to read {}: {err}",
                    path.display()
                ))
            })?;
            let Some(line) = line else { break };
            // A torn trailing line means a write is in flight; skip it.
            let Ok(record) = serde_json::from_str::<Record>(&line) else {
                continue;
            };
            if since_us.is_some_and(|since| record.ts < since) {
                continue;
            }
            if until_us.is_some_and(|until| record.ts >= until) {
                continue;
            }
            let Some(timestamp) = DateTime::from_timestamp_micros(record.ts) else {
                continue;
            };
            ring.push_back(OutputEntry {
                timestamp,
                channel,
                text: record.text,
            });
            if let Some(tail) = query.tail
                && ring.len() > tail
            {
                ring.pop_front();
            }
        }
        Ok(ring.into())
    }

    /// Delete every channel of this process and stop tracking the id.
    pub async fn clear(&self, process_id: &str) -> Result<()> {
        let set = self
            .logs
            .lock()
            .await
            .remove(process_id)
            .ok_or_else(|| CommandError::ProcessNotFound(process_id.to_string()))?;
        match fs::remove_dir_all(&set.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CommandError::storage(err)),
        }
    }

    /// Release all in-memory state. Files are opened per operation, so there
    /// is nothing left to flush.
    pub async fn shutdown(&self) {
        self.logs.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn store() -> (OutputStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        (OutputStore::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn append_then_read_roundtrip() {
        let (store, _dir) = store();
        store.register("p1").await.expect("register");
        store
            .append(
                "p1",
                OutputChannel::Stdout,
                vec!["one".to_string(), String::new(), "three".to_string()],
            )
            .await
            .expect("append");

        let entries = store
            .read("p1", OutputChannel::Stdout, &OutputQuery::default())
            .await
            .expect("read");
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "", "three"]);
        assert!(entries.iter().all(|e| e.channel == OutputChannel::Stdout));
    }

    #[tokio::test]
    async fn timestamps_are_non_decreasing() {
        let (store, _dir) = store();
        store.register("p1").await.expect("register");
        for i in 0..50 {
            store
                .append("p1", OutputChannel::Stdout, vec![format!("line {i}")])
                .await
                .expect("append");
        }
        let entries = store
            .read("p1", OutputChannel::Stdout, &OutputQuery::default())
            .await
            .expect("read");
        assert_eq!(entries.len(), 50);
        for pair in entries.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn tail_returns_most_recent_entries() {
        let (store, _dir) = store();
        store.register("p1").await.expect("register");
        let lines: Vec<String> = (0..10).map(|i| format!("l{i}")).collect();
        store
            .append("p1", OutputChannel::Stdout, lines)
            .await
            .expect("append");

        let entries = store
            .read(
                "p1",
                OutputChannel::Stdout,
                &OutputQuery {
                    tail: Some(3),
                    ..Default::default()
                },
            )
            .await
            .expect("read");
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["l7", "l8", "l9"]);
    }

    #[tokio::test]
    async fn time_window_is_half_open() {
        let (store, _dir) = store();
        store.register("p1").await.expect("register");
        store
            .append("p1", OutputChannel::Stdout, vec!["early".to_string()])
            .await
            .expect("append");
        let entries = store
            .read("p1", OutputChannel::Stdout, &OutputQuery::default())
            .await
            .expect("read");
        let cut = entries[0].timestamp;

        // until is exclusive: a window ending exactly at the entry's stamp
        // must not contain it, while since at the stamp must.
        let before = store
            .read(
                "p1",
                OutputChannel::Stdout,
                &OutputQuery {
                    until: Some(cut),
                    ..Default::default()
                },
            )
            .await
            .expect("read");
        assert!(before.is_empty());

        let from = store
            .read(
                "p1",
                OutputChannel::Stdout,
                &OutputQuery {
                    since: Some(cut),
                    ..Default::default()
                },
            )
            .await
            .expect("read");
        assert_eq!(from.len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_process_not_found() {
        let (store, _dir) = store();
        let err = store
            .read("ghost", OutputChannel::Stdout, &OutputQuery::default())
            .await
            .expect_err("read should fail");
        assert!(matches!(err, CommandError::ProcessNotFound(_)));

        let err = store.clear("ghost").await.expect_err("clear should fail");
        assert!(matches!(err, CommandError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn read_on_silent_channel_is_empty() {
        let (store, _dir) = store();
        store.register("p1").await.expect("register");
        let entries = store
            .read("p1", OutputChannel::Stderr, &OutputQuery::default())
            .await
            .expect("read");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn clear_removes_logs_and_id() {
        let (store, dir) = store();
        store.register("p1").await.expect("register");
        store
            .append("p1", OutputChannel::Stdout, vec!["x".to_string()])
            .await
            .expect("append");
        store.clear("p1").await.expect("clear");

        assert!(!dir.path().join("p1").exists());
        let err = store
            .read("p1", OutputChannel::Stdout, &OutputQuery::default())
            .await
            .expect_err("read should fail after clear");
        assert!(matches!(err, CommandError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let (store, dir) = store();
        store.register("p1").await.expect("register");
        store
            .append("p1", OutputChannel::Stdout, vec!["whole".to_string()])
            .await
            .expect("append");

        // Simulate a write caught mid-record.
        let path = dir.path().join("p1").join("stdout.log");
        let mut raw = std::fs::read(&path).expect("read log file");
        raw.extend_from_slice(b"{\"ts\":1,\"te");
        std::fs::write(&path, raw).expect("write log file");

        let entries = store
            .read("p1", OutputChannel::Stdout, &OutputQuery::default())
            .await
            .expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "whole");
    }
}
