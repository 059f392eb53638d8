//! Log retrieval scenarios: tail, grep, time prefixes, chunking and follow.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use os_server_core::CommandError;
use os_server_core::CommandExecutor;
use os_server_core::GrepMode;
use os_server_core::LogsRequest;
use os_server_core::OutputChannel;
use os_server_core::OutputStore;
use os_server_core::ProcessManager;
use os_server_core::ServerConfig;
use os_server_core::StartBackgroundRequest;
use tempfile::TempDir;

fn setup(allowed: &[&str]) -> (Arc<CommandExecutor>, TempDir) {
    let storage = TempDir::new().expect("tempdir");
    let mut config = ServerConfig::with_storage_path(storage.path().to_path_buf());
    config.allowed_commands = allowed.iter().map(|s| s.to_string()).collect();
    let config = Arc::new(config);
    let store = Arc::new(OutputStore::new(&config.output_storage_path));
    let manager = ProcessManager::new(store, config.process_retention);
    (Arc::new(CommandExecutor::new(manager, config)), storage)
}

/// Run a short shell script to completion and return its pid.
async fn run_script(executor: &CommandExecutor, script: &str) -> String {
    let pid = executor
        .start_background(StartBackgroundRequest {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            directory: std::env::temp_dir(),
            description: "fixture".to_string(),
            ..Default::default()
        })
        .await
        .expect("start");
    executor
        .manager()
        .wait_for_completion(&pid, Some(Duration::from_secs(5)))
        .await
        .expect("wait");
    pid
}

fn content_lines(chunks: &[os_server_core::LogChunk], channel: OutputChannel) -> Vec<String> {
    chunks
        .iter()
        .filter(|chunk| chunk.channel == Some(channel))
        .flat_map(|chunk| chunk.text.lines().map(String::from).collect::<Vec<_>>())
        .collect()
}

#[tokio::test]
async fn tail_after_grep_returns_most_recent_matches() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "printf 'a\\nbb\\nccc\\ndd\\neee\\n'").await;

    let mut request = LogsRequest::new(&pid);
    request.tail = Some(3);
    request.grep = Some("^.{2,}$".to_string());
    request.add_time_prefix = false;
    request.follow = Duration::ZERO;
    let chunks = executor.logs(request).await.expect("logs");

    assert_eq!(
        content_lines(&chunks, OutputChannel::Stdout),
        vec!["ccc", "dd", "eee"]
    );
}

#[tokio::test]
async fn grep_content_mode_extracts_substrings() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "printf 'error=42 noise\\nclean\\nerror=7\\n'").await;

    let mut request = LogsRequest::new(&pid);
    request.grep = Some(r"error=(\d+)".to_string());
    request.grep_mode = GrepMode::Content;
    request.add_time_prefix = false;
    request.follow = Duration::ZERO;
    let chunks = executor.logs(request).await.expect("logs");

    assert_eq!(
        content_lines(&chunks, OutputChannel::Stdout),
        vec!["error=42", "error=7"]
    );
}

#[tokio::test]
async fn invalid_grep_is_invalid_argument() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "echo hi").await;

    let mut request = LogsRequest::new(&pid);
    request.grep = Some("(unclosed".to_string());
    let err = executor.logs(request).await.expect_err("bad regex");
    assert!(matches!(err, CommandError::InvalidArgument(_)));
}

#[tokio::test]
async fn stderr_is_excluded_by_default() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "echo out; echo err >&2").await;

    let mut request = LogsRequest::new(&pid);
    request.add_time_prefix = false;
    request.follow = Duration::ZERO;
    let chunks = executor.logs(request.clone()).await.expect("logs");
    assert_eq!(content_lines(&chunks, OutputChannel::Stdout), vec!["out"]);
    assert!(content_lines(&chunks, OutputChannel::Stderr).is_empty());

    request.with_stderr = true;
    let chunks = executor.logs(request).await.expect("logs");
    assert_eq!(content_lines(&chunks, OutputChannel::Stderr), vec!["err"]);
}

#[tokio::test]
async fn header_chunk_describes_the_process() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "echo hi").await;

    let mut request = LogsRequest::new(&pid);
    request.follow = Duration::ZERO;
    let chunks = executor.logs(request).await.expect("logs");

    let header = &chunks[0];
    assert!(header.channel.is_none());
    assert!(header.text.contains(&pid));
    assert!(header.text.contains("completed"));
    assert!(header.text.contains("exit code: 0"));
}

#[tokio::test]
async fn time_prefix_is_applied_and_optional() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "echo stamped").await;

    let mut request = LogsRequest::new(&pid);
    request.follow = Duration::ZERO;
    let chunks = executor.logs(request.clone()).await.expect("logs");
    let lines = content_lines(&chunks, OutputChannel::Stdout);
    assert!(lines[0].starts_with('['), "line: {:?}", lines[0]);
    assert!(lines[0].ends_with("stamped"));

    request.add_time_prefix = false;
    let chunks = executor.logs(request.clone()).await.expect("logs");
    assert_eq!(content_lines(&chunks, OutputChannel::Stdout), vec!["stamped"]);

    request.add_time_prefix = true;
    request.time_prefix_format = Some("%H:%M".to_string());
    let chunks = executor.logs(request).await.expect("logs");
    let lines = content_lines(&chunks, OutputChannel::Stdout);
    // "[HH:MM] stamped"
    assert_eq!(lines[0].len(), "[00:00] stamped".len());
}

#[tokio::test]
async fn invalid_time_format_is_rejected() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "echo hi").await;

    let mut request = LogsRequest::new(&pid);
    request.time_prefix_format = Some("%Q nope".to_string());
    let err = executor.logs(request).await.expect_err("bad format");
    assert!(matches!(err, CommandError::InvalidArgument(_)));
}

#[tokio::test]
async fn output_is_chunked_by_limit_lines() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "seq 1 5").await;

    let mut request = LogsRequest::new(&pid);
    request.limit_lines = 2;
    request.add_time_prefix = false;
    request.follow = Duration::ZERO;
    let chunks = executor.logs(request).await.expect("logs");

    let sizes: Vec<usize> = chunks
        .iter()
        .filter(|chunk| chunk.channel == Some(OutputChannel::Stdout))
        .map(|chunk| chunk.text.lines().count())
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn follow_zero_never_blocks() {
    let (executor, _storage) = setup(&["sleep"]);
    let pid = executor
        .start_background(StartBackgroundRequest {
            command: vec!["sleep".to_string(), "5".to_string()],
            directory: std::env::temp_dir(),
            description: "quiet".to_string(),
            ..Default::default()
        })
        .await
        .expect("start");

    let mut request = LogsRequest::new(&pid);
    request.follow = Duration::ZERO;
    let started = Instant::now();
    let chunks = executor.logs(request).await.expect("logs");
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(chunks.len(), 1); // header only; the sleeper says nothing

    executor.stop(&pid, true, None).await.expect("stop");
}

#[tokio::test]
async fn follow_waits_for_late_output() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = executor
        .start_background(StartBackgroundRequest {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 0.3; echo late".to_string(),
            ],
            directory: std::env::temp_dir(),
            description: "late talker".to_string(),
            ..Default::default()
        })
        .await
        .expect("start");

    let mut request = LogsRequest::new(&pid);
    request.follow = Duration::from_secs(2);
    request.add_time_prefix = false;
    let chunks = executor.logs(request).await.expect("logs");
    assert_eq!(content_lines(&chunks, OutputChannel::Stdout), vec!["late"]);

    executor
        .manager()
        .wait_for_completion(&pid, Some(Duration::from_secs(5)))
        .await
        .expect("wait");
}

#[tokio::test]
async fn logs_for_unknown_pid_is_process_not_found() {
    let (executor, _storage) = setup(&["sh"]);
    let err = executor
        .logs(LogsRequest::new("ghost"))
        .await
        .expect_err("unknown pid");
    assert!(matches!(err, CommandError::ProcessNotFound(_)));
}

#[tokio::test]
async fn no_channels_requested_returns_header_only() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "echo hi").await;

    let mut request = LogsRequest::new(&pid);
    request.with_stdout = false;
    request.with_stderr = false;
    let chunks = executor.logs(request).await.expect("logs");
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].channel.is_none());
}

#[tokio::test]
async fn since_filter_cuts_older_entries() {
    let (executor, _storage) = setup(&["sh"]);
    let pid = run_script(&executor, "echo first").await;

    let mut request = LogsRequest::new(&pid);
    request.add_time_prefix = false;
    request.follow = Duration::ZERO;
    let chunks = executor.logs(request.clone()).await.expect("logs");
    assert_eq!(content_lines(&chunks, OutputChannel::Stdout), vec!["first"]);

    // A window starting after everything was written is empty.
    request.since = Some(chrono::Utc::now());
    let chunks = executor.logs(request).await.expect("logs");
    assert!(content_lines(&chunks, OutputChannel::Stdout).is_empty());
}
