//! End-to-end lifecycle scenarios against real children. Unix-only: the
//! fixtures lean on `echo`, `sh` and `sleep`.
#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use os_server_core::CleanStatus;
use os_server_core::CommandError;
use os_server_core::CommandExecutor;
use os_server_core::ExecuteRequest;
use os_server_core::OutputStore;
use os_server_core::ProcessManager;
use os_server_core::ProcessStatus;
use os_server_core::ServerConfig;
use os_server_core::StartBackgroundRequest;
use tempfile::TempDir;

fn workdir() -> PathBuf {
    std::env::temp_dir()
}

fn setup(allowed: &[&str], retention: Duration) -> (Arc<CommandExecutor>, TempDir) {
    let storage = TempDir::new().expect("tempdir");
    let mut config = ServerConfig::with_storage_path(storage.path().to_path_buf());
    config.allowed_commands = allowed.iter().map(|s| s.to_string()).collect();
    config.process_retention = retention;
    let config = Arc::new(config);
    let store = Arc::new(OutputStore::new(&config.output_storage_path));
    let manager = ProcessManager::new(store, config.process_retention);
    (Arc::new(CommandExecutor::new(manager, config)), storage)
}

fn execute_request(command: &[&str]) -> ExecuteRequest {
    ExecuteRequest {
        command: command.iter().map(|s| s.to_string()).collect(),
        directory: workdir(),
        ..Default::default()
    }
}

fn background_request(command: &[&str], description: &str) -> StartBackgroundRequest {
    StartBackgroundRequest {
        command: command.iter().map(|s| s.to_string()).collect(),
        directory: workdir(),
        description: description.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn execute_echo_captures_stdout() {
    let (executor, _storage) = setup(&["echo"], Duration::from_secs(3600));
    let started = Instant::now();
    let result = executor
        .execute(execute_request(&["echo", "hi"]))
        .await
        .expect("execute");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.exit_status, ProcessStatus::Completed);
    assert_eq!(result.stdout, "hi");
    assert_eq!(result.stderr, "");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn execute_rejects_disallowed_command() {
    let (executor, _storage) = setup(&["echo"], Duration::from_secs(3600));
    let err = executor
        .execute(execute_request(&["cat", "/etc/hosts"]))
        .await
        .expect_err("disallowed command must fail");
    assert!(matches!(err, CommandError::InvalidArgument(_)));
    // The registry must be untouched.
    assert!(executor.list(None, &[]).await.is_empty());
}

#[tokio::test]
async fn execute_rejects_relative_directory() {
    let (executor, _storage) = setup(&["echo"], Duration::from_secs(3600));
    let mut request = execute_request(&["echo", "hi"]);
    request.directory = PathBuf::from("relative");
    let err = executor.execute(request).await.expect_err("must fail");
    assert!(matches!(err, CommandError::InvalidArgument(_)));
}

#[tokio::test]
async fn execute_missing_binary_is_execution_error() {
    let (executor, _storage) = setup(&["definitely-not-a-binary"], Duration::from_secs(3600));
    let err = executor
        .execute(execute_request(&["definitely-not-a-binary"]))
        .await
        .expect_err("missing binary must fail");
    assert!(matches!(err, CommandError::Execution(_)));
}

#[tokio::test]
async fn execute_timeout_returns_partial_output() {
    let (executor, _storage) = setup(&["sh"], Duration::from_secs(3600));
    let started = Instant::now();
    let mut request = execute_request(&["sh", "-c", "echo A; sleep 100"]);
    request.timeout = Some(Duration::from_secs(1));
    let err = executor.execute(request).await.expect_err("must time out");
    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        CommandError::Timeout { timeout_secs, partial } => {
            assert_eq!(timeout_secs, 1);
            assert!(partial.stdout.contains('A'), "stdout: {:?}", partial.stdout);
            assert_eq!(partial.exit_status, ProcessStatus::Terminated);
            assert_eq!(partial.exit_code, 124);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn execute_failing_command_reports_exit_code() {
    let (executor, _storage) = setup(&["sh"], Duration::from_secs(3600));
    let result = executor
        .execute(execute_request(&["sh", "-c", "echo oops >&2; exit 3"]))
        .await
        .expect("execute");
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.exit_status, ProcessStatus::Failed);
    assert_eq!(result.stderr, "oops");
}

#[tokio::test]
async fn execute_passes_stdin_and_env_overlay() {
    let (executor, _storage) = setup(&["sh"], Duration::from_secs(3600));
    let mut request = execute_request(&["sh", "-c", "cat; printf '%s' \"$MARKER\""]);
    request.stdin = Some(b"from-stdin ".to_vec());
    request.envs.insert("MARKER".to_string(), "from-env".to_string());
    let result = executor.execute(request).await.expect("execute");
    assert_eq!(result.stdout, "from-stdin from-env");
}

#[tokio::test]
async fn background_lifecycle_start_stop_clean() {
    let (executor, _storage) = setup(&["sleep"], Duration::from_secs(3600));
    let pid = executor
        .start_background(background_request(&["sleep", "5"], "x"))
        .await
        .expect("start");

    let running = executor.list(Some(ProcessStatus::Running), &[]).await;
    assert!(running.iter().any(|info| info.pid == pid));

    let started = Instant::now();
    executor.stop(&pid, false, None).await.expect("stop");
    assert!(started.elapsed() < Duration::from_secs(3));
    let info = executor.detail(&pid).await.expect("detail");
    assert_eq!(info.status, ProcessStatus::Terminated);
    assert!(info.end_time.is_some());

    let results = executor.clean(&[pid.clone()]).await.expect("clean");
    assert_eq!(results.get(&pid), Some(&CleanStatus::Cleaned));
    let err = executor.detail(&pid).await.expect_err("detail after clean");
    assert!(matches!(err, CommandError::ProcessNotFound(_)));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (executor, _storage) = setup(&["sleep"], Duration::from_secs(3600));
    let pid = executor
        .start_background(background_request(&["sleep", "5"], "x"))
        .await
        .expect("start");
    executor.stop(&pid, true, None).await.expect("first stop");
    executor.stop(&pid, true, None).await.expect("second stop");
    let info = executor.detail(&pid).await.expect("detail");
    assert_eq!(info.status, ProcessStatus::Terminated);
}

#[tokio::test]
async fn stop_reason_lands_in_error_message() {
    let (executor, _storage) = setup(&["sleep"], Duration::from_secs(3600));
    let pid = executor
        .start_background(background_request(&["sleep", "5"], "x"))
        .await
        .expect("start");
    executor
        .stop(&pid, true, Some("operator request".to_string()))
        .await
        .expect("stop");
    let info = executor.detail(&pid).await.expect("detail");
    assert_eq!(info.error_message.as_deref(), Some("operator request"));
}

#[tokio::test]
async fn clean_reports_per_id_outcomes() {
    let (executor, _storage) = setup(&["sleep", "echo"], Duration::from_secs(3600));
    let running = executor
        .start_background(background_request(&["sleep", "5"], "runner"))
        .await
        .expect("start");
    let finished = executor
        .start_background(background_request(&["echo", "done"], "quick"))
        .await
        .expect("start");
    executor
        .manager()
        .wait_for_completion(&finished, Some(Duration::from_secs(5)))
        .await
        .expect("wait");

    let ids = vec![running.clone(), finished.clone(), "missing".to_string()];
    let results = executor.clean(&ids).await.expect("clean");
    assert_eq!(results.get(&running), Some(&CleanStatus::Running));
    assert_eq!(results.get(&finished), Some(&CleanStatus::Cleaned));
    assert_eq!(results.get("missing"), Some(&CleanStatus::NotFound));

    // Idempotence over already-cleaned ids: they report not-found, no error.
    let again = executor.clean(&[finished.clone()]).await.expect("clean");
    assert_eq!(results.len(), 3);
    assert_eq!(again.get(&finished), Some(&CleanStatus::NotFound));

    executor.stop(&running, true, None).await.expect("stop");
}

#[tokio::test]
async fn clean_rejects_empty_id_list() {
    let (executor, _storage) = setup(&[], Duration::from_secs(3600));
    let err = executor.clean(&[]).await.expect_err("empty list must fail");
    assert!(matches!(err, CommandError::InvalidArgument(_)));
}

#[tokio::test]
async fn labels_filter_is_subset_match() {
    let (executor, _storage) = setup(&["echo"], Duration::from_secs(3600));
    let mut pids = Vec::new();
    for labels in [vec!["a"], vec!["a", "b"], vec!["b"]] {
        let mut request = background_request(&["echo", "x"], "labelled");
        request.labels = labels.into_iter().map(String::from).collect();
        pids.push(executor.start_background(request).await.expect("start"));
    }
    for pid in &pids {
        executor
            .manager()
            .wait_for_completion(pid, Some(Duration::from_secs(5)))
            .await
            .expect("wait");
    }

    let with_a = executor.list(None, &["a".to_string()]).await;
    assert_eq!(with_a.len(), 2);
    assert!(with_a.iter().all(|info| info.labels.contains(&"a".to_string())));

    let with_ab = executor
        .list(None, &["a".to_string(), "b".to_string()])
        .await;
    assert_eq!(with_ab.len(), 1);
}

#[tokio::test]
async fn retention_evicts_terminal_records_and_logs() {
    let (executor, storage) = setup(&["echo"], Duration::from_secs(1));
    let pid = executor
        .start_background(background_request(&["echo", "gone"], "short-lived"))
        .await
        .expect("start");
    executor
        .manager()
        .wait_for_completion(&pid, Some(Duration::from_secs(5)))
        .await
        .expect("wait");
    assert!(storage.path().join(&pid).exists());

    // Retention is 1 s and the sweeper runs on a 1 s cadence.
    tokio::time::sleep(Duration::from_millis(2_600)).await;
    assert!(executor.list(None, &[]).await.is_empty());
    assert!(!storage.path().join(&pid).exists());
}

#[tokio::test]
async fn list_orders_by_start_time() {
    let (executor, _storage) = setup(&["echo"], Duration::from_secs(3600));
    let mut pids = Vec::new();
    for i in 0..3 {
        let request = background_request(&["echo", "x"], &format!("p{i}"));
        pids.push(executor.start_background(request).await.expect("start"));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let listed = executor.list(None, &[]).await;
    let order: Vec<&str> = listed.iter().map(|info| info.pid.as_str()).collect();
    let expected: Vec<&str> = pids.iter().map(String::as_str).collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn shutdown_force_stops_running_processes() {
    let (executor, _storage) = setup(&["sleep"], Duration::from_secs(3600));
    let pid = executor
        .start_background(background_request(&["sleep", "30"], "stubborn"))
        .await
        .expect("start");
    executor.shutdown().await;
    let info = executor.detail(&pid).await.expect("detail");
    assert_eq!(info.status, ProcessStatus::Terminated);
}
