//! MCP tool surface: the `command_*` family over the command executor and
//! the `fs_*` family over the filesystem service.
//!
//! This layer only translates: parameters deserialize into the core's
//! request types, and core results render into text content blocks. Domain
//! failures come back as tool error content with the core's own message, so
//! the error classification survives the transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Local;
use chrono::NaiveDateTime;
use chrono::TimeZone;
use chrono::Utc;
use rmcp::ErrorData as McpError;
use rmcp::RoleServer;
use rmcp::ServerHandler;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::tool::Parameters;
use rmcp::model::CallToolResult;
use rmcp::model::Content;
use rmcp::model::Implementation;
use rmcp::model::InitializeRequestParam;
use rmcp::model::InitializeResult;
use rmcp::model::ProtocolVersion;
use rmcp::model::ServerCapabilities;
use rmcp::model::ServerInfo;
use rmcp::schemars;
use rmcp::service::RequestContext;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;

use os_server_core::CommandError;
use os_server_core::CommandExecutor;
use os_server_core::CommandResult;
use os_server_core::ExecuteRequest;
use os_server_core::LogsRequest;
use os_server_core::ProcessInfo;
use os_server_core::StartBackgroundRequest;
use os_server_fs::FilesystemService;

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandExecuteParams {
    /// Program to execute; must appear in the server's allow-list.
    pub command: String,
    /// Arguments passed to the program, one element each. No shell parsing.
    #[serde(default)]
    pub args: Vec<String>,
    /// Absolute working directory for the execution.
    pub directory: String,
    /// Text piped to the child's stdin; the stream is closed right after.
    pub stdin: Option<String>,
    /// Maximum execution time in seconds (default 15).
    pub timeout: Option<u64>,
    /// Environment variables overlaid on the server environment.
    pub envs: Option<HashMap<String, String>>,
    /// Codec label used to decode output (e.g. "utf-8", "gbk").
    pub encoding: Option<String>,
    /// Maximum number of lines kept per output stream (default 500).
    pub limit_lines: Option<usize>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandBgStartParams {
    /// Program to execute; must appear in the server's allow-list.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Absolute working directory for the execution.
    pub directory: String,
    /// Human description of what this process is for.
    pub description: String,
    /// Labels for later filtering with command_ps_list.
    #[serde(default)]
    pub labels: Vec<String>,
    pub stdin: Option<String>,
    pub envs: Option<HashMap<String, String>>,
    pub encoding: Option<String>,
    /// Maximum run time in seconds; unbounded when absent.
    pub timeout: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandPsListParams {
    /// Keep only processes carrying every one of these labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Filter by status: running, completed, failed, terminated or error.
    pub status: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandPsStopParams {
    /// Id of the process to stop.
    pub pid: String,
    /// Kill immediately instead of terminating politely first.
    pub force: Option<bool>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandPsLogsParams {
    /// Id of the process to read output from.
    pub pid: String,
    /// Return only the last N entries per channel.
    pub tail: Option<usize>,
    /// Keep entries at or after this timestamp (ISO format).
    pub since: Option<String>,
    /// Keep entries strictly before this timestamp (ISO format).
    pub until: Option<String>,
    /// Include standard output (default true).
    pub with_stdout: Option<bool>,
    /// Include standard error (default false).
    pub with_stderr: Option<bool>,
    /// Prefix each line with its timestamp (default true).
    pub add_time_prefix: Option<bool>,
    /// strftime format for the timestamp prefix.
    pub time_prefix_format: Option<String>,
    /// Wait up to this many seconds for new output from a running process
    /// (default 1, 0 returns immediately).
    pub follow_seconds: Option<u64>,
    /// Maximum lines per returned content block (default 500).
    pub limit_lines: Option<usize>,
    /// Regular expression filter over the output.
    pub grep: Option<String>,
    /// "line" keeps whole matching lines, "content" only the matched text.
    pub grep_mode: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandPsCleanParams {
    /// Ids of terminal processes whose records and logs should be removed.
    pub pids: Vec<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandPsDetailParams {
    /// Id of the process to describe.
    pub pid: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct FsPathParams {
    /// Absolute path inside an allowed directory.
    pub path: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct FsPathsParams {
    /// Absolute paths inside the allowed directories.
    pub paths: Vec<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct FsWriteParams {
    /// Absolute path inside an allowed directory.
    pub path: String,
    /// Full new content of the file.
    pub content: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct FsEditOperation {
    /// Exact text to find; the first occurrence is replaced.
    pub old_text: String,
    /// Replacement text.
    pub new_text: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct FsEditParams {
    /// Absolute path inside an allowed directory.
    pub path: String,
    /// Edits applied in order; each replaces the first occurrence of its
    /// old text.
    pub edits: Vec<FsEditOperation>,
    /// Preview the resulting content without writing the file.
    pub dry_run: Option<bool>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct FsMoveParams {
    /// Absolute source path.
    pub source: String,
    /// Absolute destination path.
    pub destination: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct FsSearchParams {
    /// Absolute directory to search under.
    pub path: String,
    /// Glob pattern matched against file names (e.g. "*.rs").
    pub pattern: String,
    /// Glob patterns for file names to leave out (e.g. "*_test.rs").
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// The MCP handler. The CLI personalities construct it with the command
/// half, the filesystem half, or both; a disabled half answers its tools
/// with an explanatory error.
#[derive(Clone)]
pub struct OsServer {
    executor: Option<Arc<CommandExecutor>>,
    filesystem: Option<Arc<FilesystemService>>,
    tool_router: ToolRouter<OsServer>,
}

fn text_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text.into())])
}

fn error_result(err: impl std::fmt::Display) -> CallToolResult {
    CallToolResult::error(vec![Content::text(err.to_string())])
}

#[tool_router]
impl OsServer {
    pub fn new(
        executor: Option<Arc<CommandExecutor>>,
        filesystem: Option<Arc<FilesystemService>>,
    ) -> Self {
        Self {
            executor,
            filesystem,
            tool_router: Self::tool_router(),
        }
    }

    fn executor(&self) -> Result<&Arc<CommandExecutor>, CallToolResult> {
        self.executor
            .as_ref()
            .ok_or_else(|| error_result("command tools are not enabled on this server"))
    }

    fn filesystem(&self) -> Result<&Arc<FilesystemService>, CallToolResult> {
        self.filesystem
            .as_ref()
            .ok_or_else(|| error_result("filesystem tools are not enabled on this server"))
    }

    #[tool(
        description = "Execute a single command synchronously and return its exit code, stdout and stderr. No shell: the command is a program name plus an argument vector."
    )]
    pub async fn command_execute(
        &self,
        Parameters(params): Parameters<CommandExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(result) => return Ok(result),
        };
        let request = ExecuteRequest {
            command: assemble_argv(params.command, params.args),
            directory: PathBuf::from(params.directory),
            stdin: params.stdin.map(String::into_bytes),
            timeout: params.timeout.map(Duration::from_secs),
            envs: params.envs.unwrap_or_default(),
            encoding: params.encoding,
            limit_lines: params.limit_lines,
        };
        match executor.execute(request).await {
            Ok(result) => Ok(CallToolResult::success(render_exec_result(&result, None))),
            Err(CommandError::Timeout { timeout_secs, partial }) => Ok(CallToolResult::success(
                render_exec_result(&partial, Some(timeout_secs)),
            )),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(
        description = "Start a command as a managed background process and return its process id immediately."
    )]
    pub async fn command_bg_start(
        &self,
        Parameters(params): Parameters<CommandBgStartParams>,
    ) -> Result<CallToolResult, McpError> {
        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(result) => return Ok(result),
        };
        let request = StartBackgroundRequest {
            command: assemble_argv(params.command, params.args),
            directory: PathBuf::from(params.directory),
            description: params.description,
            labels: params.labels,
            stdin: params.stdin.map(String::into_bytes),
            envs: params.envs.unwrap_or_default(),
            encoding: params.encoding,
            timeout: params.timeout.map(Duration::from_secs),
        };
        match executor.start_background(request).await {
            Ok(pid) => Ok(text_result(format!("Process started with PID: {pid}"))),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "List background processes, optionally filtered by status and labels.")]
    pub async fn command_ps_list(
        &self,
        Parameters(params): Parameters<CommandPsListParams>,
    ) -> Result<CallToolResult, McpError> {
        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(result) => return Ok(result),
        };
        let status = match params.status.as_deref().map(str::parse).transpose() {
            Ok(status) => status,
            Err(err) => return Ok(error_result(err)),
        };
        let processes = executor.list(status, &params.labels).await;
        if processes.is_empty() {
            return Ok(text_result("No processes found."));
        }
        Ok(text_result(render_process_table(&processes)))
    }

    #[tool(
        description = "Stop a running process. Graceful stop terminates politely and escalates to a kill after a short grace window; force kills immediately."
    )]
    pub async fn command_ps_stop(
        &self,
        Parameters(params): Parameters<CommandPsStopParams>,
    ) -> Result<CallToolResult, McpError> {
        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(result) => return Ok(result),
        };
        match executor
            .stop(&params.pid, params.force.unwrap_or(false), None)
            .await
        {
            Ok(()) => Ok(text_result(format!("Process {} stopped.", params.pid))),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(
        description = "Read the captured output of a process with tail/time-window/grep filtering. Waits briefly for new output when the process is still running."
    )]
    pub async fn command_ps_logs(
        &self,
        Parameters(params): Parameters<CommandPsLogsParams>,
    ) -> Result<CallToolResult, McpError> {
        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(result) => return Ok(result),
        };
        let request = match logs_request(params) {
            Ok(request) => request,
            Err(message) => return Ok(error_result(message)),
        };
        let requested_channels = request.with_stdout || request.with_stderr;
        match executor.logs(request).await {
            Ok(chunks) => {
                if !requested_channels {
                    return Ok(text_result("No logs requested."));
                }
                if chunks.len() == 1 {
                    return Ok(text_result("No logs found."));
                }
                let contents = chunks
                    .into_iter()
                    .map(|chunk| Content::text(chunk.text))
                    .collect();
                Ok(CallToolResult::success(contents))
            }
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "Remove the records and logs of terminal processes. Reports one outcome per id.")]
    pub async fn command_ps_clean(
        &self,
        Parameters(params): Parameters<CommandPsCleanParams>,
    ) -> Result<CallToolResult, McpError> {
        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(result) => return Ok(result),
        };
        match executor.clean(&params.pids).await {
            Ok(results) => {
                let lines: Vec<String> = results
                    .iter()
                    .map(|(pid, status)| {
                        let outcome = match status {
                            os_server_core::CleanStatus::Cleaned => "cleaned",
                            os_server_core::CleanStatus::Running => {
                                "still running; stop it first"
                            }
                            os_server_core::CleanStatus::NotFound => "not found",
                        };
                        format!("  - {pid}: {outcome}")
                    })
                    .collect();
                Ok(text_result(format!(
                    "Clean results:\n{}",
                    lines.join("\n")
                )))
            }
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "Show the full record of one process: command, status, timing, exit code.")]
    pub async fn command_ps_detail(
        &self,
        Parameters(params): Parameters<CommandPsDetailParams>,
    ) -> Result<CallToolResult, McpError> {
        let executor = match self.executor() {
            Ok(executor) => executor,
            Err(result) => return Ok(result),
        };
        match executor.detail(&params.pid).await {
            Ok(info) => Ok(text_result(render_process_detail(&info))),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "Read a text file from an allowed directory.")]
    pub async fn fs_read_text_file(
        &self,
        Parameters(params): Parameters<FsPathParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        match filesystem.read_text_file(&PathBuf::from(params.path)).await {
            Ok(content) => Ok(text_result(content)),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "Read several text files at once; failures are reported per path.")]
    pub async fn fs_read_multiple_text_files(
        &self,
        Parameters(params): Parameters<FsPathsParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        let paths: Vec<PathBuf> = params.paths.into_iter().map(PathBuf::from).collect();
        let results = filesystem.read_multiple_text_files(&paths).await;
        let contents = results
            .into_iter()
            .map(|(path, outcome)| {
                let text = match outcome {
                    Ok(content) => format!("--- {} ---\n{content}", path.display()),
                    Err(err) => format!("--- {} ---\n<error: {err}>", path.display()),
                };
                Content::text(text)
            })
            .collect();
        Ok(CallToolResult::success(contents))
    }

    #[tool(description = "Write a text file inside an allowed directory, creating parents as needed.")]
    pub async fn fs_write_text_file(
        &self,
        Parameters(params): Parameters<FsWriteParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        let path = PathBuf::from(params.path);
        match filesystem.write_text_file(&path, &params.content).await {
            Ok(()) => Ok(text_result(format!("Wrote {}", path.display()))),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(
        description = "Apply a list of exact text replacements to a file, each hitting the first occurrence. Set dry_run to preview the result without writing."
    )]
    pub async fn fs_edit_text_file(
        &self,
        Parameters(params): Parameters<FsEditParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        let path = PathBuf::from(params.path);
        let edits: Vec<os_server_fs::TextEdit> = params
            .edits
            .into_iter()
            .map(|edit| os_server_fs::TextEdit {
                old_text: edit.old_text,
                new_text: edit.new_text,
            })
            .collect();
        let dry_run = params.dry_run.unwrap_or(false);
        match filesystem.edit_text_file(&path, &edits, dry_run).await {
            Ok(report) => {
                let mut lines: Vec<String> = report
                    .changes
                    .iter()
                    .map(|change| {
                        if change.applied {
                            format!("  - applied: {:?} -> {:?}", change.old_text, change.new_text)
                        } else {
                            format!("  - not found: {:?}", change.old_text)
                        }
                    })
                    .collect();
                lines.insert(
                    0,
                    if report.content_changed {
                        if dry_run {
                            format!("Preview of edits to {} (file unchanged):", path.display())
                        } else {
                            format!("Edited {}:", path.display())
                        }
                    } else {
                        format!("No changes made to {}:", path.display())
                    },
                );
                let mut contents = vec![Content::text(lines.join("\n"))];
                if let Some(preview) = report.preview {
                    contents.push(Content::text(preview));
                }
                Ok(CallToolResult::success(contents))
            }
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "Create a directory (and parents) inside an allowed directory.")]
    pub async fn fs_create_directory(
        &self,
        Parameters(params): Parameters<FsPathParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        let path = PathBuf::from(params.path);
        match filesystem.create_directory(&path).await {
            Ok(()) => Ok(text_result(format!("Created {}", path.display()))),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "List a directory inside an allowed directory.")]
    pub async fn fs_list_directory(
        &self,
        Parameters(params): Parameters<FsPathParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        match filesystem.list_directory(&PathBuf::from(params.path)).await {
            Ok(entries) => {
                let lines: Vec<String> = entries
                    .iter()
                    .map(|entry| {
                        let marker = match entry.kind {
                            os_server_fs::EntryKind::Directory => "[DIR] ",
                            os_server_fs::EntryKind::File => "[FILE]",
                            os_server_fs::EntryKind::Other => "[?]   ",
                        };
                        match entry.size {
                            Some(size) => format!("{marker} {} ({size} bytes)", entry.name),
                            None => format!("{marker} {}", entry.name),
                        }
                    })
                    .collect();
                Ok(text_result(if lines.is_empty() {
                    "(empty directory)".to_string()
                } else {
                    lines.join("\n")
                }))
            }
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "Move or rename a file or directory within the allowed directories.")]
    pub async fn fs_move_file(
        &self,
        Parameters(params): Parameters<FsMoveParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        let source = PathBuf::from(params.source);
        let destination = PathBuf::from(params.destination);
        match filesystem.move_path(&source, &destination).await {
            Ok(()) => Ok(text_result(format!(
                "Moved {} -> {}",
                source.display(),
                destination.display()
            ))),
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(
        description = "Find files by glob pattern under a directory, optionally excluding names by glob (capped at 1000 results)."
    )]
    pub async fn fs_search_files(
        &self,
        Parameters(params): Parameters<FsSearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        match filesystem
            .search_files(
                &PathBuf::from(params.path),
                &params.pattern,
                &params.exclude_patterns,
            )
            .await
        {
            Ok(hits) if hits.is_empty() => Ok(text_result("No matches.")),
            Ok(hits) => {
                let lines: Vec<String> =
                    hits.iter().map(|p| p.display().to_string()).collect();
                Ok(text_result(lines.join("\n")))
            }
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "Show size, kind, timestamps and permissions of a path.")]
    pub async fn fs_get_file_info(
        &self,
        Parameters(params): Parameters<FsPathParams>,
    ) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        match filesystem.file_info(&PathBuf::from(params.path)).await {
            Ok(info) => match serde_json::to_string_pretty(&info) {
                Ok(rendered) => Ok(text_result(rendered)),
                Err(err) => Ok(error_result(err)),
            },
            Err(err) => Ok(error_result(err)),
        }
    }

    #[tool(description = "List the directory roots this server is allowed to touch.")]
    pub async fn fs_list_allowed_directories(&self) -> Result<CallToolResult, McpError> {
        let filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(result) => return Ok(result),
        };
        let lines: Vec<String> = filesystem
            .allowed_directories()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        Ok(text_result(lines.join("\n")))
    }
}

#[tool_handler]
impl ServerHandler for OsServer {
    fn get_info(&self) -> ServerInfo {
        let mut surfaces = Vec::new();
        if self.executor.is_some() {
            surfaces.push(
                "command execution (command_execute, command_bg_start, command_ps_*)",
            );
        }
        if self.filesystem.is_some() {
            surfaces.push("filesystem access (fs_*)");
        }
        let mut server_info = Implementation::from_build_env();
        server_info.name = "mcp-os-server".to_string();
        server_info.version = env!("CARGO_PKG_VERSION").to_string();
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info,
            instructions: Some(format!(
                "Exposes controlled operating-system capabilities: {}.",
                surfaces.join("; ")
            )),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        Ok(self.get_info())
    }
}

fn assemble_argv(command: String, args: Vec<String>) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(command);
    argv.extend(args);
    argv
}

fn logs_request(params: CommandPsLogsParams) -> Result<LogsRequest, String> {
    let mut request = LogsRequest::new(params.pid);
    request.tail = params.tail;
    request.since = params
        .since
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    request.until = params
        .until
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    if let Some(with_stdout) = params.with_stdout {
        request.with_stdout = with_stdout;
    }
    if let Some(with_stderr) = params.with_stderr {
        request.with_stderr = with_stderr;
    }
    if let Some(add_time_prefix) = params.add_time_prefix {
        request.add_time_prefix = add_time_prefix;
    }
    request.time_prefix_format = params.time_prefix_format;
    if let Some(follow_seconds) = params.follow_seconds {
        request.follow = Duration::from_secs(follow_seconds);
    }
    if let Some(limit_lines) = params.limit_lines {
        request.limit_lines = limit_lines;
    }
    request.grep = params.grep;
    if let Some(mode) = params.grep_mode.as_deref() {
        request.grep_mode = mode.parse().map_err(|err| format!("{err}"))?;
    }
    Ok(request)
}

/// Accepts RFC 3339 or a naive local timestamp like 2023-05-06T14:30:00.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|err| format!("invalid timestamp '{raw}': {err}"))?;
    Ok(Local
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc()))
}

fn render_exec_result(result: &CommandResult, timed_out_after: Option<u64>) -> Vec<Content> {
    let banner = match timed_out_after {
        Some(secs) => format!(
            "**command timed out after {secs}s (exit code {})**",
            result.exit_code
        ),
        None => format!("**exit with {}**", result.exit_code),
    };
    vec![
        Content::text(banner),
        Content::text(format!("---\nstdout:\n---\n{}\n", result.stdout)),
        Content::text(format!("---\nstderr:\n---\n{}\n", result.stderr)),
    ]
}

fn render_process_table(processes: &[ProcessInfo]) -> String {
    let mut rows = vec![
        "| PID | Status | Command | Description | Labels |".to_string(),
        "|---|---|---|---|---|".to_string(),
    ];
    for info in processes {
        let labels = if info.labels.is_empty() {
            "N/A".to_string()
        } else {
            info.labels.join(", ")
        };
        rows.push(format!(
            "| {} | {} | `{}` | {} | {} |",
            info.pid,
            info.status,
            info.command.join(" "),
            info.description,
            labels
        ));
    }
    rows.join("\n")
}

fn render_process_detail(info: &ProcessInfo) -> String {
    let duration = match (info.start_time, info.end_time) {
        (start, Some(end)) => {
            format!("{:.3}s", (end - start).num_milliseconds() as f64 / 1000.0)
        }
        _ => "N/A".to_string(),
    };
    let mut detail = format!(
        "### Process Details: {}\n\n\
         #### Basic Information\n\
         - **Status**: {}\n\
         - **Command**: `{}`\n\
         - **Description**: {}\n\
         - **Labels**: {}\n\n\
         #### Time Information\n\
         - **Start Time**: {}\n\
         - **End Time**: {}\n\
         - **Duration**: {}\n\n\
         #### Execution Information\n\
         - **Working Directory**: {}\n\
         - **Exit Code**: {}",
        info.pid,
        info.status,
        info.command.join(" "),
        info.description,
        if info.labels.is_empty() {
            "None".to_string()
        } else {
            info.labels.join(", ")
        },
        info.start_time.format("%Y-%m-%d %H:%M:%S"),
        info.end_time
            .map(|end| end.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "N/A".to_string()),
        duration,
        info.directory.display(),
        info.exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "N/A".to_string()),
    );
    if let Some(message) = &info.error_message {
        detail.push_str(&format!("\n- **Error**: {message}"));
    }
    detail.push_str(&format!(
        "\n\n#### Output Information\n- Use `command_ps_logs` to view process output.\n- Example: `command_ps_logs(pid=\"{}\")`",
        info.pid
    ));
    detail
}
