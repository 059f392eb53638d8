use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

pub const ENV_ALLOWED_COMMANDS: &str = "ALLOWED_COMMANDS";
pub const ENV_ALLOWED_DIRS: &str = "ALLOWED_DIRS";
pub const ENV_PROCESS_RETENTION_SECONDS: &str = "PROCESS_RETENTION_SECONDS";
pub const ENV_DEFAULT_ENCODING: &str = "DEFAULT_ENCODING";
pub const ENV_OUTPUT_STORAGE_PATH: &str = "OUTPUT_STORAGE_PATH";
pub const ENV_DEFAULT_TIMEOUT: &str = "DEFAULT_TIMEOUT";

const DEFAULT_RETENTION_SECS: u64 = 3600;
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Server configuration, resolved once at startup and injected into the
/// executor and the filesystem service. There is no process-wide mutable
/// state behind it.
#[derive(Debug)]
pub struct ServerConfig {
    /// Program names that may be spawned. Empty means nothing may run.
    pub allowed_commands: Vec<String>,
    /// Directory roots the filesystem service may touch.
    pub allowed_dirs: Vec<PathBuf>,
    /// How long terminal process records (and their logs) are kept.
    pub process_retention: Duration,
    /// Codec label used to decode child output when a call does not name one.
    pub default_encoding: String,
    /// Root directory for the on-disk output logs.
    pub output_storage_path: PathBuf,
    /// Timeout applied to synchronous executions that do not name one.
    pub default_timeout: Duration,
    /// Owns the fallback storage directory so it disappears with the server.
    temp_storage: Option<tempfile::TempDir>,
}

impl ServerConfig {
    /// Resolve the configuration from the environment. When
    /// `OUTPUT_STORAGE_PATH` is unset a fresh temp directory is created and
    /// kept alive for the lifetime of the config.
    pub fn from_env() -> io::Result<Self> {
        let allowed_commands = parse_list(&env::var(ENV_ALLOWED_COMMANDS).unwrap_or_default());
        let allowed_dirs = parse_list(&env::var(ENV_ALLOWED_DIRS).unwrap_or_default())
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let process_retention = parse_secs(ENV_PROCESS_RETENTION_SECONDS, DEFAULT_RETENTION_SECS);
        let default_timeout = parse_secs(ENV_DEFAULT_TIMEOUT, DEFAULT_TIMEOUT_SECS);
        let default_encoding = env::var(ENV_DEFAULT_ENCODING)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| platform_default_encoding().to_string());

        let (output_storage_path, temp_storage) = match env::var_os(ENV_OUTPUT_STORAGE_PATH) {
            Some(path) => (PathBuf::from(path), None),
            None => {
                let dir = tempfile::TempDir::new()?;
                let path = dir.path().to_path_buf();
                info!("using temporary output storage path: {}", path.display());
                (path, Some(dir))
            }
        };

        Ok(Self {
            allowed_commands,
            allowed_dirs,
            process_retention,
            default_encoding,
            output_storage_path,
            default_timeout,
            temp_storage,
        })
    }

    /// Configuration with defaults and an explicit storage root. Callers
    /// (mostly tests) override the public fields they care about.
    pub fn with_storage_path(output_storage_path: PathBuf) -> Self {
        Self {
            allowed_commands: Vec::new(),
            allowed_dirs: Vec::new(),
            process_retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            default_encoding: platform_default_encoding().to_string(),
            output_storage_path,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            temp_storage: None,
        }
    }
}

/// Codec the host terminal most plausibly speaks.
pub fn platform_default_encoding() -> &'static str {
    if cfg!(windows) { "gbk" } else { "utf-8" }
}

/// Comma-separated, whitespace-tolerant list. Empty segments are dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_secs(name: &str, default: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}
