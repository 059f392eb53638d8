//! `mcp-os-server`: MCP server exposing controlled command execution and
//! filesystem access.
//!
//! Three personalities share one binary: `command-server` (command tools
//! only), `filesystem-server` (filesystem tools only) and `unified-server`
//! (both). Each speaks stdio, SSE or streamable HTTP.

use std::sync::Arc;

use anyhow::bail;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use os_server_core::CommandExecutor;
use os_server_core::OutputStore;
use os_server_core::ProcessManager;
use os_server_core::ServerConfig;
use os_server_fs::FilesystemService;
use os_server_mcp::OsServer;
use os_server_mcp::ServerMode;
use os_server_mcp::TransportConfig;
use os_server_mcp::run_server;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mcp-os-server",
    version,
    about = "MCP server exposing controlled command execution and filesystem access"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve only the command-execution tools.
    CommandServer(ServeArgs),
    /// Serve only the filesystem tools.
    FilesystemServer(ServeArgs),
    /// Serve both tool families on one endpoint.
    UnifiedServer(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Transport to speak.
    #[arg(long, value_enum, default_value_t = Mode::Stdio)]
    mode: Mode,
    /// Bind address for the SSE and HTTP transports.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port for the SSE and HTTP transports.
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Endpoint path prefix for the HTTP transport.
    #[arg(long, default_value = "/mcp")]
    path: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Stdio,
    Sse,
    Http,
}

impl From<Mode> for ServerMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Stdio => Self::Stdio,
            Mode::Sse => Self::Sse,
            Mode::Http => Self::Http,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the MCP protocol in stdio mode; everything human
    // lands on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let (args, with_commands, with_filesystem) = match &cli.command {
        Commands::CommandServer(args) => (args, true, false),
        Commands::FilesystemServer(args) => (args, false, true),
        Commands::UnifiedServer(args) => (args, true, true),
    };

    let config = Arc::new(ServerConfig::from_env()?);

    if with_commands && !with_filesystem && config.allowed_commands.is_empty() {
        bail!("no commands are allowed; set ALLOWED_COMMANDS (e.g. ALLOWED_COMMANDS='ls,cat,echo')");
    }
    if with_filesystem && !with_commands && config.allowed_dirs.is_empty() {
        bail!("no directories are allowed; set ALLOWED_DIRS (e.g. ALLOWED_DIRS='/tmp,/home/user')");
    }
    if with_commands && with_filesystem
        && config.allowed_commands.is_empty()
        && config.allowed_dirs.is_empty()
    {
        bail!("neither commands nor directories are allowed; set ALLOWED_COMMANDS and/or ALLOWED_DIRS");
    }

    let executor = if with_commands {
        if config.allowed_commands.is_empty() {
            warn!("ALLOWED_COMMANDS is empty; every command will be rejected");
        } else {
            info!("allowed commands: {}", config.allowed_commands.join(", "));
        }
        info!(
            "process retention: {}s, output storage: {}",
            config.process_retention.as_secs(),
            config.output_storage_path.display()
        );
        let store = Arc::new(OutputStore::new(&config.output_storage_path));
        let manager = ProcessManager::new(store, config.process_retention);
        Some(Arc::new(CommandExecutor::new(manager, config.clone())))
    } else {
        None
    };

    let filesystem = if with_filesystem && !config.allowed_dirs.is_empty() {
        Some(Arc::new(FilesystemService::new(config.allowed_dirs.clone())?))
    } else {
        None
    };

    let transport = TransportConfig {
        mode: args.mode.into(),
        host: args.host.clone(),
        port: args.port,
        path: args.path.clone(),
    };

    let server = OsServer::new(executor.clone(), filesystem);
    let outcome = run_server(server, transport).await;

    if let Some(executor) = executor {
        executor.shutdown().await;
    }
    outcome
}
