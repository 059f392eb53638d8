//! MCP transport bindings for the OS server.
//!
//! Three transports share one handler: stdio (stdout is reserved for the
//! protocol, all logging goes to stderr), SSE, and streamable HTTP mounted
//! into an axum router. Ctrl-C ends the non-stdio transports gracefully.

use std::net::SocketAddr;

use anyhow::Context;
use rmcp::ServiceExt;
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::sse_server::SseServerConfig;
use rmcp::transport::stdio;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod tools;

pub use tools::OsServer;

/// Which wire the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Stdio,
    Sse,
    Http,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub mode: ServerMode,
    pub host: String,
    pub port: u16,
    /// Endpoint path prefix for the streamable HTTP transport.
    pub path: String,
}

impl TransportConfig {
    fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

/// Serve until the client disconnects (stdio) or Ctrl-C arrives (SSE/HTTP).
pub async fn run_server(server: OsServer, transport: TransportConfig) -> anyhow::Result<()> {
    match transport.mode {
        ServerMode::Stdio => {
            info!("serving MCP over stdio");
            let service = server
                .serve(stdio())
                .await
                .context("failed to start the stdio transport")?;
            service.waiting().await?;
        }
        ServerMode::Sse => {
            let addr = transport.socket_addr()?;
            let config = SseServerConfig {
                bind: addr,
                sse_path: "/sse".to_string(),
                post_path: "/message".to_string(),
                ct: CancellationToken::new(),
                sse_keep_alive: None,
            };
            let sse_server = SseServer::serve_with_config(config)
                .await
                .with_context(|| format!("failed to bind SSE server to {addr}"))?;
            let ct = sse_server.with_service(move || server.clone());
            info!("SSE MCP endpoint at http://{addr}/sse");
            tokio::signal::ctrl_c().await?;
            ct.cancel();
        }
        ServerMode::Http => {
            let addr = transport.socket_addr()?;
            let service = StreamableHttpService::new(
                move || Ok(server.clone()),
                LocalSessionManager::default().into(),
                Default::default(),
            );
            let router = axum::Router::new().nest_service(&transport.path, service);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind HTTP server to {addr}"))?;
            info!("HTTP MCP endpoint at http://{addr}{}", transport.path);
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
    }
    Ok(())
}
