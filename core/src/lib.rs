//! Core of the MCP OS server: the output store, the process manager and the
//! command execution facade.
//!
//! Everything here is transport-agnostic. The MCP tool bindings, the CLI and
//! the filesystem service live in sibling crates and consume this one through
//! [`CommandExecutor`].

pub mod config;
pub mod error;
pub mod executor;
pub mod output_store;
pub mod process_manager;

pub use config::ServerConfig;
pub use error::CommandError;
pub use error::Result;
pub use executor::CommandExecutor;
pub use executor::CommandResult;
pub use executor::ExecuteRequest;
pub use executor::GrepMode;
pub use executor::LogChunk;
pub use executor::LogsRequest;
pub use executor::StartBackgroundRequest;
pub use output_store::OutputChannel;
pub use output_store::OutputEntry;
pub use output_store::OutputQuery;
pub use output_store::OutputStore;
pub use process_manager::CleanStatus;
pub use process_manager::ProcessInfo;
pub use process_manager::ProcessManager;
pub use process_manager::ProcessSpec;
pub use process_manager::ProcessStatus;
