//! Hatago Hub
//!
//! An MCP (Model Context Protocol) hub: one streamable-HTTP JSON-RPC
//! endpoint fronting many upstream MCP servers (local child processes over
//! stdio, remote servers over streamable HTTP or SSE), exposing their
//! combined tools, resources, and prompts under a namespaced view.
//!
//! # Features
//!
//! - **Namespaced routing**: public names map back to the owning upstream
//!   under configurable naming strategies
//! - **Lazy activation**: upstreams spawn on first use and shut down idle
//! - **Streamable HTTP**: sessions, SSE streams, progress-token routing
//! - **Hot reload**: config changes converge running upstreams without
//!   dropping unrelated sessions
//!
//! # Example
//!
//! ```no_run
//! use hatago_hub::{config, hub::Hub, server::HubServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = config::parse_config(r#"{
//!         "version": 1,
//!         "mcpServers": { "echo": { "command": "echo-server" } }
//!     }"#)?;
//!     let hub = Hub::new(cfg, None, Vec::new()).await;
//!     HubServer::new(hub).run_http("127.0.0.1", 3535).await
//! }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod hub;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;
pub mod upstream;

pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use server::HubServer;
