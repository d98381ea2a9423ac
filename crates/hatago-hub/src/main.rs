//! Hatago Hub - Entry Point
//!
//! `serve` runs the hub over streamable HTTP or stdio; `init` writes a
//! starter config; `mcp` edits the compact server map on disk.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hatago_hub::config::{self, HubConfig, watcher};
use hatago_hub::hub::Hub;
use hatago_hub::server::HubServer;

const DEFAULT_CONFIG: &str = "hatago.config.json";

#[derive(Parser, Debug)]
#[command(name = "hatago-hub")]
#[command(about = "MCP hub - one endpoint fronting many MCP servers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a starter configuration file
    Init {
        /// Where to write the config
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Run the hub
    Serve {
        /// Serve over streamable HTTP (the default)
        #[arg(long, conflicts_with = "stdio")]
        http: bool,

        /// Serve over stdin/stdout
        #[arg(long)]
        stdio: bool,

        /// Config file path
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,

        /// Override the configured HTTP host
        #[arg(long)]
        host: Option<String>,

        /// Watch the config file and hot-reload changes
        #[arg(long)]
        watch: bool,

        /// Only manage upstreams carrying one of these tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Load environment variables from this file before reading config
        #[arg(long)]
        env_file: Option<PathBuf>,
    },

    /// Manage the mcpServers map in the config file
    Mcp {
        #[command(subcommand)]
        command: McpCommand,

        /// Config file path
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum McpCommand {
    /// Add or replace a server
    Add {
        /// Upstream id
        id: String,
        /// Local command to spawn
        #[arg(long, conflicts_with = "url")]
        command: Option<String>,
        /// Arguments for the local command
        #[arg(long, num_args = 0.., allow_hyphen_values = true)]
        args: Vec<String>,
        /// Remote endpoint URL
        #[arg(long)]
        url: Option<String>,
    },
    /// Remove a server
    Remove { id: String },
    /// Print one server definition
    Get { id: String },
    /// List configured servers
    List,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(filter);
    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Init { config } => {
            init_tracing(&cli.log_level, cli.json_logs);
            write_starter_config(&config)
        }
        Command::Serve { stdio, config, port, host, watch, tags, env_file, .. } => {
            if let Some(env_file) = &env_file {
                dotenv::from_path(env_file).map_err(|e| {
                    anyhow::anyhow!("cannot load env file {}: {e}", env_file.display())
                })?;
            }

            let loaded = config::load_config(&config)
                .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
            let level = effective_log_level(&cli.log_level, &loaded);
            init_tracing(&level, cli.json_logs);

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                config = %config.display(),
                "starting hatago hub"
            );
            serve(loaded, config, stdio, port, host, watch, tags).await
        }
        Command::Mcp { command, config } => {
            init_tracing(&cli.log_level, cli.json_logs);
            edit_servers(&config, command)
        }
    }
}

/// CLI flag wins when explicitly set; otherwise the config's logLevel.
fn effective_log_level(flag: &str, config: &HubConfig) -> String {
    if flag != "info" {
        return flag.to_string();
    }
    config.log_level.clone().unwrap_or_else(|| flag.to_string())
}

async fn serve(
    loaded: HubConfig,
    config_path: PathBuf,
    stdio: bool,
    port: Option<u16>,
    host: Option<String>,
    watch: bool,
    tags: Vec<String>,
) -> anyhow::Result<()> {
    let http_host = host.unwrap_or_else(|| loaded.http.host.clone());
    let http_port = port.unwrap_or(loaded.http.port);

    let hub = Hub::new(loaded, Some(config_path.clone()), tags).await;

    let _watcher = if watch {
        Some(
            watcher::watch(
                hub.clone(),
                config_path,
                tokio_util::sync::CancellationToken::new(),
            )
            .map_err(|e| anyhow::anyhow!("cannot watch config: {e}"))?,
        )
    } else {
        None
    };

    let server = HubServer::new(hub);
    if stdio {
        server.run_stdio().await
    } else {
        server.run_http(&http_host, http_port).await
    }
}

fn write_starter_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let starter = r#"{
  // Hatago Hub configuration. See https://github.com/hatago/hatago-hub-rs
  "version": 1,
  "logLevel": "info",
  "http": { "port": 3535, "host": "127.0.0.1" },

  // Compact map form. Values take either { "command", "args", "env" }
  // for local servers or { "url" } for remote ones.
  "mcpServers": {
    // "everything": {
    //   "command": "npx",
    //   "args": ["-y", "@modelcontextprotocol/server-everything"]
    // }
  },

  "toolNaming": { "strategy": "namespace", "separator": "_" },
  "timeouts": { "spawnMs": 8000, "healthcheckMs": 2000, "toolCallMs": 20000 }
}
"#;
    std::fs::write(path, starter)?;
    println!("wrote {}", path.display());
    Ok(())
}

/// Edit the compact `mcpServers` map, leaving the rest of the document
/// intact. Comments in the file do not survive a rewrite.
fn edit_servers(path: &Path, command: McpCommand) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    let stripped = config::strip_jsonc_comments(&raw);
    let mut document: serde_json::Value = serde_json::from_str(&stripped)?;

    let servers = document
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("config root must be an object"))?
        .entry("mcpServers")
        .or_insert_with(|| serde_json::json!({}));
    let servers = servers
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("mcpServers must be an object"))?;

    let mut dirty = false;
    match command {
        McpCommand::Add { id, command, args, url } => {
            let entry = match (command, url) {
                (Some(command), None) => {
                    let mut entry = serde_json::json!({ "command": command });
                    if !args.is_empty() {
                        entry["args"] = serde_json::json!(args);
                    }
                    entry
                }
                (None, Some(url)) => serde_json::json!({ "url": url }),
                _ => anyhow::bail!("exactly one of --command or --url is required"),
            };
            servers.insert(id.clone(), entry);
            dirty = true;
            println!("added '{id}'");
        }
        McpCommand::Remove { id } => {
            if servers.remove(&id).is_none() {
                anyhow::bail!("no server '{id}' in {}", path.display());
            }
            dirty = true;
            println!("removed '{id}'");
        }
        McpCommand::Get { id } => {
            let entry = servers
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("no server '{id}' in {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(entry)?);
        }
        McpCommand::List => {
            let mut ids: Vec<&String> = servers.keys().collect();
            ids.sort();
            for id in ids {
                let kind = if servers[id].get("url").is_some() { "remote" } else { "local" };
                println!("{id}\t{kind}");
            }
        }
    }

    if dirty {
        // Validate the edited document before touching the file.
        config::parse_config(&serde_json::to_string(&document)?)
            .map_err(|e| anyhow::anyhow!("refusing to write invalid config: {e}"))?;
        std::fs::write(path, serde_json::to_string_pretty(&document)?)?;
    }
    Ok(())
}
