//! Pulse Node -- remote logging producer, viewer and control CLI.
//!
//! Usage:
//!   pulse-node                          # Run a producer with default config
//!   some-app | pulse-node run           # Stream stdin lines to the selected viewer
//!   pulse-node viewer                   # Accept producers and store their logs
//!   pulse-node connect "Desk"           # Select a viewer (queries local API)

use pulse_node::config::{self, NodeConfig};
use pulse_node::preferences::{MemorySettings, SettingsStore};
use pulse_node::producer::Producer;
use pulse_node::viewer::{self, ViewerConfig};
use pulse_node::{expand_tilde, load_or_create_token};

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

use pulse_protocol::Level;
use pulse_store::SqliteStore;

#[derive(Parser)]
#[command(name = "pulse-node", about = "Pulse remote logging node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.pulse/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a producer (default). Lines on stdin are stored and streamed.
    Run {
        /// Level assigned to stdin lines
        #[arg(long, default_value = "info")]
        level: Level,
        /// Keep logs and preferences in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// Run a viewer. Type `pause`, `resume` or `clients` on stdin.
    Viewer,
    /// Show session status (queries local API)
    Status,
    /// List discovered viewers
    Peers,
    /// Enable remote logging
    Enable,
    /// Disable remote logging
    Disable,
    /// Connect to a discovered viewer by name
    Connect {
        /// Viewer name
        name: String,
    },
    /// Query stored log messages
    Messages {
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        min_level: Option<Level>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Show store counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays usable for CLI output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_node=info,pulse_session=info,pulse_api=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = config::NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run { level, ephemeral }) => run_producer(cfg, level, ephemeral).await?,
        None => run_producer(cfg, Level::Info, false).await?,
        Some(Commands::Viewer) => run_viewer(cfg).await?,
        Some(Commands::Status) => cli_api_call(&cfg, "/api/v1/status", "{}").await?,
        Some(Commands::Peers) => cli_api_call(&cfg, "/api/v1/peers", "{}").await?,
        Some(Commands::Enable) => cli_api_call(&cfg, "/api/v1/enable", "{}").await?,
        Some(Commands::Disable) => cli_api_call(&cfg, "/api/v1/disable", "{}").await?,
        Some(Commands::Connect { name }) => {
            let body = serde_json::json!({ "name": name }).to_string();
            cli_api_call(&cfg, "/api/v1/connect", &body).await?;
        }
        Some(Commands::Messages {
            label,
            min_level,
            limit,
        }) => {
            let body = serde_json::json!({
                "label": label,
                "min_level": min_level,
                "limit": limit,
            })
            .to_string();
            cli_api_call(&cfg, "/api/v1/messages", &body).await?;
        }
        Some(Commands::Stats) => cli_api_call(&cfg, "/api/v1/stats", "{}").await?,
    }

    Ok(())
}

/// Make a POST request to the local node API and print the JSON response.
async fn cli_api_call(cfg: &NodeConfig, path: &str, body: &str) -> anyhow::Result<()> {
    let url = format!("http://{}{}", cfg.node.api_addr, path);

    let token_path = expand_tilde(&cfg.node.api_token);
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", token))
        .body(body.to_string())
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_producer(cfg: NodeConfig, level: Level, ephemeral: bool) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        app = %cfg.app.name,
        viewers = cfg.discovery.peers.len(),
        ephemeral,
        "starting pulse-node producer"
    );

    let (store, settings) = if ephemeral {
        let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
        (Arc::new(SqliteStore::open_in_memory()?), settings)
    } else {
        let db_path = expand_tilde(&cfg.node.database);
        let store = Arc::new(SqliteStore::open(&db_path)?);
        tracing::info!(db = %db_path.display(), "store opened");
        let settings: Arc<dyn SettingsStore> = store.clone();
        (store, settings)
    };

    let producer = Producer::start(&cfg, store, settings);

    // Shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Start API server
    let bearer_token = load_or_create_token(&expand_tilde(&cfg.node.api_token))?;
    let state = Arc::new(producer.api_state(bearer_token));
    let router = pulse_api::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.node.api_addr).await?;
    tracing::info!(addr = %cfg.node.api_addr, "API listening (HTTP)");
    let api_handle = {
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        })
    };

    // Forward stdin; after EOF keep streaming until Ctrl-C
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        if let Err(e) = producer.log(level, line) {
                            tracing::error!("failed to store log line: {e}");
                        }
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed, press Ctrl-C to stop");
                        stdin_open = false;
                    }
                    Err(e) => {
                        tracing::warn!("stdin read error: {e}");
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    producer.shutdown().await;
    let _ = api_handle.await;
    tracing::info!("pulse-node stopped");
    Ok(())
}

async fn run_viewer(cfg: NodeConfig) -> anyhow::Result<()> {
    let db_path = expand_tilde(&cfg.viewer.database);
    let store = Arc::new(SqliteStore::open(&db_path)?);
    tracing::info!(db = %db_path.display(), "viewer store opened");

    let (viewer, task) = viewer::run_viewer(
        ViewerConfig {
            listen_addr: cfg.viewer.listen_addr.clone(),
            name: cfg.viewer.name.clone(),
            timing: cfg.session.timing(),
            start_paused: cfg.viewer.start_paused,
        },
        store,
    )
    .await?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "pause" => viewer.pause(),
                        "resume" => viewer.resume(),
                        "clients" => {
                            println!("{}", serde_json::to_string_pretty(&viewer.clients())?);
                        }
                        "" => {}
                        other => eprintln!("unknown command: {other} (pause, resume, clients)"),
                    },
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    viewer.shutdown();
    let _ = task.await;
    Ok(())
}
