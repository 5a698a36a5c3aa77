#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # clawtabs
//!
//! Operator CLI for OpenClaw gateways. Registers gateways in a local store,
//! connects to them over the gateway WebSocket protocol, and drives chat
//! sessions from the command line.
//!
//! ## Subcommands
//!
//! | Command                                | Description                                   |
//! |----------------------------------------|-----------------------------------------------|
//! | `gateways`                             | List registered gateways and cached status    |
//! | `add <id> <url> <token>`               | Register a gateway                            |
//! | `edit <id> [--name] [--url] [--token]` | Update a gateway (credentials force reconnect)|
//! | `remove <id>`                          | Unregister a gateway                          |
//! | `test`                                 | Try a URL/token pair without registering it   |
//! | `sessions [--gateway ID]`              | List sessions (all connected gateways)        |
//! | `history <gateway> <session>`          | Print a session's messages                    |
//! | `send <session> <text>`                | Send a chat message (`--attach FILE`)         |
//! | `abort <gateway> <session>`            | Stop a running reply                          |
//! | `rename <gateway> <session> <name>`    | Set a session's display name                  |
//! | `delete <gateway> <session>`           | Delete a session                              |
//! | `watch`                                | Connect everything, print events as JSON lines|
//!
//! Results go to stdout as JSON; logs go to stderr.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use clawtabs::config::Config;
use clawtabs::store::{ConfigStore, FileStore, MemoryStore};
use clawtabs::{Attachment, GatewayConfig, GatewayManager, GatewayUpdate};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

/// Operator CLI for OpenClaw gateways.
#[derive(Parser)]
#[command(name = "clawtabs", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    /// Keep gateways in memory only; nothing is written to disk.
    #[arg(long, global = true)]
    ephemeral: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered gateways.
    Gateways,
    /// Register a gateway.
    Add {
        id: String,
        url: String,
        token: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Update a registered gateway.
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Unregister a gateway and everything scoped to it.
    Remove { id: String },
    /// Check that a gateway accepts a token, without registering it.
    Test {
        /// Test a registered gateway's stored credentials.
        #[arg(long, conflicts_with_all = ["url", "token"])]
        gateway: Option<String>,
        #[arg(long, requires = "token")]
        url: Option<String>,
        #[arg(long, requires = "url")]
        token: Option<String>,
    },
    /// List sessions on one gateway, or on every connected gateway.
    Sessions {
        #[arg(long)]
        gateway: Option<String>,
    },
    /// Print a session's message history.
    History { gateway: String, session: String },
    /// Send a chat message.
    Send {
        session: String,
        text: String,
        /// Target gateway (default: first connected).
        #[arg(long)]
        gateway: Option<String>,
        /// File to attach (repeatable).
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// Ask the gateway to stop generating.
    Abort {
        gateway: String,
        session: String,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Rename a session.
    Rename {
        gateway: String,
        session: String,
        name: String,
    },
    /// Delete a session.
    Delete { gateway: String, session: String },
    /// Connect every gateway and print manager events as JSON lines.
    Watch,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("clawtabs: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, config).await {
        eprintln!("clawtabs: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> CliResult {
    let store: Arc<dyn ConfigStore> = if cli.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        let path = config.store_path();
        debug!(path = %path.display(), "Using gateway store");
        Arc::new(FileStore::open(path).await?)
    };

    let manager = GatewayManager::new(store, config.gateway_options());
    manager.initialize().await?;
    seed_gateways(&manager, &config).await?;

    let wait = config.test_timeout();
    let result = dispatch(&manager, cli.command, wait).await;
    manager.disconnect_all().await;
    result
}

/// Register `[[gateways]]` and env-seeded entries the store does not know yet.
/// An env-seeded gateway whose credentials changed is updated in place.
async fn seed_gateways(manager: &GatewayManager, config: &Config) -> CliResult {
    for seed in &config.gateways {
        match manager.config(&seed.id).await {
            None => {
                manager.add_gateway(seed.to_config(), false).await?;
            }
            Some(existing) if existing.url != seed.url || existing.token != seed.token => {
                manager
                    .update_gateway(
                        &seed.id,
                        GatewayUpdate {
                            url: Some(seed.url.clone()),
                            token: Some(seed.token.clone()),
                            ..GatewayUpdate::default()
                        },
                    )
                    .await?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

async fn dispatch(manager: &GatewayManager, command: Commands, wait: Duration) -> CliResult {
    match command {
        Commands::Gateways => {
            for gw in manager.configs().await {
                println!(
                    "{:<16} {:<13} {:<32} {}",
                    gw.id,
                    gw.status.as_str(),
                    gw.url,
                    gw.name
                );
            }
        }
        Commands::Add {
            id,
            url,
            token,
            name,
            role,
            description,
        } => {
            let mut config = GatewayConfig::new(&id, name.unwrap_or_else(|| id.clone()), url, token);
            config.role = role;
            config.description = description;
            let added = manager.add_gateway(config, false).await?;
            print_json(&added)?;
        }
        Commands::Edit {
            id,
            name,
            url,
            token,
            role,
            description,
        } => {
            let update = GatewayUpdate {
                name,
                url,
                token,
                role,
                description,
                ..GatewayUpdate::default()
            };
            print_json(&manager.update_gateway(&id, update).await?)?;
        }
        Commands::Remove { id } => {
            manager.remove_gateway(&id).await?;
            info!(gateway = %id, "Removed");
        }
        Commands::Test {
            gateway,
            url,
            token,
        } => {
            let (url, token) = match (gateway, url, token) {
                (Some(id), _, _) => {
                    let config = manager
                        .config(&id)
                        .await
                        .ok_or_else(|| format!("gateway {id} not found"))?;
                    (config.url, config.token)
                }
                (None, Some(url), Some(token)) => (url, token),
                _ => return Err("pass --gateway ID or --url URL --token TOKEN".into()),
            };
            manager.test_connection(&url, &token, wait).await?;
            println!("ok");
        }
        Commands::Sessions { gateway } => {
            connect_targets(manager, gateway.as_deref(), wait).await?;
            print_json(&manager.list_sessions(gateway.as_deref()).await?)?;
        }
        Commands::History { gateway, session } => {
            connect_targets(manager, Some(&gateway), wait).await?;
            print_json(&manager.chat_history(&gateway, &session).await?)?;
        }
        Commands::Send {
            session,
            text,
            gateway,
            attachments,
        } => {
            let attachments = read_attachments(&attachments).await?;
            connect_targets(manager, gateway.as_deref(), wait).await?;
            let reply = manager
                .chat_send(&session, &text, &attachments, gateway.as_deref())
                .await?;
            print_json(&reply)?;
        }
        Commands::Abort {
            gateway,
            session,
            run_id,
        } => {
            connect_targets(manager, Some(&gateway), wait).await?;
            manager
                .chat_abort(&gateway, &session, run_id.as_deref())
                .await?;
        }
        Commands::Rename {
            gateway,
            session,
            name,
        } => {
            connect_targets(manager, Some(&gateway), wait).await?;
            manager.rename_session(&gateway, &session, &name).await?;
        }
        Commands::Delete { gateway, session } => {
            connect_targets(manager, Some(&gateway), wait).await?;
            manager.delete_session(&gateway, &session).await?;
        }
        Commands::Watch => watch(manager).await?,
    }
    Ok(())
}

/// Connect one gateway (and require it), or every gateway (and wait for
/// whichever make it within `wait`).
async fn connect_targets(manager: &GatewayManager, id: Option<&str>, wait: Duration) -> CliResult {
    if let Some(id) = id {
        manager.connect(id).await?;
        manager.wait_connected(id, wait).await?;
        return Ok(());
    }

    for (id, e) in manager.connect_all().await {
        warn!(gateway = %id, error = %e, "Skipping gateway");
    }
    let ids: Vec<String> = manager.configs().await.into_iter().map(|c| c.id).collect();
    let results = join_all(ids.iter().map(|id| manager.wait_connected(id, wait))).await;
    for (id, result) in ids.iter().zip(results) {
        if let Err(e) = result {
            warn!(gateway = %id, error = %e, "Gateway did not connect in time");
        }
    }
    Ok(())
}

async fn read_attachments(paths: &[PathBuf]) -> CliResult<Vec<Attachment>> {
    let mut attachments = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        attachments.push(Attachment::from_bytes(&bytes, guess_mime(path)));
    }
    Ok(attachments)
}

fn guess_mime(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt" | "md") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Print every manager event as one JSON line until SIGINT/SIGTERM.
async fn watch(manager: &GatewayManager) -> CliResult {
    let mut events = manager.subscribe();
    for (id, e) in manager.connect_all().await {
        warn!(gateway = %id, error = %e, "Skipping gateway");
    }

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to register SIGTERM");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    info!("Shutting down...");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
