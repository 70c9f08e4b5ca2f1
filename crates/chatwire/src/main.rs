//! # chatwire
//!
//! Chat server binary: loads settings, installs logging and metrics, seeds
//! the in-memory stores, and serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatwire_auth::{InMemoryTokenStore, TokenValidator};
use chatwire_server::chat::{ChatStore, InMemoryChatStore};
use chatwire_server::{ChatServer, ServerConfig};
use chatwire_settings::ChatwireSettings;
use clap::Parser;
use tokio::task::JoinHandle;

/// How often expired tokens are swept from the token store.
const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Chatwire chat server.
#[derive(Parser, Debug)]
#[command(name = "chatwire", about = "WebSocket chat server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `$CHATWIRE_SETTINGS` or
    /// `~/.chatwire/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// JSON file with users, chats and messages to preload.
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Load settings and layer the command-line flags on top.
    fn resolve_settings(&self) -> Result<ChatwireSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(chatwire_settings::settings_path);
        let mut settings = chatwire_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

fn build_chat_store(seed: Option<&Path>) -> Result<InMemoryChatStore> {
    match seed {
        Some(path) => InMemoryChatStore::load_seed(path)
            .with_context(|| format!("Failed to load seed file {}", path.display())),
        None => Ok(InMemoryChatStore::new()),
    }
}

/// Issue one token per known user so a developer can connect right away.
fn issue_dev_tokens(store: &InMemoryChatStore, tokens: &InMemoryTokenStore) -> usize {
    let users = store.users();
    for user in &users {
        let token = tokens.issue(user);
        tracing::info!(user_id = user.user_id, username = %user.username, %token, "issued token");
    }
    users.len()
}

/// Periodically evict expired tokens.
fn spawn_token_sweeper(tokens: Arc<InMemoryTokenStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        let _ = ticker.tick().await;
        loop {
            let _ = ticker.tick().await;
            let removed = tokens.cleanup_expired();
            if removed > 0 {
                tracing::debug!(removed, "swept expired tokens");
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.resolve_settings()?;

    chatwire_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics_handle = match chatwire_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed, /metrics disabled");
            None
        }
    };

    let tokens = Arc::new(InMemoryTokenStore::new(Duration::from_secs(
        settings.auth.token_ttl_secs,
    )));
    let chat_store = build_chat_store(args.seed.as_deref())?;
    let issued = issue_dev_tokens(&chat_store, &tokens);
    if issued > 0 {
        tracing::info!(issued, "development tokens issued for seeded users");
    }

    let validator: Arc<dyn TokenValidator> = Arc::clone(&tokens) as Arc<dyn TokenValidator>;
    let store: Arc<dyn ChatStore> = Arc::new(chat_store);
    let mut server = ChatServer::new(ServerConfig::from(&settings.server), validator, store);
    if let Some(handle) = metrics_handle {
        server = server.with_metrics_handle(handle);
    }

    let sweeper = spawn_token_sweeper(Arc::clone(&tokens), TOKEN_SWEEP_INTERVAL);

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;
    tracing::info!("Chatwire listening on http://{addr} (WebSocket upgrades on any path)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown(None).await {
        tracing::warn!("some connections did not finish before the shutdown timeout");
    }
    let _ = handle.await;
    sweeper.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
