//! metakv sidecar binary

use clap::{Parser, Subcommand};
use metakv::api::{self, AppState};
use metakv::leader::Election;
use metakv::registry::Registry;
use metakv::storage::StorageClient;
use metakv::watcher::{Dispatcher, FileWatcher};
use metakv::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "metakv")]
#[command(about = "Shared-volume coordination sidecar")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sidecar
    Serve {
        /// Shared coordination volume (overrides META_CORE_PATH)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Files volume (overrides FILES_PATH)
        #[arg(long)]
        files: Option<PathBuf>,

        /// Service name (overrides SERVICE_NAME)
        #[arg(long)]
        name: Option<String>,

        /// Control surface port (overrides META_CORE_HTTP_PORT)
        #[arg(long)]
        http_port: Option<u16>,

        /// KV store port (overrides REDIS_PORT)
        #[arg(long)]
        store_port: Option<u16>,

        /// Disable the file watcher
        #[arg(long)]
        no_watcher: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            root,
            files,
            name,
            http_port,
            store_port,
            no_watcher,
        } => {
            // Environment first, CLI overrides on top
            let mut config = Config::from_env();
            if let Some(root) = root {
                config.root_path = root;
            }
            if let Some(files) = files {
                config.files_path = files;
            }
            if let Some(name) = name {
                config.service_name = name;
            }
            if let Some(port) = http_port {
                config.http_port = port;
            }
            if let Some(port) = store_port {
                config.store_port = port;
            }
            if no_watcher {
                config.enable_watcher = false;
            }
            config.validate()?;

            run(Arc::new(config)).await?;
        }
    }

    Ok(())
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("starting {} v{}", config.service_name, config.service_version);
    tracing::info!("  volume: {}", config.root_path.display());
    tracing::info!("  files: {}", config.files_path.display());
    tracing::info!("  control surface: {}", config.http_addr());

    let storage = Arc::new(StorageClient::new(""));

    // Leader election wires the storage client to whichever store wins
    let election = Arc::new(Election::new(config.clone(), storage.clone()));
    election.on_become_leader(|| {
        tracing::info!("became LEADER, store is local");
    });
    election.on_become_follower(|info| {
        tracing::info!("became FOLLOWER, leader at {}", info.store_url);
    });
    election.start().await?;

    let registry = Arc::new(Registry::new(config.clone()));
    registry.start()?;

    // Watcher and dispatcher only when enabled and there is something to watch
    let (watcher, dispatcher) = if config.enable_watcher && !config.watch_folders.is_empty() {
        let dispatcher = Arc::new(Dispatcher::new());
        let watcher = FileWatcher::new(&config, dispatcher.clone());
        if let Err(e) = watcher.start() {
            tracing::warn!("failed to start file watcher: {}", e);
        }
        (Some(watcher), Some(dispatcher))
    } else {
        (None, None)
    };

    let state = AppState {
        config: config.clone(),
        election: election.clone(),
        registry: registry.clone(),
        storage: storage.clone(),
        watcher: watcher.clone(),
        dispatcher,
        started_at: Instant::now(),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let router = api::build_router(state);
    let addr = config.http_addr();
    let server = tokio::spawn(async move { api::server::serve(router, &addr, shutdown_rx).await });

    tracing::info!("ready (role: {})", election.role());

    wait_for_signal().await?;
    tracing::info!("shutting down");

    // Reverse order: HTTP, watcher, registry, election, storage
    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("HTTP server error: {}", e),
        Err(e) => tracing::warn!("HTTP server task error: {}", e),
    }

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    if let Err(e) = registry.stop().await {
        tracing::warn!("error stopping registry: {}", e);
    }
    if let Err(e) = election.stop().await {
        tracing::warn!("error stopping election: {}", e);
    }
    storage.close();

    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    Ok(())
}
