use anyhow::{Context, Result};
use axum::Router;
use file_store::{
    build_state,
    config::{self, Mode},
    local_blob_store,
    models::identity::{Identity, Role},
    routes,
    services::{access_guard::generate_token, catalog::Catalog, reconciler::Reconciler},
};
use std::{fs, io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Username of the administrator seeded from the master key.
const MASTER_USERNAME: &str = "Master";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + mode ---
    let (cfg, mode) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite catalog ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let catalog = Catalog::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("opening database {}", cfg.database_url))?;
    catalog.migrate().await.context("applying migrations")?;

    let outcome = match mode {
        Mode::Migrate => {
            tracing::info!("Database migration complete.");
            Ok(())
        }
        Mode::AddUser { username, role } => add_user(&catalog, username, role).await,
        Mode::Serve => serve(&cfg, catalog.clone()).await,
    };

    catalog.close().await;
    tracing::info!("Database connection closed");
    outcome
}

/// Provision a user and print their new API key.
async fn add_user(catalog: &Catalog, username: String, role: Role) -> Result<()> {
    let identity = Identity {
        token: generate_token(),
        username,
        role,
    };
    catalog
        .replace_identity(&identity)
        .await
        .with_context(|| format!("storing user {}", identity.username))?;
    tracing::info!("User {} saved with role {}", identity.username, identity.role);
    println!("{}", identity.token);
    Ok(())
}

async fn serve(cfg: &config::AppConfig, catalog: Catalog) -> Result<()> {
    // --- Seed the master administrator ---
    let master_key = cfg.require_master_key()?;
    catalog
        .replace_identity(&Identity {
            token: master_key.to_string(),
            username: MASTER_USERNAME.to_string(),
            role: Role::Administrator,
        })
        .await
        .context("seeding the Master user")?;
    tracing::info!("Master user refreshed from the configured key");

    // --- Initialize core services ---
    let blobs = local_blob_store(&cfg.storage_dir, cfg.max_upload_bytes);
    let state = build_state(catalog.clone(), blobs.clone());

    let reconciler = Reconciler::new(catalog, blobs, cfg.pending_grace);
    reconciler.run_once().await;
    let sweeper = if cfg.reconcile_interval.is_zero() {
        tracing::info!("Periodic reconciliation disabled");
        None
    } else {
        Some(reconciler.spawn(cfg.reconcile_interval))
    };

    // --- Build router ---
    let body_limit = usize::try_from(cfg.request_body_limit()).unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes(body_limit).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err).with_context(|| format!("binding {}", addr)),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    served?;
    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
