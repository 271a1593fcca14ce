use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, str::FromStr, time::Duration};

use crate::models::identity::Role;

/// Default cap on a single upload: 500 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;

/// Room for multipart boundaries and part headers on top of the file itself.
pub const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub master_key: Option<String>,
    pub max_upload_bytes: u64,
    pub reconcile_interval: Duration,
    pub pending_grace: Duration,
}

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    AddUser { username: String, role: Role },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Permission-gated file storage API")]
pub struct Args {
    /// Host to bind to (overrides FILE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides FILE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// API key of the built-in `Master` administrator (overrides FILE_STORE_MASTER_KEY)
    #[arg(long)]
    pub master_key: Option<String>,

    /// Maximum upload size in bytes (overrides FILE_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Seconds between reconciliation sweeps, 0 disables (overrides FILE_STORE_RECONCILE_INTERVAL_SECS)
    #[arg(long)]
    pub reconcile_interval_secs: Option<u64>,

    /// Age in seconds after which unfinished uploads are swept (overrides FILE_STORE_PENDING_GRACE_SECS)
    #[arg(long)]
    pub pending_grace_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create (or replace) a user with a freshly generated API key and print it
    AddUser {
        username: String,
        /// none, read-write-self, read-write-all or administrator
        role: Role,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        // Parse CLI once
        let args = Args::parse();
        Self::from_args(args, |key| env::var(key))
    }

    /// Merge `args` over values read through `lookup`.
    pub fn from_args<F>(args: Args, lookup: F) -> Result<(Self, Mode)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        // --- Environment fallback ---
        let env_host = lookup("FILE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "FILE_STORE_PORT", 8080u16)?;
        let env_storage =
            lookup("FILE_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = lookup("FILE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/file_store.db".into());
        let env_master = lookup("FILE_STORE_MASTER_KEY").ok();
        let env_max_upload =
            parse_var(&lookup, "FILE_STORE_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        let env_interval = parse_var(&lookup, "FILE_STORE_RECONCILE_INTERVAL_SECS", 300u64)?;
        let env_grace = parse_var(&lookup, "FILE_STORE_PENDING_GRACE_SECS", 900u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            master_key: args
                .master_key
                .or(env_master)
                .filter(|key| !key.trim().is_empty()),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            reconcile_interval: Duration::from_secs(
                args.reconcile_interval_secs.unwrap_or(env_interval),
            ),
            pending_grace: Duration::from_secs(args.pending_grace_secs.unwrap_or(env_grace)),
        };

        let mode = match args.command {
            Some(Command::AddUser { username, role }) => Mode::AddUser { username, role },
            None if args.migrate => Mode::Migrate,
            None => Mode::Serve,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Cap on the whole request body, so the per-file limit is what trips
    /// for an oversize upload.
    pub fn request_body_limit(&self) -> u64 {
        self.max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES)
    }

    /// The master key, which serving requires.
    pub fn require_master_key(&self) -> Result<&str> {
        self.master_key
            .as_deref()
            .context("FILE_STORE_MASTER_KEY (or --master-key) must be set to serve")
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("pending_grace", &self.pending_grace)
            .finish()
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
