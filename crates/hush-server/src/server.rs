use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    cipher::ChaChaCipher,
    clock::SystemClock,
    handlers::{create_secret, get_secret, health, redirect_api, redirect_root},
    lifecycle::Lifecycle,
    store::{MemoryStore, RedbStore, SecretStore},
    AppState, Redirects,
};

/// Which backend holds the secrets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreKind {
    /// `hush.db` in the data directory.
    #[default]
    Redb,
    /// Process memory; everything is gone on restart.
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend {other:?} (expected redb or memory)"),
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub store: StoreKind,
    /// How often dead records are pruned. Zero disables the sweep.
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub redirect_root: Option<String>,
    pub redirect_api: Option<String>,
}

impl ServerConfig {
    /// Read `HUSH_*` settings from the environment. Unset variables fall back
    /// to defaults; a variable that is set but malformed is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
        {
            match var(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid {key} {raw:?}: {e}")),
                None => Ok(default),
            }
        }

        Ok(Self {
            host: var("HUSH_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&var, "HUSH_PORT", 8080)?,
            data_dir: var("HUSH_DATA_DIR").map(PathBuf::from),
            store: parsed(&var, "HUSH_STORE", StoreKind::default())?,
            sweep_interval: Duration::from_secs(parsed(&var, "HUSH_SWEEP_INTERVAL_SECS", 300)?),
            cors_origins: var("HUSH_CORS_ORIGINS"),
            redirect_root: var("HUSH_REDIRECT_ROOT"),
            redirect_api: var("HUSH_REDIRECT_API"),
        })
    }
}

/// Resolve the data directory for `hush.db`, creating it if needed. Without an
/// explicit directory the platform data dir is used (`~/.local/share/hush/`
/// on Linux).
pub fn resolve_data_dir(data_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.to_path_buf(),
        None => ProjectDirs::from("", "", "hush")
            .context("no platform data directory; set HUSH_DATA_DIR")?
            .data_dir()
            .to_path_buf(),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

fn open_store(cfg: &ServerConfig) -> Result<Arc<dyn SecretStore>> {
    match cfg.store {
        StoreKind::Redb => {
            let data_dir = resolve_data_dir(cfg.data_dir.as_deref())?;
            info!(data_dir = %data_dir.display(), "using data directory");
            let store = RedbStore::open(&data_dir.join("hush.db")).context("open store")?;
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            warn!("using in-memory store; secrets will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Build the router around an already wired lifecycle engine.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    Router::new()
        .route("/", get(redirect_root))
        .route("/health", get(health))
        .route("/v1/", get(redirect_api))
        .route("/v1/secret", post(create_secret))
        .route("/v1/secret/{hash}", get(get_secret))
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let store = open_store(&cfg)?;

    // A cipher whose addresses cannot key it must stop us before we listen.
    let lifecycle = Lifecycle::new(store, Arc::new(ChaChaCipher::new()), Arc::new(SystemClock))
        .context("wire lifecycle engine")?;

    if cfg.sweep_interval.is_zero() {
        info!("background sweep disabled");
    } else {
        lifecycle.clone().spawn_sweep(cfg.sweep_interval);
    }

    let state = AppState {
        lifecycle,
        redirects: Redirects {
            root: cfg.redirect_root.clone(),
            api: cfg.redirect_api.clone(),
        },
    };
    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "hush server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
