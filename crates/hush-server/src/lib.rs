pub mod cipher;
pub mod clock;
pub mod handlers;
pub mod lifecycle;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: lifecycle::Lifecycle,
    pub redirects: Redirects,
}

/// Optional redirect targets for the bare `/` and `/v1/` paths.
#[derive(Debug, Clone, Default)]
pub struct Redirects {
    pub root: Option<String>,
    pub api: Option<String>,
}

pub use lifecycle::{CreatedSecret, Lifecycle, RevealedSecret, SecretError};
pub use server::{resolve_data_dir, run, ServerConfig, StoreKind};
