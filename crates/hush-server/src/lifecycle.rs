//! Create and retrieve semantics for self-destructing secrets.
//!
//! A secret is Fresh while it has views left and its deadline (if any) has
//! not passed; Expired and Exhausted are terminal. Retrieval consumes a view
//! through the store's compare-and-update, so each view is granted at most
//! once no matter how many engine instances race for it. Every failure a
//! reader can hit collapses into [`SecretError::SecretUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use crate::cipher::{check_key_binding, Address, Cipher};
use crate::clock::Clock;
use crate::store::{SecretRecord, SecretState, SecretStore, StoreError};

/// Fresh addresses tried before `create` gives up on collisions.
const CREATE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SecretError {
    /// Rejected before touching the store.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Not found, expired, exhausted, lost a race, store down, or undecryptable.
    #[error("secret isn't available")]
    SecretUnavailable,
    /// Startup-time wiring error; the service must not become ready.
    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

/// Result of a successful `create`, echoed back to the requester.
#[derive(Debug, Clone)]
pub struct CreatedSecret {
    pub address: Address,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_views: u32,
    pub plaintext: String,
}

/// Result of a successful `retrieve`. `remaining_views` is after this view.
#[derive(Debug, Clone)]
pub struct RevealedSecret {
    pub plaintext: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_views: u32,
}

/// The lifecycle engine. Stateless apart from its collaborators, so clones
/// are cheap and may run concurrently anywhere.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn SecretStore>,
    cipher: Arc<dyn Cipher>,
    clock: Arc<dyn Clock>,
}

impl Lifecycle {
    /// Wire the engine, refusing a cipher whose addresses cannot key it.
    pub fn new(
        store: Arc<dyn SecretStore>,
        cipher: Arc<dyn Cipher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SecretError> {
        check_key_binding(cipher.as_ref()).map_err(|e| SecretError::Misconfigured(e.to_string()))?;
        Ok(Self {
            store,
            cipher,
            clock,
        })
    }

    /// Encrypt and store `plaintext` under a fresh address.
    ///
    /// `remaining_views` must be positive. A `ttl_minutes` of zero or less
    /// means the secret only dies by exhaustion.
    pub async fn create(
        &self,
        plaintext: &str,
        remaining_views: i64,
        ttl_minutes: i64,
    ) -> Result<CreatedSecret, SecretError> {
        let views = u32::try_from(remaining_views)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                SecretError::InvalidRequest(format!(
                    "remaining views must be a positive count, got {remaining_views}"
                ))
            })?;

        let now = self.clock.now();
        let expires_at = if ttl_minutes > 0 {
            let deadline = chrono::Duration::try_minutes(ttl_minutes)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .ok_or_else(|| {
                    SecretError::InvalidRequest(format!("ttl of {ttl_minutes} minutes is out of range"))
                })?;
            Some(deadline)
        } else {
            None
        };

        for _ in 0..CREATE_ATTEMPTS {
            let address = self.cipher.generate_address();
            let ciphertext = self
                .cipher
                .encrypt(&address, plaintext.as_bytes())
                .map_err(|e| {
                    warn!(error = %e, "encrypt failed");
                    SecretError::SecretUnavailable
                })?;

            let record = SecretRecord::new(now, expires_at, views, ciphertext);
            match self.store.create(&address, &record) {
                Ok(()) => {
                    info!(remaining_views = views, ttl_minutes, "secret created");
                    return Ok(CreatedSecret {
                        address,
                        created_at: now,
                        expires_at,
                        remaining_views: views,
                        plaintext: plaintext.to_owned(),
                    });
                }
                Err(StoreError::Occupied) => {
                    warn!("address collision, regenerating");
                }
                Err(e) => {
                    warn!(error = %e, "store create failed");
                    return Err(SecretError::SecretUnavailable);
                }
            }
        }

        warn!(attempts = CREATE_ATTEMPTS, "no free address found");
        Err(SecretError::SecretUnavailable)
    }

    /// Consume one view of the secret at `address` and return its plaintext.
    ///
    /// Must run inside a tokio runtime: dead records are deleted by a
    /// detached blocking task that the caller never waits for.
    pub async fn retrieve(&self, address: &Address) -> Result<RevealedSecret, SecretError> {
        let mut record = match self.store.get(address) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("secret not found");
                return Err(SecretError::SecretUnavailable);
            }
            Err(e) => {
                warn!(error = %e, "store read failed");
                return Err(SecretError::SecretUnavailable);
            }
        };

        let state = record.state(self.clock.now());
        if state != SecretState::Fresh {
            debug!(?state, "secret is dead");
            self.reap(address, state);
            return Err(SecretError::SecretUnavailable);
        }

        record.remaining_views -= 1;
        if let Err(e) = self
            .store
            .compare_and_update(address, record.version, &record)
        {
            match e {
                StoreError::Conflict => debug!("lost the race for this view"),
                other => warn!(error = %other, "store update failed"),
            }
            return Err(SecretError::SecretUnavailable);
        }

        let plaintext = self
            .cipher
            .decrypt(address, &record.ciphertext)
            .map_err(|e| {
                warn!(error = %e, "decrypt failed");
                SecretError::SecretUnavailable
            })?;
        let plaintext = String::from_utf8(plaintext).map_err(|_| {
            warn!("decrypted secret is not valid UTF-8");
            SecretError::SecretUnavailable
        })?;

        // That was the last view; nobody can read it again.
        if record.remaining_views == 0 {
            self.reap(address, SecretState::Exhausted);
        }

        Ok(RevealedSecret {
            plaintext,
            created_at: record.created_at,
            expires_at: record.expires_at,
            remaining_views: record.remaining_views,
        })
    }

    /// Fire-and-forget delete of a dead record. Failure only gets logged:
    /// a dead record fails every later validity check anyway.
    fn reap(&self, address: &Address, state: SecretState) {
        let store = Arc::clone(&self.store);
        let address = address.clone();
        tokio::task::spawn_blocking(move || match store.delete(&address) {
            Ok(()) => debug!(?state, "reaped dead secret"),
            Err(e) => warn!(error = %e, ?state, "best-effort delete failed"),
        });
    }

    /// Spawn a background task that prunes dead records every `interval`.
    pub fn spawn_sweep(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.store.prune(self.clock.now()) {
                    warn!(error = %e, "background sweep error");
                }
            }
        });
    }
}
