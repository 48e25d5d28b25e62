//! Round-robin key selection and health transitions
//!
//! The credentials and the rotation cursor sit behind one `Mutex`, so
//! selection, disabling and the reactivation sweep are mutually exclusive.
//! Every critical section is pure bookkeeping over at most N credentials;
//! callers copy the selected key out and release the lock before touching
//! the network.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialState, SelectedCredential};
use crate::error::{Error, Result};

struct PoolState {
    credentials: Vec<Credential>,
    /// Index of the next credential to consider. Always in `[0, N)`.
    cursor: usize,
}

impl PoolState {
    fn active_count(&self) -> usize {
        self.credentials.iter().filter(|c| c.is_active()).count()
    }
}

/// Fixed-size pool of upstream API keys.
///
/// Keys are never added or removed after construction. Round-robin order is
/// the original configuration order; disabled keys are skipped but keep
/// their slot for the next cycle.
pub struct KeyPool {
    state: Mutex<PoolState>,
    size: usize,
}

impl KeyPool {
    /// Build a pool from the configured keys, all starting `Active`.
    ///
    /// Returns `Error::Empty` for an empty list: a proxy without keys must not
    /// start serving.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Empty);
        }
        let credentials: Vec<Credential> = keys.into_iter().map(Credential::new).collect();
        let size = credentials.len();
        info!(credentials = size, "key pool initialized");
        metrics::gauge!("pool_credentials_active").set(size as f64);
        Ok(Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
            }),
            size,
        })
    }

    /// Number of credentials in the pool (fixed for the pool's lifetime).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Select the next `Active` credential, starting at the cursor and wrapping.
    ///
    /// Visits at most N slots. On success the cursor moves to the slot right
    /// after the returned credential. Returns `None` when every credential is
    /// disabled; that is a normal runtime condition, not an error.
    pub async fn next_active(&self) -> Option<SelectedCredential> {
        let mut state = self.state.lock().await;
        let n = state.credentials.len();
        let start = state.cursor;

        for offset in 0..n {
            let idx = (start + offset) % n;
            if state.credentials[idx].is_active() {
                state.cursor = (idx + 1) % n;
                return Some(state.credentials[idx].select(idx));
            }
        }

        debug!(credentials = n, "no active credential available");
        None
    }

    /// Disable the credential after a retryable failure.
    ///
    /// Idempotent: a credential that is already disabled keeps its original
    /// timestamp, so repeated failures cannot postpone its reactivation.
    /// Returns true if this call changed the state.
    pub async fn disable(&self, selected: &SelectedCredential) -> bool {
        let mut state = self.state.lock().await;
        let Some(credential) = state.credentials.get_mut(selected.index) else {
            warn!(index = selected.index, "disable requested for unknown credential");
            return false;
        };

        if !credential.disable(Instant::now()) {
            debug!(key = %selected.label, "credential already disabled");
            return false;
        }

        let active = state.active_count();
        warn!(
            key = %selected.label,
            active,
            total = self.size,
            "credential disabled after retryable failure"
        );
        metrics::counter!("pool_credentials_disabled_total").increment(1);
        metrics::gauge!("pool_credentials_active").set(active as f64);
        true
    }

    /// Reactivate every credential disabled for at least `threshold` as of `now`.
    ///
    /// Returns the number of credentials restored.
    pub async fn reactivate_sweep(&self, now: Instant, threshold: Duration) -> usize {
        let mut state = self.state.lock().await;
        let mut restored = 0usize;

        for credential in state.credentials.iter_mut() {
            if credential.reactivate_if_due(now, threshold) {
                info!(key = %credential.label(), "credential reactivated after cooldown");
                restored += 1;
            }
        }

        if restored > 0 {
            let active = state.active_count();
            metrics::counter!("pool_credentials_reactivated_total").increment(restored as u64);
            metrics::gauge!("pool_credentials_active").set(active as f64);
        }
        restored
    }

    /// Snapshot of every credential's state, in pool order.
    pub async fn states(&self) -> Vec<CredentialState> {
        let state = self.state.lock().await;
        state.credentials.iter().map(|c| c.state()).collect()
    }

    /// Number of credentials currently `Active`.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active_count()
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all active → healthy, some active → degraded,
    /// none active → unhealthy. Keys appear only as redacted labels.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let now = Instant::now();

        let mut credentials = Vec::with_capacity(state.credentials.len());
        let mut active_count = 0usize;

        for credential in state.credentials.iter() {
            match credential.state() {
                CredentialState::Active => {
                    active_count += 1;
                    credentials.push(serde_json::json!({
                        "key": credential.label(),
                        "status": CredentialState::Active.label()
                    }));
                }
                disabled @ CredentialState::Disabled { since } => {
                    credentials.push(serde_json::json!({
                        "key": credential.label(),
                        "status": disabled.label(),
                        "disabled_secs": now.saturating_duration_since(since).as_secs()
                    }));
                }
            }
        }

        let total = state.credentials.len();
        let pool_status = if active_count == total {
            "healthy"
        } else if active_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "credentials_total": total,
            "credentials_active": active_count,
            "credentials_disabled": total - active_count,
            "credentials": credentials
        })
    }
}
