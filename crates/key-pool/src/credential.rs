//! A single upstream key and its health state

use std::time::Duration;

use common::Secret;
use tokio::time::Instant;

/// Number of trailing key characters that may appear in logs and health output.
pub const VISIBLE_KEY_SUFFIX: usize = 4;

/// Health of one credential.
///
/// The disable timestamp lives inside the `Disabled` variant, so an `Active`
/// credential can never carry a stale one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Active,
    Disabled { since: Instant },
}

impl CredentialState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::Active => "active",
            CredentialState::Disabled { .. } => "disabled",
        }
    }
}

/// One upstream API key. Only the pool mutates its state.
#[derive(Debug)]
pub struct Credential {
    key: Secret<String>,
    label: String,
    state: CredentialState,
}

impl Credential {
    pub fn new(key: String) -> Self {
        let key = Secret::new(key);
        let label = key.redacted(VISIBLE_KEY_SUFFIX);
        Self {
            key,
            label,
            state: CredentialState::Active,
        }
    }

    /// Redacted form of the key, safe to log.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> CredentialState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, CredentialState::Active)
    }

    /// Mark as disabled at `now`. Returns false (and keeps the original
    /// timestamp) if the credential was already disabled.
    pub(crate) fn disable(&mut self, now: Instant) -> bool {
        match self.state {
            CredentialState::Active => {
                self.state = CredentialState::Disabled { since: now };
                true
            }
            CredentialState::Disabled { .. } => false,
        }
    }

    /// Restore to `Active` if it has been disabled for at least `threshold`.
    pub(crate) fn reactivate_if_due(&mut self, now: Instant, threshold: Duration) -> bool {
        match self.state {
            CredentialState::Disabled { since }
                if now.saturating_duration_since(since) >= threshold =>
            {
                self.state = CredentialState::Active;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn select(&self, index: usize) -> SelectedCredential {
        SelectedCredential {
            index,
            key: self.key.clone(),
            label: self.label.clone(),
        }
    }
}

/// A credential handed out for one forwarding attempt.
///
/// Holds a copy of the key rather than a reference into the pool so the pool
/// lock is released before any network call. `index` identifies the credential
/// when reporting a failure back via `KeyPool::disable`.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub index: usize,
    pub key: Secret<String>,
    pub label: String,
}
