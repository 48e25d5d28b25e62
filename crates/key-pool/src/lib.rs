//! In-memory pool of upstream API keys
//!
//! Holds a fixed, ordered list of upstream credentials and hands them out
//! round-robin, skipping keys that recently failed. Key lifecycle:
//! 1. Keys are loaded once at startup; an empty list is a fatal error
//! 2. `next_active` returns the next `Active` key after the rotation cursor
//! 3. A retryable upstream failure (429/5xx/transport) → `disable`
//! 4. The background sweep restores keys disabled for longer than the threshold
//!
//! Nothing here is persisted; a restart resets every key to `Active`.

pub mod credential;
pub mod error;
pub mod pool;
pub mod reactivate;

pub use credential::{Credential, CredentialState, SelectedCredential};
pub use error::{Error, Result};
pub use pool::KeyPool;
pub use reactivate::spawn_reactivation_task;
