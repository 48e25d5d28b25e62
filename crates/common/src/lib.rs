//! Common types shared by the Gemini proxy crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
