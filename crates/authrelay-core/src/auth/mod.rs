//! Credential handling for authenticated sessions.
//!
//! This module provides:
//! - `Credential`: an opaque bearer token with a redacted `Debug`
//! - `CredentialStore`: the storage boundary the dispatcher and the
//!   renewal coordinator read and write through
//! - `MemoryStore` and `KeyringStore`: in-process and OS keychain backends

pub mod credentials;
pub mod tokens;

pub use credentials::{CredentialStore, KeyringStore, MemoryStore};
pub use tokens::{Credential, TokenPair};
