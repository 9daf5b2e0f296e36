//! authrelay - an HTTP client layer that keeps an authenticated session alive.
//!
//! Callers send ordinary requests through a [`Dispatcher`]. Bearer tokens are
//! attached from a [`CredentialStore`]; when the API answers 401 the session
//! is renewed once, no matter how many requests failed concurrently, and the
//! failed requests are replayed with the new token. If renewal fails the
//! store is cleared and subscribers receive [`SessionEvent::Terminated`].

pub mod api;
pub mod auth;
pub mod config;
pub mod session;

pub use api::{ApiError, ApiRequest, ApiResponse, Dispatcher, RenewalError};
pub use auth::{Credential, CredentialStore, KeyringStore, MemoryStore, TokenPair};
pub use config::Config;
pub use session::{
    HttpSessionTransport, RenewalCoordinator, RenewalPhase, RenewedTokens, SessionEvent,
    SessionTransport,
};
