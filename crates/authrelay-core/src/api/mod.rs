//! HTTP request dispatch for the authenticated API.
//!
//! This module provides the `Dispatcher` that every request goes through,
//! the replayable `ApiRequest` / `ApiResponse` types, and the error types
//! callers see. The API uses JWT bearer token authentication; expired access
//! tokens are renewed transparently by `crate::session`.

pub mod dispatcher;
pub mod error;
pub mod request;

pub use dispatcher::Dispatcher;
pub use error::{ApiError, RenewalError};
pub use request::{ApiRequest, ApiResponse};
