use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::error::truncate_body;
use crate::api::RenewalError;
use crate::auth::Credential;

/// Result of a successful refresh call.
#[derive(Debug, Clone, Deserialize)]
pub struct RenewedTokens {
    pub access: Credential,
    /// Present when the server rotates refresh tokens
    #[serde(default)]
    pub refresh: Option<Credential>,
}

impl RenewedTokens {
    pub fn access(access: impl Into<Credential>) -> Self {
        Self {
            access: access.into(),
            refresh: None,
        }
    }
}

/// Performs the refresh network call.
///
/// One call per invocation with no retry of its own; the coordinator decides
/// when (and whether) to call it.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn renew(&self, refresh: &Credential) -> Result<RenewedTokens, RenewalError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Refresh over HTTP: `POST {"refresh": ...}`, expecting `200 {"access": ...}`.
#[derive(Clone)]
pub struct HttpSessionTransport {
    client: Client,
    refresh_url: String,
}

impl HttpSessionTransport {
    pub fn new(client: Client, refresh_url: impl Into<String>) -> Self {
        Self {
            client,
            refresh_url: refresh_url.into(),
        }
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }
}

#[async_trait]
impl SessionTransport for HttpSessionTransport {
    async fn renew(&self, refresh: &Credential) -> Result<RenewedTokens, RenewalError> {
        debug!(url = %self.refresh_url, "Sending refresh request");

        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh: refresh.as_str(),
            })
            .send()
            .await
            .map_err(|e| RenewalError::Network(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(RenewalError::Rejected {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        response
            .json::<RenewedTokens>()
            .await
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))
    }
}
