//! Request dispatcher for the authenticated JSON API.
//!
//! Every request goes through `Dispatcher::send`, which attaches the current
//! access token and hands 401 responses to the renewal coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::auth::{Credential, CredentialStore, TokenPair};
use crate::config::Config;
use crate::session::{
    HttpSessionTransport, RenewalCoordinator, RenewalPhase, Replay, SessionEvent, SessionTransport,
};

use super::{ApiError, ApiRequest, ApiResponse};

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: Credential,
    refresh: Credential,
    #[serde(default)]
    user: Option<Value>,
}

struct DispatcherInner {
    client: Client,
    base_url: String,
    login_path: String,
    store: Arc<dyn CredentialStore>,
    coordinator: Arc<RenewalCoordinator>,
}

/// Authenticated API client.
/// Clone is cheap - clones share the connection pool, the credential store
/// and the renewal coordinator.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher that refreshes sessions against `config.refresh_url()`
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let client = Self::build_client(config)?;
        let transport = Arc::new(HttpSessionTransport::new(
            client.clone(),
            config.refresh_url(),
        ));
        Ok(Self::from_parts(client, config, store, transport))
    }

    /// Create a dispatcher with a custom session transport
    pub fn with_transport(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn SessionTransport>,
    ) -> Result<Self, ApiError> {
        let client = Self::build_client(config)?;
        Ok(Self::from_parts(client, config, store, transport))
    }

    fn build_client(config: &Config) -> Result<Client, ApiError> {
        Ok(Client::builder().timeout(config.request_timeout()).build()?)
    }

    fn from_parts(
        client: Client,
        config: &Config,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn SessionTransport>,
    ) -> Self {
        let coordinator = Arc::new(RenewalCoordinator::new(Arc::clone(&store), transport));
        Self {
            inner: Arc::new(DispatcherInner {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                login_path: config.login_path.clone(),
                store,
                coordinator,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    pub fn renewal_phase(&self) -> RenewalPhase {
        self.inner.coordinator.phase()
    }

    /// Session lifecycle events; `Terminated` means the user must log in again
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.coordinator.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.store.has_session()
    }

    /// Send a request with the current access token.
    ///
    /// 2xx responses are returned as-is. A 401 is resolved by the renewal
    /// coordinator; the caller only sees it if the replay fails again. Other
    /// statuses become an `ApiError`.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let access = self.inner.store.access();
        self.dispatch(request, access).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, target: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(target)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        target: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(target).json(body)?).await?.json()
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        target: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::patch(target).json(body)?).await?.json()
    }

    pub async fn delete(&self, target: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(target)).await
    }

    /// Log in with email and password, storing both tokens and the user.
    /// Also re-arms renewal after a terminated session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Option<Value>, ApiError> {
        let request = ApiRequest::post(self.inner.login_path.clone())
            .json(&LoginRequest { email, password })?;

        let response = self.transmit(&request, None).await?;
        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }
        if !status.is_success() {
            return Err(ApiError::from_status(status, &response.text()));
        }

        let login: LoginResponse = response.json()?;
        self.inner.coordinator.establish(
            TokenPair {
                access: login.access,
                refresh: login.refresh,
            },
            login.user.clone(),
        );
        self.inner
            .coordinator
            .emit(SessionEvent::LoggedIn { at: Utc::now() });

        info!("Logged in");
        Ok(login.user)
    }

    /// Drop all credentials and the cached user. Wins over a renewal that is
    /// still in flight.
    pub fn logout(&self) {
        self.inner.coordinator.end_session();
        self.inner
            .coordinator
            .emit(SessionEvent::LoggedOut { at: Utc::now() });
        info!("Logged out");
    }

    async fn dispatch(
        &self,
        mut request: ApiRequest,
        access: Option<Credential>,
    ) -> Result<ApiResponse, ApiError> {
        let response = self.transmit(&request, access.as_ref()).await?;
        request.set_sent_with(access);

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED && !request.is_retried() {
            debug!(path = request.target(), "Unauthorized, handing to renewal coordinator");
            return self.inner.coordinator.recover(self.clone(), request).await;
        }

        Err(ApiError::from_status(status, &response.text()))
    }

    async fn transmit(
        &self,
        request: &ApiRequest,
        access: Option<&Credential>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url_for(request.target());

        let mut headers = request.headers().clone();
        if let Some(access) = access {
            let value = HeaderValue::from_str(&access.bearer())
                .map_err(|_| ApiError::InvalidRequest("Malformed access token".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self
            .inner
            .client
            .request(request.method().clone(), &url)
            .headers(headers);
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(
            method = %request.method(),
            url = %url,
            status = status.as_u16(),
            retried = request.is_retried(),
            "Request completed"
        );

        Ok(ApiResponse::new(status, headers, body))
    }

    fn url_for(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}/{}", self.inner.base_url, target.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Replay for Dispatcher {
    async fn replay(
        &self,
        mut request: ApiRequest,
        access: Credential,
    ) -> Result<ApiResponse, ApiError> {
        request.mark_retried();
        self.dispatch(request, Some(access)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;

    fn dispatcher(base_url: &str) -> Dispatcher {
        let config = Config::for_base_url(base_url);
        Dispatcher::new(&config, Arc::new(MemoryStore::new())).expect("Failed to build dispatcher")
    }

    #[test]
    fn test_url_for_relative_targets() {
        let d = dispatcher("https://project.example/dashboard-api/");
        assert_eq!(
            d.url_for("api/profile/me/"),
            "https://project.example/dashboard-api/api/profile/me/"
        );
        assert_eq!(
            d.url_for("/api/profiles/"),
            "https://project.example/dashboard-api/api/profiles/"
        );
    }

    #[test]
    fn test_url_for_absolute_targets() {
        let d = dispatcher("https://project.example/dashboard-api");
        assert_eq!(
            d.url_for("https://other.example/api/"),
            "https://other.example/api/"
        );
    }

    #[test]
    fn test_parse_login_response() {
        let json = r#"{"refresh": "R1", "access": "T1", "user": {"id": 7, "email": "test@test.com"}}"#;
        let login: LoginResponse = serde_json::from_str(json).expect("Failed to parse login");
        assert_eq!(login.access.as_str(), "T1");
        assert_eq!(login.refresh.as_str(), "R1");
        assert_eq!(login.user.as_ref().map(|u| u["id"].clone()), Some(Value::from(7)));
    }

    #[test]
    fn test_new_dispatcher_is_idle_and_unauthenticated() {
        let d = dispatcher("http://localhost:8000");
        assert_eq!(d.renewal_phase(), RenewalPhase::Idle);
        assert!(!d.is_authenticated());
    }
}
