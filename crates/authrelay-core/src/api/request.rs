//! Replayable request and buffered response types.
//!
//! An `ApiRequest` keeps everything needed to re-issue the call verbatim,
//! so a request parked during a session renewal can be sent again with only
//! its authorization header changed.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::auth::Credential;

use super::ApiError;

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    retried: bool,
    sent_with: Option<Credential>,
}

impl ApiRequest {
    /// `target` is either a path relative to the API base URL or an
    /// absolute `http(s)://` URL.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
            sent_with: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a JSON body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize body: {}", e)))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(bytes);
        Ok(self)
    }

    /// Attach a raw body with an explicit content type
    pub fn body(mut self, bytes: Vec<u8>, content_type: HeaderValue) -> Self {
        self.headers.insert(CONTENT_TYPE, content_type);
        self.body = Some(bytes);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Whether this request has already been re-issued after a 401.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// One-way: a retried request never triggers another renewal.
    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// Access credential attached on the most recent transmission
    pub(crate) fn sent_with(&self) -> Option<&Credential> {
        self.sent_with.as_ref()
    }

    pub(crate) fn set_sent_with(&mut self, credential: Option<Credential>) {
        self.sent_with = credential;
    }
}

/// Fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_json_body_sets_content_type() {
        let request = ApiRequest::post("profiles/")
            .json(&json!({"name": "Santo"}))
            .expect("Failed to build request");
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(
            request.headers().get(CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"application/json"[..])
        );
        let body: Value = serde_json::from_slice(request.body_bytes().unwrap_or_default())
            .expect("Body should be JSON");
        assert_eq!(body["name"], "Santo");
    }

    #[test]
    fn test_raw_body_and_extra_headers() {
        let request = ApiRequest::put("api/avatars/7/")
            .header(
                HeaderName::from_static("x-request-source"),
                HeaderValue::from_static("cli"),
            )
            .body(b"\x89PNG".to_vec(), HeaderValue::from_static("image/png"));

        assert_eq!(request.method(), &Method::PUT);
        assert_eq!(request.target(), "api/avatars/7/");
        assert_eq!(
            request.headers().get("x-request-source").map(|v| v.as_bytes()),
            Some(&b"cli"[..])
        );
        assert_eq!(
            request.headers().get(CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"image/png"[..])
        );
        assert_eq!(request.body_bytes(), Some(&b"\x89PNG"[..]));
    }

    #[test]
    fn test_retried_marker_survives_clone() {
        let mut request = ApiRequest::get("profile/me/");
        assert!(!request.is_retried());
        request.mark_retried();
        let replay = request.clone();
        assert!(replay.is_retried());
    }

    #[test]
    fn test_response_json_error_is_invalid_response() {
        let response = ApiResponse::new(StatusCode::OK, HeaderMap::new(), b"not json".to_vec());
        let parsed: Result<Value, _> = response.json();
        assert!(matches!(parsed, Err(ApiError::InvalidResponse(_))));
        assert_eq!(response.text(), "not json");
    }
}
