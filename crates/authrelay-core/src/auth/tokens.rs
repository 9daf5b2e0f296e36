use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque bearer token. Used for both the short-lived access credential
/// and the longer-lived refresh credential.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log token material
        write!(f, "Credential(***{} chars)", self.0.len())
    }
}

impl From<&str> for Credential {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Credential {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Access and refresh credentials issued together at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: Credential,
    pub refresh: Credential,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let cred = Credential::new("secret-token");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("secret"));
        assert_eq!(debug, "Credential(***12 chars)");
    }

    #[test]
    fn test_bearer_header_value() {
        assert_eq!(Credential::from("T2").bearer(), "Bearer T2");
    }

    #[test]
    fn test_token_pair_parses_login_fields() {
        let json = r#"{"access": "a1", "refresh": "r1"}"#;
        let pair: TokenPair = serde_json::from_str(json).expect("Failed to parse token pair");
        assert_eq!(pair.access.as_str(), "a1");
        assert_eq!(pair.refresh.as_str(), "r1");
    }
}
