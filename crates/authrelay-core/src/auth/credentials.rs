use anyhow::{Context, Result};
use keyring::Entry;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Credential, TokenPair};

/// Default keychain service name
pub const DEFAULT_SERVICE_NAME: &str = "authrelay";

const ACCESS_ENTRY: &str = "access";
const REFRESH_ENTRY: &str = "refresh";
const USER_ENTRY: &str = "user";

const ALL_ENTRIES: [&str; 3] = [ACCESS_ENTRY, REFRESH_ENTRY, USER_ENTRY];

/// Storage boundary for session credentials.
///
/// The dispatcher reads the access credential before every request and the
/// renewal coordinator is the only writer outside of login/logout. Reads are
/// infallible at this boundary: a backend that cannot answer reports absence.
pub trait CredentialStore: Send + Sync {
    /// Current access credential, if any
    fn access(&self) -> Option<Credential>;

    /// Current refresh (renewal) credential, if any
    fn refresh(&self) -> Option<Credential>;

    /// Replace the access credential after a successful renewal
    fn set_access(&self, access: Credential);

    /// Store both credentials, as issued by a login
    fn set_tokens(&self, tokens: TokenPair);

    /// Cached profile of the signed-in user
    fn user(&self) -> Option<Value>;

    fn set_user(&self, user: Value);

    /// Discard access, refresh and user data
    fn clear_all(&self);

    fn has_session(&self) -> bool {
        self.access().is_some() || self.refresh().is_some()
    }
}

#[derive(Debug, Default)]
struct StoredSession {
    access: Option<Credential>,
    refresh: Option<Credential>,
    user: Option<Value>,
}

/// In-process credential store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoredSession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding a token pair
    pub fn with_tokens(access: impl Into<Credential>, refresh: impl Into<Credential>) -> Self {
        let store = Self::new();
        store.set_tokens(TokenPair {
            access: access.into(),
            refresh: refresh.into(),
        });
        store
    }
}

impl CredentialStore for MemoryStore {
    fn access(&self) -> Option<Credential> {
        self.inner.read().access.clone()
    }

    fn refresh(&self) -> Option<Credential> {
        self.inner.read().refresh.clone()
    }

    fn set_access(&self, access: Credential) {
        self.inner.write().access = Some(access);
    }

    fn set_tokens(&self, tokens: TokenPair) {
        let mut inner = self.inner.write();
        inner.access = Some(tokens.access);
        inner.refresh = Some(tokens.refresh);
    }

    fn user(&self) -> Option<Value> {
        self.inner.read().user.clone()
    }

    fn set_user(&self, user: Value) {
        self.inner.write().user = Some(user);
    }

    fn clear_all(&self) {
        *self.inner.write() = StoredSession::default();
    }
}

/// Credential store backed by the OS keychain.
///
/// Each slot (access, refresh, user) is a separate keychain entry under the
/// configured service name. The keychain can refuse a delete, so `clear_all`
/// re-reads every slot afterwards and warns about any that survived.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, slot: &str) -> Result<Entry> {
        Entry::new(&self.service, slot).context("Failed to create keyring entry")
    }

    fn read(&self, slot: &str) -> Option<String> {
        let entry = match self.entry(slot) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(slot, error = %e, "Keyring unavailable");
                return None;
            }
        };
        match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(slot, error = %e, "Failed to read credential from keychain");
                None
            }
        }
    }

    fn write(&self, slot: &str, value: &str) {
        let result = self.entry(slot).and_then(|entry| {
            entry
                .set_password(value)
                .context("Failed to store credential in keychain")
        });
        if let Err(e) = result {
            warn!(slot, error = %e, "Keychain write failed");
        }
    }

    fn delete(&self, slot: &str) {
        let entry = match self.entry(slot) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(slot, error = %e, "Keyring unavailable");
                return;
            }
        };
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => warn!(slot, error = %e, "Failed to delete credential from keychain"),
        }
    }

    /// Slots that still hold a value
    fn remaining_slots(&self) -> Vec<&'static str> {
        ALL_ENTRIES
            .into_iter()
            .filter(|slot| self.read(slot).is_some())
            .collect()
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl CredentialStore for KeyringStore {
    fn access(&self) -> Option<Credential> {
        self.read(ACCESS_ENTRY).map(Credential::from)
    }

    fn refresh(&self) -> Option<Credential> {
        self.read(REFRESH_ENTRY).map(Credential::from)
    }

    fn set_access(&self, access: Credential) {
        self.write(ACCESS_ENTRY, access.as_str());
    }

    fn set_tokens(&self, tokens: TokenPair) {
        self.write(ACCESS_ENTRY, tokens.access.as_str());
        self.write(REFRESH_ENTRY, tokens.refresh.as_str());
    }

    fn user(&self) -> Option<Value> {
        let raw = self.read(USER_ENTRY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Discarding unparseable cached user");
                None
            }
        }
    }

    fn set_user(&self, user: Value) {
        self.write(USER_ENTRY, &user.to_string());
    }

    fn clear_all(&self) {
        for slot in ALL_ENTRIES {
            self.delete(slot);
        }
        let remaining = self.remaining_slots();
        if remaining.is_empty() {
            debug!(service = %self.service, "Keychain cleared");
        } else {
            warn!(service = %self.service, ?remaining, "Keychain still holds credentials after clear");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store_starts_empty() {
        let store = MemoryStore::new();
        assert!(store.access().is_none());
        assert!(store.refresh().is_none());
        assert!(store.user().is_none());
        assert!(!store.has_session());
    }

    #[test]
    fn test_set_access_keeps_refresh() {
        let store = MemoryStore::with_tokens("T1", "R1");
        store.set_access(Credential::from("T2"));
        assert_eq!(store.access(), Some(Credential::from("T2")));
        assert_eq!(store.refresh(), Some(Credential::from("R1")));
    }

    #[test]
    fn test_clear_all_discards_everything() {
        let store = MemoryStore::with_tokens("T1", "R1");
        store.set_user(json!({"email": "test@test.com"}));
        assert!(store.has_session());

        store.clear_all();
        assert!(store.access().is_none());
        assert!(store.refresh().is_none());
        assert!(store.user().is_none());
        assert!(!store.has_session());
    }

    #[test]
    fn test_keyring_clear_all_leaves_no_slots() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let store = KeyringStore::new("authrelay-test");
        store.set_tokens(TokenPair {
            access: Credential::from("T1"),
            refresh: Credential::from("R1"),
        });

        store.clear_all();

        assert!(store.remaining_slots().is_empty());
        assert!(store.access().is_none());
        assert!(!store.has_session());
    }
}
