//! Credential validation.
//!
//! The core never sees the key database directly - it only calls through
//! this trait. The administrative surface and its persistence layer are
//! external collaborators that produce an implementation of it; here we
//! ship the in-memory one used for tests and for running the core standalone.

use std::collections::HashMap;

/// Validates presentation tokens and maps them to an account identifier.
pub trait AuthProvider: Send + Sync {
    /// Returns the account id for a valid `api_key`, or `None` if it doesn't
    /// authenticate.
    fn account_id_for(&self, api_key: &str) -> Option<String>;
}

/// A static key -> account-id table, suitable for tests and for running the
/// server without a real administrative surface wired up.
pub struct StaticAuthProvider {
    keys: HashMap<String, String>,
}

impl StaticAuthProvider {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    /// A provider with a single master key, all requests mapping to one
    /// account - useful for single-tenant deployments.
    pub fn single_key(api_key: impl Into<String>, account_id: impl Into<String>) -> Self {
        let mut keys = HashMap::new();
        keys.insert(api_key.into(), account_id.into());
        Self { keys }
    }
}

impl AuthProvider for StaticAuthProvider {
    fn account_id_for(&self, api_key: &str) -> Option<String> {
        self.keys.get(api_key).cloned()
    }
}

/// An `AuthProvider` that accepts any non-empty key, naming the key itself
/// as the account id. Used when `require_auth` is disabled.
pub struct OpenAuthProvider;

impl AuthProvider for OpenAuthProvider {
    fn account_id_for(&self, api_key: &str) -> Option<String> {
        if api_key.is_empty() {
            None
        } else {
            Some(api_key.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_validates_known_keys() {
        let provider = StaticAuthProvider::single_key("secret", "account-1");
        assert_eq!(provider.account_id_for("secret").as_deref(), Some("account-1"));
        assert_eq!(provider.account_id_for("wrong"), None);
    }

    #[test]
    fn open_provider_accepts_any_nonempty_key() {
        let provider = OpenAuthProvider;
        assert_eq!(provider.account_id_for("anything").as_deref(), Some("anything"));
        assert_eq!(provider.account_id_for(""), None);
    }
}
