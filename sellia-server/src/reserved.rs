//! The default reserved-subdomain set.
//!
//! These names can never be claimed by a tunnel, on top of whatever an
//! administrative surface adds at runtime. The default set itself can never
//! be removed - see [`ReservedNames`].

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Names carved out for the platform's own use (infrastructure, common
/// phishing targets, and words that would make a 404 confusing).
pub static DEFAULT_RESERVED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Platform infrastructure
        "www", "api", "app", "admin", "dashboard", "status", "health",
        "docs", "blog", "mail", "ftp", "ssh", "vpn", "cdn", "static",
        "assets", "tunnel", "tunnels", "edge", "node", "nodes",
        "internal", "private", "public",
        // Common phishing / impersonation targets
        "login", "signin", "logon", "secure", "security", "verify",
        "account", "accounts", "password", "billing", "support",
        "paypal", "google", "apple", "microsoft", "amazon", "facebook",
    ]
    .into_iter()
    .collect()
});

/// A snapshot of reserved names: the immutable defaults plus whatever an
/// administrative surface has added. The registry only reads this; it never
/// mutates it on the server's behalf - additions come from outside the core.
#[derive(Debug, Clone)]
pub struct ReservedNames {
    additional: HashSet<String>,
}

impl ReservedNames {
    /// Build a snapshot from names added administratively. The default set
    /// is always included and cannot be excluded by this constructor.
    pub fn new(additional: impl IntoIterator<Item = String>) -> Self {
        Self {
            additional: additional.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        DEFAULT_RESERVED.contains(name.as_str()) || self.additional.contains(&name)
    }

    /// Add a name administratively. Returns `false` if it was already reserved.
    pub fn add(&mut self, name: &str) -> bool {
        self.additional.insert(name.to_lowercase())
    }

    /// Remove an administratively-added name. The default set can never be
    /// removed, so this is a no-op (returns `false`) for default names.
    pub fn remove(&mut self, name: &str) -> bool {
        self.additional.remove(&name.to_lowercase())
    }
}

impl Default for ReservedNames {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_are_reserved() {
        let reserved = ReservedNames::default();
        assert!(reserved.contains("api"));
        assert!(reserved.contains("WWW"));
    }

    #[test]
    fn administrative_additions_are_reserved() {
        let mut reserved = ReservedNames::default();
        assert!(!reserved.contains("acme-corp"));
        assert!(reserved.add("acme-corp"));
        assert!(reserved.contains("acme-corp"));
    }

    #[test]
    fn default_set_cannot_be_removed() {
        let mut reserved = ReservedNames::default();
        assert!(!reserved.remove("api"));
        assert!(reserved.contains("api"));
    }
}
