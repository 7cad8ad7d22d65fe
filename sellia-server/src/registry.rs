//! Subdomain allocation, validation, and tunnel ownership.
//!
//! The three indices (`by_id`, `by_subdomain`, `by_client`) live behind one
//! exclusive lock so every mutation moves them atomically - see
//! `DESIGN.md` for why this beats a hashtable-of-locks for a structure this
//! low-contention.

use crate::reserved::ReservedNames;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;

const RANDOM_SUBDOMAIN_RETRIES: u32 = 20;
const RANDOM_SUBDOMAIN_LEN: usize = 8;

/// A single active tunnel.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub tunnel_id: String,
    pub subdomain: String,
    pub client_id: String,
    pub created_at: Instant,
    /// `Some("user:pass")` if the tunnel was opened with basic-auth protection.
    pub basic_auth: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdomainValidity {
    Valid,
    Invalid(InvalidReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    TooShort,
    TooLong,
    BadCharacters,
    LeadingOrTrailingHyphen,
    ConsecutiveHyphens,
    Reserved,
}

impl InvalidReason {
    pub fn message(&self) -> &'static str {
        match self {
            InvalidReason::TooShort => "subdomain must be at least 3 characters",
            InvalidReason::TooLong => "subdomain must be at most 63 characters",
            InvalidReason::BadCharacters => {
                "subdomain may only contain lowercase letters, digits, and hyphens"
            }
            InvalidReason::LeadingOrTrailingHyphen => {
                "subdomain must not start or end with a hyphen"
            }
            InvalidReason::ConsecutiveHyphens => "subdomain must not contain '--'",
            InvalidReason::Reserved => "subdomain is reserved",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("subdomain not available")]
    SubdomainUnavailable,

    #[error("subdomain not available: already in use")]
    SubdomainInUse,

    #[error("invalid subdomain: {0}")]
    SubdomainInvalid(&'static str),

    #[error("subdomain is reserved")]
    SubdomainReserved,
}

struct Indices {
    by_id: HashMap<String, Tunnel>,
    by_subdomain: HashMap<String, String>, // subdomain -> tunnel_id
    by_client: HashMap<String, HashSet<String>>, // client_id -> tunnel_ids
}

impl Indices {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_subdomain: HashMap::new(),
            by_client: HashMap::new(),
        }
    }

    fn insert(&mut self, tunnel: Tunnel) {
        self.by_subdomain
            .insert(tunnel.subdomain.clone(), tunnel.tunnel_id.clone());
        self.by_client
            .entry(tunnel.client_id.clone())
            .or_default()
            .insert(tunnel.tunnel_id.clone());
        self.by_id.insert(tunnel.tunnel_id.clone(), tunnel);
    }

    fn remove_by_id(&mut self, tunnel_id: &str) -> Option<Tunnel> {
        let tunnel = self.by_id.remove(tunnel_id)?;
        self.by_subdomain.remove(&tunnel.subdomain);
        if let Some(set) = self.by_client.get_mut(&tunnel.client_id) {
            set.remove(tunnel_id);
            if set.is_empty() {
                self.by_client.remove(&tunnel.client_id);
            }
        }
        Some(tunnel)
    }
}

/// Allocates, validates, and tracks subdomains and their owning tunnels.
pub struct TunnelRegistry {
    reserved: ReservedNames,
    indices: RwLock<Indices>,
}

impl TunnelRegistry {
    pub fn new(reserved: ReservedNames) -> Self {
        Self {
            reserved,
            indices: RwLock::new(Indices::new()),
        }
    }

    /// Validate a subdomain against the grammar from the data model,
    /// independent of current registrations. Does not lowercase its input.
    pub fn validate_subdomain(&self, name: &str) -> SubdomainValidity {
        if name.len() < 3 {
            return SubdomainValidity::Invalid(InvalidReason::TooShort);
        }
        if name.len() > 63 {
            return SubdomainValidity::Invalid(InvalidReason::TooLong);
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return SubdomainValidity::Invalid(InvalidReason::BadCharacters);
        }
        if name.starts_with('-') || name.ends_with('-') {
            return SubdomainValidity::Invalid(InvalidReason::LeadingOrTrailingHyphen);
        }
        if name.contains("--") {
            return SubdomainValidity::Invalid(InvalidReason::ConsecutiveHyphens);
        }
        if self.reserved.contains(name) {
            return SubdomainValidity::Invalid(InvalidReason::Reserved);
        }
        SubdomainValidity::Valid
    }

    /// Register a new tunnel. If `requested` is `None`, a random 8-hex-char
    /// subdomain is generated (retried up to a small cap on collision).
    pub fn register(
        &self,
        client_id: &str,
        requested: Option<&str>,
        basic_auth: Option<String>,
    ) -> Result<(String, String), RegistryError> {
        let mut indices = self.indices.write().expect("registry lock poisoned");

        let subdomain = match requested {
            Some(requested) => {
                let lowered = requested.to_lowercase();
                match self.validate_subdomain(&lowered) {
                    SubdomainValidity::Invalid(InvalidReason::Reserved) => {
                        return Err(RegistryError::SubdomainReserved)
                    }
                    SubdomainValidity::Invalid(reason) => {
                        return Err(RegistryError::SubdomainInvalid(reason.message()))
                    }
                    SubdomainValidity::Valid => {}
                }
                if indices.by_subdomain.contains_key(&lowered) {
                    return Err(RegistryError::SubdomainInUse);
                }
                lowered
            }
            None => {
                let mut chosen = None;
                for _ in 0..RANDOM_SUBDOMAIN_RETRIES {
                    let candidate = random_subdomain();
                    if matches!(self.validate_subdomain(&candidate), SubdomainValidity::Valid)
                        && !indices.by_subdomain.contains_key(&candidate)
                    {
                        chosen = Some(candidate);
                        break;
                    }
                }
                chosen.ok_or(RegistryError::SubdomainUnavailable)?
            }
        };

        let tunnel_id = sellia_protocol::new_id();
        indices.insert(Tunnel {
            tunnel_id: tunnel_id.clone(),
            subdomain: subdomain.clone(),
            client_id: client_id.to_string(),
            created_at: Instant::now(),
            basic_auth,
        });

        Ok((tunnel_id, subdomain))
    }

    pub fn find_by_subdomain(&self, name: &str) -> Option<Tunnel> {
        let name = name.to_lowercase();
        let indices = self.indices.read().expect("registry lock poisoned");
        let tunnel_id = indices.by_subdomain.get(&name)?;
        indices.by_id.get(tunnel_id).cloned()
    }

    pub fn unregister_by_id(&self, tunnel_id: &str) -> Option<Tunnel> {
        let mut indices = self.indices.write().expect("registry lock poisoned");
        indices.remove_by_id(tunnel_id)
    }

    /// Remove every tunnel owned by a client, atomically. Used on disconnect.
    pub fn unregister_by_client(&self, client_id: &str) -> Vec<Tunnel> {
        let mut indices = self.indices.write().expect("registry lock poisoned");
        let Some(ids) = indices.by_client.remove(client_id) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| {
                let tunnel = indices.by_id.remove(&id)?;
                indices.by_subdomain.remove(&tunnel.subdomain);
                Some(tunnel)
            })
            .collect()
    }

    pub fn active_tunnel_count(&self) -> usize {
        self.indices.read().expect("registry lock poisoned").by_id.len()
    }
}

fn random_subdomain() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..RANDOM_SUBDOMAIN_LEN)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TunnelRegistry {
        TunnelRegistry::new(ReservedNames::default())
    }

    #[test]
    fn length_boundaries() {
        let reg = registry();
        assert_eq!(reg.validate_subdomain("ab"), SubdomainValidity::Invalid(InvalidReason::TooShort));
        assert_eq!(reg.validate_subdomain("abc"), SubdomainValidity::Valid);
        assert_eq!(reg.validate_subdomain(&"a".repeat(63)), SubdomainValidity::Valid);
        assert_eq!(
            reg.validate_subdomain(&"a".repeat(64)),
            SubdomainValidity::Invalid(InvalidReason::TooLong)
        );
    }

    #[test]
    fn hyphen_placement() {
        let reg = registry();
        assert_eq!(
            reg.validate_subdomain("-abc"),
            SubdomainValidity::Invalid(InvalidReason::LeadingOrTrailingHyphen)
        );
        assert_eq!(
            reg.validate_subdomain("abc-"),
            SubdomainValidity::Invalid(InvalidReason::LeadingOrTrailingHyphen)
        );
        assert_eq!(
            reg.validate_subdomain("a--b"),
            SubdomainValidity::Invalid(InvalidReason::ConsecutiveHyphens)
        );
        assert_eq!(reg.validate_subdomain("a-b"), SubdomainValidity::Valid);
    }

    #[test]
    fn reserved_rejects_even_otherwise_valid_names() {
        let reg = registry();
        assert_eq!(
            reg.validate_subdomain("api"),
            SubdomainValidity::Invalid(InvalidReason::Reserved)
        );
    }

    #[test]
    fn register_with_requested_subdomain() {
        let reg = registry();
        let (tunnel_id, subdomain) = reg.register("client-1", Some("MyApp"), None).unwrap();
        assert_eq!(subdomain, "myapp");
        assert!(reg.find_by_subdomain("myapp").is_some());
        assert_eq!(reg.find_by_subdomain("MYAPP").unwrap().tunnel_id, tunnel_id);
    }

    #[test]
    fn register_random_when_unspecified() {
        let reg = registry();
        let (_, subdomain) = reg.register("client-1", None, None).unwrap();
        assert_eq!(subdomain.len(), 8);
        assert!(matches!(reg.validate_subdomain(&subdomain), SubdomainValidity::Valid));
    }

    #[test]
    fn duplicate_subdomain_is_rejected() {
        let reg = registry();
        reg.register("client-1", Some("taken"), None).unwrap();
        let err = reg.register("client-2", Some("taken"), None).unwrap_err();
        assert!(matches!(err, RegistryError::SubdomainInUse));
    }

    #[test]
    fn at_most_one_active_tunnel_per_subdomain() {
        let reg = registry();
        reg.register("client-1", Some("unique"), None).unwrap();
        assert!(reg.register("client-2", Some("unique"), None).is_err());
        assert_eq!(reg.find_by_subdomain("unique").unwrap().client_id, "client-1");
    }

    #[test]
    fn unregister_by_client_removes_all_its_tunnels() {
        let reg = registry();
        reg.register("client-1", Some("one"), None).unwrap();
        reg.register("client-1", Some("two"), None).unwrap();
        reg.register("client-2", Some("three"), None).unwrap();

        let removed = reg.unregister_by_client("client-1");
        assert_eq!(removed.len(), 2);
        assert!(reg.find_by_subdomain("one").is_none());
        assert!(reg.find_by_subdomain("two").is_none());
        assert!(reg.find_by_subdomain("three").is_some());
    }

    #[test]
    fn unregister_by_id_returns_the_removed_tunnel() {
        let reg = registry();
        let (tunnel_id, _) = reg.register("client-1", Some("one"), None).unwrap();
        let removed = reg.unregister_by_id(&tunnel_id).unwrap();
        assert_eq!(removed.subdomain, "one");
        assert!(reg.unregister_by_id(&tunnel_id).is_none());
    }
}
