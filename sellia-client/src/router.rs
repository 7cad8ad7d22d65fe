//! Path-based routing to local targets.
//!
//! Rules are tried in the order they were added; the first match wins. A
//! pattern ending in `*` matches by prefix, anything else matches exactly.
//! A default target catches whatever no rule matched.

/// The pseudo-pattern reported for a match that fell through to the default
/// target rather than matching a configured rule.
const FALLBACK_PATTERN: &str = "(fallback)";

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    host: String,
    port: u16,
}

/// A resolved route: the target plus which rule matched it, so callers can
/// log or reason about why a request landed where it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub pattern: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
    default: Option<(String, u16)>,
}

fn route_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == pattern,
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a routing rule. Earlier calls take priority over later ones.
    pub fn add_route(&mut self, pattern: impl Into<String>, host: impl Into<String>, port: u16) {
        self.routes.push(Route {
            pattern: pattern.into(),
            host: host.into(),
            port,
        });
    }

    pub fn set_default(&mut self, host: impl Into<String>, port: u16) {
        self.default = Some((host.into(), port));
    }

    /// Resolve a request path to a target, falling back to the default
    /// target if no rule matches. Carries the matched pattern along -
    /// `FALLBACK_PATTERN` when the default target was used.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        for route in &self.routes {
            if route_matches(&route.pattern, path) {
                return Some(RouteMatch {
                    pattern: route.pattern.clone(),
                    host: route.host.clone(),
                    port: route.port,
                });
            }
        }
        self.default.clone().map(|(host, port)| RouteMatch {
            pattern: FALLBACK_PATTERN.to_string(),
            host,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_that_path() {
        let mut router = Router::new();
        router.add_route("/api/health", "127.0.0.1", 9000);
        assert_eq!(
            router.resolve("/api/health"),
            Some(RouteMatch { pattern: "/api/health".into(), host: "127.0.0.1".into(), port: 9000 })
        );
        assert_eq!(router.resolve("/api/health/extra"), None);
    }

    #[test]
    fn wildcard_pattern_matches_by_prefix() {
        let mut router = Router::new();
        router.add_route("/api/*", "127.0.0.1", 9000);
        assert_eq!(
            router.resolve("/api/users/1"),
            Some(RouteMatch { pattern: "/api/*".into(), host: "127.0.0.1".into(), port: 9000 })
        );
        assert_eq!(router.resolve("/other"), None);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut router = Router::new();
        router.add_route("/api/*", "host-a", 1);
        router.add_route("/api/special", "host-b", 2);
        assert_eq!(
            router.resolve("/api/special"),
            Some(RouteMatch { pattern: "/api/*".into(), host: "host-a".into(), port: 1 })
        );
    }

    #[test]
    fn falls_back_to_default_when_nothing_matches() {
        let mut router = Router::new();
        router.add_route("/api/*", "host-a", 1);
        router.set_default("127.0.0.1", 3000);
        assert_eq!(
            router.resolve("/other"),
            Some(RouteMatch { pattern: FALLBACK_PATTERN.into(), host: "127.0.0.1".into(), port: 3000 })
        );
    }

    #[test]
    fn no_default_means_unmatched_paths_resolve_to_none() {
        let router = Router::new();
        assert_eq!(router.resolve("/anything"), None);
    }
}
