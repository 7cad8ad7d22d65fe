//! Environment-driven configuration, in the teacher's `Config::from_env` style.
//!
//! No YAML file and no CLI flags here - those live in an administrative
//! surface this crate doesn't own. Everything the relay itself needs to
//! start comes from the process environment, loaded once at startup.

use std::env;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub base_domain: String,
    pub public_scheme: String,
    pub require_auth: bool,
    pub rate_limit_enabled: bool,
    /// A single static key/account pair, used when no external auth
    /// surface is wired up. Absent means every key is accepted.
    pub api_key: Option<String>,
    pub account_id: Option<String>,
}

fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn parse_bind_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid("SELLIA_BIND_ADDR", value.to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("SELLIA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_addr = parse_bind_addr(&bind_addr)?;

        let base_domain = env::var("SELLIA_BASE_DOMAIN").map_err(|_| ConfigError::Missing("SELLIA_BASE_DOMAIN"))?;

        let public_scheme = env::var("SELLIA_PUBLIC_SCHEME").unwrap_or_else(|_| "https".to_string());

        let require_auth = parse_flag(env::var("SELLIA_REQUIRE_AUTH").ok().as_deref(), false);
        let rate_limit_enabled = parse_flag(env::var("SELLIA_RATE_LIMIT_ENABLED").ok().as_deref(), true);

        let api_key = env::var("SELLIA_API_KEY").ok();
        let account_id = env::var("SELLIA_ACCOUNT_ID").ok();

        Ok(Self {
            bind_addr,
            base_domain,
            public_scheme,
            require_auth,
            rate_limit_enabled,
            api_key,
            account_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parses_true_variants() {
        assert!(parse_flag(Some("true"), false));
        assert!(parse_flag(Some("1"), false));
    }

    #[test]
    fn flag_parses_false_variants() {
        assert!(!parse_flag(Some("false"), true));
        assert!(!parse_flag(Some("0"), true));
    }

    #[test]
    fn flag_falls_back_to_default_on_absence_or_garbage() {
        assert!(parse_flag(None, true));
        assert!(!parse_flag(Some("maybe"), false));
    }

    #[test]
    fn bind_addr_rejects_garbage() {
        assert!(parse_bind_addr("not-an-address").is_err());
        assert!(parse_bind_addr("0.0.0.0:8080").is_ok());
    }
}
