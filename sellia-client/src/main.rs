//! Forwarder binary entrypoint. Reads just enough from flags/environment to
//! build a [`ClientConfig`] and hands off to [`TunnelClient::run`].

mod client;
mod router;

use crate::client::{ClientConfig, TunnelClient};
use crate::router::Router;
use clap::Parser;
use tracing_subscriber::prelude::*;

/// Connect to a Sellia relay and forward traffic to a local service.
#[derive(Parser)]
#[command(name = "sellia-client", about = "Reverse tunnel forwarder")]
struct Cli {
    /// Control channel URL, e.g. wss://relay.example.com/ws
    #[arg(long, env = "SELLIA_RELAY_URL")]
    relay_url: String,

    #[arg(long, env = "SELLIA_API_KEY")]
    api_key: String,

    /// Requested subdomain; a random one is assigned if omitted.
    #[arg(long, env = "SELLIA_SUBDOMAIN")]
    subdomain: Option<String>,

    /// "user:pass" to protect the tunnel with basic auth.
    #[arg(long, env = "SELLIA_BASIC_AUTH")]
    basic_auth: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

    /// Default local port every unmatched path forwards to.
    #[arg(long, default_value_t = 8080)]
    local_port: u16,

    /// Extra routing rule as "pattern=host:port" or "pattern=port" (uses
    /// --local-host). May be given multiple times; earlier rules win.
    #[arg(long = "route")]
    routes: Vec<String>,
}

fn parse_route(spec: &str, default_host: &str) -> anyhow::Result<(String, String, u16)> {
    let (pattern, target) = spec
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("route '{spec}' must be in the form pattern=target"))?;
    let (host, port) = match target.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse()?),
        None => (default_host.to_string(), target.parse()?),
    };
    Ok((pattern.to_string(), host, port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sellia_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut router = Router::new();
    for spec in &cli.routes {
        let (pattern, host, port) = parse_route(spec, &cli.local_host)?;
        router.add_route(pattern, host, port);
    }
    router.set_default(cli.local_host.clone(), cli.local_port);

    let config = ClientConfig {
        relay_url: cli.relay_url,
        api_key: cli.api_key,
        requested_subdomain: cli.subdomain,
        basic_auth: cli.basic_auth,
        router,
    };

    TunnelClient::new(config).run().await
}
