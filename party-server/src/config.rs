//! Startup configuration. Everything the server needs arrives on the
//! command line; there is no persistent configuration and no state that
//! survives a restart.

use std::path::PathBuf;

use clap::Parser;

/// The party game server.
#[derive(Debug, Parser)]
#[command(name = "party-server")]
pub struct ServerConfig {
    /// Port for inbound player connections.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Run against a single local image server on 127.0.0.1:<PORT>.
    #[arg(long, value_name = "PORT", conflicts_with = "upstream")]
    pub local: Option<u16>,

    /// A remote upstream image server as host:port. Repeatable.
    #[arg(long = "upstream", value_name = "HOST:PORT")]
    pub upstream: Vec<String>,

    /// Directory holding the mini game scripts (*.json).
    #[arg(long, default_value = "games")]
    pub games_dir: PathBuf,

    /// Directory holding image assets (scene images, placeholders/).
    #[arg(long, default_value = "assets")]
    pub assets_dir: PathBuf,
}

impl ServerConfig {
    /// The upstream endpoints to drive. Local mode wins; otherwise every
    /// well-formed `--upstream` entry counts, bad ones are logged and
    /// skipped.
    pub fn upstream_endpoints(&self) -> Vec<(String, u16)> {
        if let Some(port) = self.local {
            return vec![("127.0.0.1".to_string(), port)];
        }
        self.upstream
            .iter()
            .filter_map(|entry| match parse_endpoint(entry) {
                Some(endpoint) => Some(endpoint),
                None => {
                    tracing::error!(entry, "Ignoring malformed upstream, expected host:port.");
                    None
                }
            })
            .collect()
    }
}

fn parse_endpoint(entry: &str) -> Option<(String, u16)> {
    let (host, port) = entry.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}
