//! Party Relay: stateless WebSocket relay for party rooms.
//!
//! Usage: `party-relay [BIND_ADDR]`. The address falls back to
//! `PARTY_RELAY_ADDR`, then to `127.0.0.1:9090`. Log level comes from
//! `RUST_LOG`.

use log::{error, info};
use party_sync::relay::{RelayConfig, RelayServer};

/// Environment variable consulted when no address is given.
const ADDR_ENV: &str = "PARTY_RELAY_ADDR";

fn config_from(arg: Option<String>, env: Option<String>) -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Some(addr) = arg.or(env).filter(|a| !a.trim().is_empty()) {
        config.bind_addr = addr.trim().to_string();
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from(std::env::args().nth(1), std::env::var(ADDR_ENV).ok());
    info!("Starting Party Relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_address() {
        assert_eq!(config_from(None, None).bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_argument_wins_over_env() {
        let config = config_from(Some("0.0.0.0:7000".into()), Some("0.0.0.0:8000".into()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config_from(None, Some(" 0.0.0.0:8000 ".into())).bind_addr, "0.0.0.0:8000");
    }

    #[test]
    fn test_blank_values_ignored() {
        assert_eq!(config_from(Some("  ".into()), None).bind_addr, "127.0.0.1:9090");
    }
}
