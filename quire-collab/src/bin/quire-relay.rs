//! Standalone relay.
//!
//! Usage: `quire-relay [ADDR]`. Without an argument the address comes from
//! `QUIRE_RELAY_ADDR`, then the default `127.0.0.1:9090`. Log verbosity is
//! controlled by `RUST_LOG`.

use quire_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("QUIRE_RELAY_ADDR").ok())
        .unwrap_or_else(|| RelayConfig::default().bind_addr);

    let server = RelayServer::new(RelayConfig {
        bind_addr,
        ..RelayConfig::default()
    });

    if let Err(e) = server.run().await {
        log::error!("Relay on {} failed: {e}", server.bind_addr());
        std::process::exit(1);
    }
}
