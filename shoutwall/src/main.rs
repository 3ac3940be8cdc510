use shoutwall::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "starting relay: bind={} max_len={} rate_ms={} history={} geo={:?} storage={:?}",
        config.bind_addr,
        config.max_len,
        config.rate_ms,
        config.history_limit,
        config.geo.mode,
        config.storage_path,
    );

    let server = RelayServer::new(config)?;
    server.run().await
}
