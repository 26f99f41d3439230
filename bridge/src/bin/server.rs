use weave_bridge::{start_server, BridgeConfig};
use weave_core::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_env()?;
    init_tracing();

    tracing::info!(
        addr = %config.addr,
        max_requests = config.mesh.rate_limit.max_requests,
        window_ms = config.mesh.rate_limit.window_ms,
        "Weave Bridge configured"
    );

    // Blocks until the server exits
    start_server(config).await.map_err(|e| e.into())
}
