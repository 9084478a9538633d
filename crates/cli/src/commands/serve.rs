//! `streamweave serve` — Start the gateway.

use std::path::Path;
use streamweave_config::AppConfig;

pub async fn run(
    config_path: Option<&Path>,
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load_with(config_path).map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }
    if let Some(host) = host_override {
        config.gateway.host = host;
    }

    if !config.has_api_key() {
        tracing::warn!("No model API key set (STREAMWEAVE_API_KEY or OPENAI_API_KEY); model calls will fail");
    }

    println!("StreamWeave Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Provider:  {} ({})", config.default_provider, config.default_model);
    println!("   Storage:   {:?}", config.storage.backend);
    println!("   Auth:      {}", if config.gateway.api_key.is_some() { "api key" } else { "open" });

    streamweave_gateway::start(config).await?;

    Ok(())
}
