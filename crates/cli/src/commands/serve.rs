//! `fastrag serve` — Start the HTTP API server.

use fastrag_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("fastrag gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "   Provider:  {} ({})",
        config.provider.provider_name, config.provider.model_name
    );
    println!("   Storage:   {}", config.storage.backend);

    fastrag_gateway::start(config).await?;

    Ok(())
}
