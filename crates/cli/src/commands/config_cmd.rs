//! `fastrag config` — Configuration management commands.

use fastrag_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   Config parsed and validated");

            let mut warnings = Vec::new();
            if let Err(e) = fastrag_config::resolve_api_key(&config.provider.api_key_ref) {
                warnings.push(format!("Provider key unavailable: {e}"));
            }
            if config.storage.backend == "memory" {
                warnings.push("In-memory storage: conversations and notes are lost on exit".into());
            }
            if config.embedding.provider == "openai" {
                if let Err(e) = fastrag_config::resolve_api_key(&config.embedding.api_key_ref) {
                    warnings.push(format!("Embedding key unavailable: {e}"));
                }
            }

            for w in &warnings {
                println!("   Warning: {w}");
            }

            println!();
            println!(
                "   Provider:  {} ({})",
                config.provider.provider_name, config.provider.model_name
            );
            println!(
                "   Context:   {} tokens, {} reserved for output",
                config.provider.max_context_tokens, config.provider.max_output_tokens
            );
            println!(
                "   Embedding: {} ({} dims)",
                config.embedding.provider, config.embedding.dimensions
            );
            println!(
                "   Storage:   {} ({})",
                config.storage.backend, config.storage.database_url
            );
            println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Print the effective configuration. Only the names of key variables
/// appear in it, never their values.
pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}
