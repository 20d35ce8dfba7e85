//! `juris serve`: start the HTTP gateway.

use anyhow::Context;
use juris_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("juris gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.model);
    println!(
        "   Corpus:    {}",
        if config.corpus.corpus_key.is_empty() {
            "bundled sample"
        } else {
            config.corpus.corpus_key.as_str()
        }
    );

    juris_gateway::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway failed: {e}"))?;

    Ok(())
}
