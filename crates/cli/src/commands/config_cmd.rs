//! `juris config`: configuration management commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use juris_config::AppConfig;

fn config_path() -> PathBuf {
    AppConfig::config_dir().join("config.toml")
}

pub fn validate() -> anyhow::Result<()> {
    println!("Validating configuration...");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   warning: {w}");
        }
    }

    println!();
    println!("   Engine:    {}", config.engine_url);
    println!("   Model:     {}", config.model);
    println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "   Tracing:   {}",
        config.telemetry.endpoint.as_deref().unwrap_or("log only")
    );
    Ok(())
}

/// Problems that do not stop the process from starting.
fn warnings(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.api_key.is_none() {
        warnings.push("No engine API key set (set JURIS_API_KEY or OPENAI_API_KEY)");
    }
    if config.corpus.corpus_key.is_empty() || config.corpus.api_key.is_none() {
        warnings.push("No corpus configured; the bundled sample corpus will be searched");
    }
    if config.demo.examples.is_empty() {
        warnings.push("No example queries configured (set [demo] examples or QUERY_EXAMPLES)");
    }
    warnings
}

pub fn show() -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;
    config.api_key = config.api_key.as_ref().map(|_| "[REDACTED]".into());
    config.corpus.api_key = config.corpus.api_key.as_ref().map(|_| "[REDACTED]".into());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn init(force: bool) -> anyhow::Result<()> {
    let path = config_path();
    write_default(&path, force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Write the default configuration to `path`, creating parent directories.
fn write_default(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn path() {
    println!("{}", config_path().display());
}
