use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::MappingConfig;

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// Check port mapping file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let config = match MappingConfig::load(config_path).and_then(MappingConfig::require_non_empty) {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(e.to_string()),
                    details: serde_json::json!({ "path": config_path }),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Checking port mapping file: {}\n", config_path);
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{}", e);

                println!("\nCommon issues:");
                println!("  1. Every mapping needs <title>.localPort, <title>.remoteHost and <title>.remotePort");
                println!("  2. Port numbers must be between 0 and 65535");
                println!("  3. Each localPort may only be used by one mapping");
            }
            return Err(e).with_context(|| format!("Invalid port mapping file: {}", config_path));
        }
    };

    let mut warnings = Vec::new();
    for mapping in config.mappings() {
        if mapping.remote().port() == 0 {
            warnings.push(format!("Mapping '{}' forwards to port 0", mapping.title()));
        }
        if mapping.local_addr().port() == 0 {
            warnings.push(format!(
                "Mapping '{}' listens on an ephemeral port",
                mapping.title()
            ));
        }
    }

    if format == "json" {
        let result = CheckResult {
            valid: true,
            warnings,
            error: None,
            details: serde_json::json!({
                "path": config_path,
                "mappings_count": config.len(),
                "mappings": config.mappings(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Checking port mapping file: {}\n", config_path);
        println!("✓ Number of mappings: {}", config.len());
        for (idx, mapping) in config.mappings().iter().enumerate() {
            println!(
                "  Mapping #{}: '{}' ({} -> {})",
                idx + 1,
                mapping.title(),
                mapping.local_addr(),
                mapping.remote()
            );
        }
        for warning in &warnings {
            println!("⚠ Warning: {}", warning);
        }
        println!("\n✓ Port mapping file is valid!");
    }

    Ok(())
}
