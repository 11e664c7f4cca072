use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::error::TunnelError;

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

impl CheckResult {
    fn failed(error: String) -> Self {
        Self {
            valid: false,
            warnings: vec![],
            error: Some(error),
            details: serde_json::json!({}),
        }
    }
}

/// 展开路径中的 ~ 并转换为绝对路径
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        // 相对路径转换为绝对路径
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 配置中值得提醒但不影响运行的问题
fn collect_warnings(config: &AppConfig) -> Vec<String> {
    config
        .tunnels
        .iter()
        .filter(|t| t.connection_limit > t.tunnel_limit)
        .map(|t| {
            format!(
                "Tunnel '{}': connection_limit ({}) exceeds tunnel_limit ({})",
                t.name, t.connection_limit, t.tunnel_limit
            )
        })
        .collect()
}

/// 校验未通过时给出配置内容相关的提示，否则提示检查 TOML 语法
fn hints_for(error: &anyhow::Error) -> &'static [&'static str] {
    let invalid_values = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<TunnelError>())
        .any(TunnelError::is_config_error);

    if invalid_values {
        &[
            "Limits are bytes per second and must be greater than 0",
            "Tunnel names and listen addresses must be unique",
            "Addresses and names cannot be empty",
        ]
    } else {
        &[
            "Check TOML syntax (brackets, quotes, commas)",
            "Each [[tunnels]] needs name, listen_at, connect_to, tunnel_limit and connection_limit",
        ]
    }
}

/// 检查配置文件格式
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            let result =
                CheckResult::failed(format!("Configuration file not found: {}", config_path));
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    match AppConfig::load(config_path) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            let tunnels: Vec<_> = config
                .tunnels
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "listen_at": t.listen_at,
                        "connect_to": t.connect_to,
                        "tunnel_limit": t.tunnel_limit,
                        "connection_limit": t.connection_limit,
                    })
                })
                .collect();
            let details = serde_json::json!({
                "retry_interval_secs": config.settings.retry_interval().as_secs(),
                "connect_timeout_secs": config.settings.connect_timeout().as_secs(),
                "tunnels_count": config.tunnels.len(),
                "tunnels": tunnels,
            });

            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details,
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "✓ Retry interval: {}s",
                    config.settings.retry_interval().as_secs()
                );
                println!(
                    "✓ Connect timeout: {}s",
                    config.settings.connect_timeout().as_secs()
                );
                println!("✓ Number of tunnels: {}", config.tunnels.len());
                for (idx, tunnel) in config.tunnels.iter().enumerate() {
                    println!(
                        "  Tunnel #{}: '{}' {} -> {} ({})",
                        idx + 1,
                        tunnel.name,
                        tunnel.listen_at,
                        tunnel.connect_to,
                        tunnel.limits()
                    );
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult::failed(format!("{:#}", e));
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                for (idx, hint) in hints_for(&e).iter().enumerate() {
                    println!("  {}. {}", idx + 1, hint);
                }
            }

            Err(e)
        }
    }
}
