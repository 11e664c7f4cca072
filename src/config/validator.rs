use std::collections::HashSet;
use tracing::warn;

use super::{AppConfig, TunnelConfig};
use crate::error::{Result, TunnelError};

/// 以配置错误返回
macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err(TunnelError::config_error(format!($($arg)*)))
    };
}

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            invalid!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            invalid!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证限速为正数
    pub fn validate_limit(limit: u64, context: &str) -> Result<()> {
        if limit == 0 {
            invalid!("{} must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证单条隧道配置
    pub fn validate_tunnel_config(tunnel: &TunnelConfig) -> Result<()> {
        Self::validate_name(&tunnel.name, "Tunnel")?;
        Self::validate_address(&tunnel.listen_at, &format!("Tunnel '{}' listen_at", tunnel.name))?;
        Self::validate_address(
            &tunnel.connect_to,
            &format!("Tunnel '{}' connect_to", tunnel.name),
        )?;
        Self::validate_limit(
            tunnel.tunnel_limit,
            &format!("Tunnel '{}' tunnel_limit", tunnel.name),
        )?;
        Self::validate_limit(
            tunnel.connection_limit,
            &format!("Tunnel '{}' connection_limit", tunnel.name),
        )?;

        if tunnel.connection_limit > tunnel.tunnel_limit {
            warn!(
                "Tunnel '{}': connection_limit ({}) is greater than tunnel_limit ({}), \
                 a single connection is still capped by the tunnel limit",
                tunnel.name, tunnel.connection_limit, tunnel.tunnel_limit
            );
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        if config.tunnels.is_empty() {
            invalid!("No tunnel configurations defined");
        }

        let mut seen_names = HashSet::new();
        let mut seen_listen = HashSet::new();

        for tunnel in &config.tunnels {
            Self::validate_tunnel_config(tunnel)?;

            if !seen_names.insert(tunnel.name.as_str()) {
                invalid!(
                    "Duplicate tunnel name '{}': each tunnel must have a unique name",
                    tunnel.name
                );
            }

            if !seen_listen.insert(tunnel.listen_at.as_str()) {
                invalid!(
                    "Duplicate listen_at '{}': each tunnel must listen on a different address",
                    tunnel.listen_at
                );
            }
        }

        if config.settings.retry_interval_secs == Some(0) {
            invalid!("settings.retry_interval_secs must be greater than 0");
        }
        if config.settings.connect_timeout_secs == Some(0) {
            invalid!("settings.connect_timeout_secs must be greater than 0");
        }

        Ok(())
    }
}
