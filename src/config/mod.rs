// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use crate::tunnel::{TunnelBuilder, TunnelLimits};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "BW_TUNNEL_";

/// 监听失败后的重试间隔（秒）- 可通过环境变量 BW_TUNNEL_RETRY_INTERVAL_SECS 覆盖
pub const RETRY_INTERVAL_SECS: u64 = 5;
/// 连接远端超时（秒）- 可通过环境变量 BW_TUNNEL_CONNECT_TIMEOUT_SECS 覆盖
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

pub fn get_retry_interval() -> Duration {
    let secs = std::env::var(format!("{}RETRY_INTERVAL_SECS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(RETRY_INTERVAL_SECS);
    Duration::from_secs(secs)
}

pub fn get_connect_timeout() -> Duration {
    let secs = std::env::var(format!("{}CONNECT_TIMEOUT_SECS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// 全局设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// 监听失败后的重试间隔（秒），缺省使用环境变量或 5 秒
    #[serde(default)]
    pub retry_interval_secs: Option<u64>,
    /// 连接远端超时（秒），缺省使用环境变量或 10 秒
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl Settings {
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(get_retry_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(get_connect_timeout)
    }
}

/// 单条隧道配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// 隧道名称
    pub name: String,
    /// 本地监听地址（host:port）
    pub listen_at: String,
    /// 远端地址（host:port）
    pub connect_to: String,
    /// 隧道总带宽（字节/秒）
    pub tunnel_limit: u64,
    /// 单连接带宽（字节/秒）
    pub connection_limit: u64,
}

impl TunnelConfig {
    pub fn limits(&self) -> TunnelLimits {
        TunnelLimits::new(self.tunnel_limit, self.connection_limit)
    }

    /// 监听地址和远端地址都相同，只是限速不同
    pub fn same_endpoints(&self, other: &TunnelConfig) -> bool {
        self.listen_at == other.listen_at && self.connect_to == other.connect_to
    }

    /// 按配置创建隧道构建器
    pub fn builder(&self, settings: &Settings) -> TunnelBuilder {
        TunnelBuilder::new(self.listen_at.clone(), self.connect_to.clone())
            .name(self.name.clone())
            .limits(self.limits())
            .retry_interval(settings.retry_interval())
            .connect_timeout(settings.connect_timeout())
    }
}

/// 应用配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl AppConfig {
    /// 从 TOML 字符串解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            toml::from_str(content).context("Failed to parse tunnel configuration")?;
        ConfigValidator::validate_app_config(&config)
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::from_toml(&content)
    }
}
