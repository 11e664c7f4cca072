/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，库内部统一返回 `Result<T>`，
/// 配置加载和二进制入口使用 anyhow 附加上下文
use std::io;
use thiserror::Error;

/// 隧道的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 监听失败（初次创建隧道或重新监听时）
    #[error("Failed to listen at {addr}: {source}")]
    ListenFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 连接远端失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 操作被取消（连接关闭或隧道关闭）
    #[error("Operation cancelled")]
    Cancelled,

    /// 隧道已关闭，控制循环不再接收事件
    #[error("Tunnel is closed")]
    TunnelClosed,

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 速率限制器错误
    #[error("Rate limit error: {0}")]
    RateLimit(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建监听失败错误
    pub fn listen_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ListenFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}
