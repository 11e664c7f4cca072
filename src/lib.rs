/// 带宽受控的 TCP 隧道库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod forwarder;
pub mod manager;
pub mod observer;
pub mod rate_limiter;
pub mod stats;
pub mod transport;
pub mod tunnel;

// 重新导出常用类型
pub use config::{AppConfig, Settings, TunnelConfig};
pub use error::{Result, TunnelError};
pub use manager::{ReloadSummary, TunnelManager};
pub use observer::{
    CloseReason, Direction, MemoryObserver, TracingObserver, TunnelEvent, TunnelObserver,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, FORWARDER_BUF_SIZE};
pub use stats::TunnelStats;
pub use transport::{ListenerFactory, TcpListenerFactory, TunnelListener};
pub use tunnel::{create_tunnel, Tunnel, TunnelBuilder, TunnelLimits, TunnelPhase};
