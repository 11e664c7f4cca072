//! 隧道结构化事件
//!
//! 隧道生命周期中的每次状态变化都会报告给创建时注入的 [`TunnelObserver`]。
//! 默认实现写入 `tracing`，[`MemoryObserver`] 把事件保存在内存中。

use crate::tunnel::TunnelLimits;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 连接内转发管道的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 入站套接字到出站套接字
    Upstream,
    /// 出站套接字回到入站套接字
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "ingress->egress"),
            Direction::Downstream => write!(f, "egress->ingress"),
        }
    }
}

/// 连接关闭的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 某个方向读到 EOF
    Completed,
    /// 某个方向出现 I/O 错误
    Failed(String),
    /// 监听套接字失效，连接随之关闭
    ListenerLost,
    /// 隧道正在关闭
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Completed => write!(f, "completed"),
            CloseReason::Failed(e) => write!(f, "failed: {}", e),
            CloseReason::ListenerLost => write!(f, "listener lost"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// 连接的哪一侧套接字
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Ingress,
    Egress,
}

/// 隧道生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    ListenStarted {
        addr: SocketAddr,
    },
    ListenFailed {
        error: String,
    },
    ListenRetryScheduled {
        delay: Duration,
    },
    AcceptFailed {
        error: String,
    },
    ConnectionAccepted {
        id: u64,
        peer: SocketAddr,
    },
    DialFailed {
        id: u64,
        remote: String,
        error: String,
    },
    ConnectionOpened {
        id: u64,
        connection_limit: u64,
    },
    ForwardFailed {
        id: u64,
        direction: Direction,
        error: String,
    },
    ConnectionClosed {
        id: u64,
        reason: CloseReason,
    },
    CloseFailed {
        id: u64,
        side: Side,
        error: String,
    },
    LimitsUpdated {
        limits: TunnelLimits,
        active_connections: usize,
    },
    ShutdownStarted,
    Stopped,
}

/// 隧道事件接收者
pub trait TunnelObserver: Send + Sync {
    fn on_event(&self, tunnel: &str, event: &TunnelEvent);
}

/// 把事件写入 `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TunnelObserver for TracingObserver {
    fn on_event(&self, tunnel: &str, event: &TunnelEvent) {
        match event {
            TunnelEvent::ListenStarted { addr } => {
                info!("Tunnel '{}' listening on {}", tunnel, addr)
            }
            TunnelEvent::ListenFailed { error } => {
                error!("Tunnel '{}' failed to listen: {}", tunnel, error)
            }
            TunnelEvent::ListenRetryScheduled { delay } => {
                warn!("Tunnel '{}' retrying listen in {:?}", tunnel, delay)
            }
            TunnelEvent::AcceptFailed { error } => error!(
                "Tunnel '{}' unable to accept connections, dropping listener: {}",
                tunnel, error
            ),
            TunnelEvent::ConnectionAccepted { id, peer } => {
                info!("Tunnel '{}' accepted connection #{} from {}", tunnel, id, peer)
            }
            TunnelEvent::DialFailed { id, remote, error } => warn!(
                "Tunnel '{}' connection #{}: failed to connect to {}: {}",
                tunnel, id, remote, error
            ),
            TunnelEvent::ConnectionOpened {
                id,
                connection_limit,
            } => debug!(
                "Tunnel '{}' connection #{} forwarding (limit {} B/s)",
                tunnel, id, connection_limit
            ),
            TunnelEvent::ForwardFailed {
                id,
                direction,
                error,
            } => warn!(
                "Tunnel '{}' connection #{}: forwarding {} failed: {}",
                tunnel, id, direction, error
            ),
            TunnelEvent::ConnectionClosed { id, reason } => {
                info!("Tunnel '{}' closed connection #{} ({})", tunnel, id, reason)
            }
            TunnelEvent::CloseFailed { id, side, error } => debug!(
                "Tunnel '{}' connection #{}: failed to close {:?} socket: {}",
                tunnel, id, side, error
            ),
            TunnelEvent::LimitsUpdated {
                limits,
                active_connections,
            } => info!(
                "Tunnel '{}' limits updated: {} ({} active connections)",
                tunnel, limits, active_connections
            ),
            TunnelEvent::ShutdownStarted => info!("Tunnel '{}' shutting down", tunnel),
            TunnelEvent::Stopped => info!("Tunnel '{}' stopped", tunnel),
        }
    }
}

/// 在内存中记录事件
#[derive(Debug, Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<(String, TunnelEvent)>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已记录事件的快照
    pub fn events(&self) -> Vec<TunnelEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// 满足 `pred` 的事件数量
    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&TunnelEvent) -> bool,
    {
        self.events.lock().iter().filter(|(_, e)| pred(e)).count()
    }

    /// 单条隧道的事件
    pub fn events_of(&self, tunnel: &str) -> Vec<TunnelEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == tunnel)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TunnelObserver for MemoryObserver {
    fn on_event(&self, tunnel: &str, event: &TunnelEvent) {
        self.events.lock().push((tunnel.to_string(), event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_observer_records() {
        let observer = MemoryObserver::new();
        observer.on_event("t", &TunnelEvent::ShutdownStarted);
        observer.on_event(
            "t",
            &TunnelEvent::ConnectionClosed {
                id: 1,
                reason: CloseReason::Completed,
            },
        );

        assert_eq!(observer.events().len(), 2);
        assert_eq!(
            observer.count(|e| matches!(e, TunnelEvent::ConnectionClosed { .. })),
            1
        );

        observer.clear();
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(Direction::Upstream.to_string(), "ingress->egress");
        assert_eq!(
            CloseReason::Failed("reset".into()).to_string(),
            "failed: reset"
        );
    }
}
