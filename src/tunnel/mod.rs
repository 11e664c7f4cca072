//! 隧道生命周期
//!
//! 每条隧道由一个任务独占（supervisor，控制循环在其中运行），
//! 隧道状态只存在于该任务内，[`Tunnel`] 句柄只通过通道与它通信。

mod control;
mod supervisor;

use crate::config;
use crate::error::{Result, TunnelError};
use crate::observer::{TracingObserver, TunnelEvent, TunnelObserver};
use crate::rate_limiter::{RateLimiter, MAX_BYTES_PER_SECOND};
use crate::stats::{TunnelStats, TunnelStatsTracker};
use crate::transport::{ListenerFactory, TcpListenerFactory};
use control::TunnelState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use supervisor::Supervisor;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 隧道带宽上限（字节/秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelLimits {
    /// 整条隧道的总带宽不超过该值
    pub tunnel_limit: u64,
    /// 单个连接的带宽不超过该值
    pub connection_limit: u64,
}

impl TunnelLimits {
    pub fn new(tunnel_limit: u64, connection_limit: u64) -> Self {
        Self {
            tunnel_limit,
            connection_limit,
        }
    }

    /// 限速器能表示的最高速率
    pub fn unlimited() -> Self {
        Self::new(MAX_BYTES_PER_SECOND, MAX_BYTES_PER_SECOND)
    }
}

impl fmt::Display for TunnelLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tunnel {} B/s, connection {} B/s",
            self.tunnel_limit, self.connection_limit
        )
    }
}

/// 隧道当前所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    /// 正在给定地址上接受连接
    Listening(SocketAddr),
    /// 监听失效，等待重新监听
    Retrying,
    /// 已请求关闭，正在关闭连接
    ShuttingDown,
    /// 隧道任务已退出，所有连接已关闭
    Stopped,
}

/// 发给隧道任务的限速更新，生效后通过 `applied` 通知
pub(crate) struct LimitsUpdate {
    pub limits: TunnelLimits,
    pub applied: oneshot::Sender<()>,
}

/// 隧道构建器
pub struct TunnelBuilder {
    listen_at: String,
    connect_to: String,
    name: Option<String>,
    limits: TunnelLimits,
    retry_interval: Duration,
    connect_timeout: Duration,
    observer: Arc<dyn TunnelObserver>,
    listener_factory: Arc<dyn ListenerFactory>,
}

impl TunnelBuilder {
    pub fn new(listen_at: impl Into<String>, connect_to: impl Into<String>) -> Self {
        Self {
            listen_at: listen_at.into(),
            connect_to: connect_to.into(),
            name: None,
            limits: TunnelLimits::unlimited(),
            retry_interval: config::get_retry_interval(),
            connect_timeout: config::get_connect_timeout(),
            observer: Arc::new(TracingObserver),
            listener_factory: Arc::new(TcpListenerFactory),
        }
    }

    /// 事件中使用的名称，默认为监听地址
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn limits(mut self, limits: TunnelLimits) -> Self {
        self.limits = limits;
        self
    }

    /// 监听失效后两次监听尝试之间的间隔
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// 连接远端的超时时间
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TunnelObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn listener_factory(mut self, factory: Arc<dyn ListenerFactory>) -> Self {
        self.listener_factory = factory;
        self
    }

    /// 开始监听并启动隧道
    ///
    /// 只有首次监听失败时返回错误，之后的监听失败在后台重试
    pub async fn start(self) -> Result<Tunnel> {
        let name: Arc<str> = Arc::from(self.name.as_deref().unwrap_or(&self.listen_at));

        let bound = match self.listener_factory.bind(&self.listen_at).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.observer.on_event(
                    &name,
                    &TunnelEvent::ListenFailed {
                        error: e.to_string(),
                    },
                );
                return Err(TunnelError::listen_failed(&self.listen_at, e));
            }
        };
        self.observer
            .on_event(&name, &TunnelEvent::ListenStarted { addr });

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let stats = TunnelStatsTracker::new(
            name.to_string(),
            self.listen_at.clone(),
            self.connect_to.clone(),
        );
        let (limits_tx, limits_rx) = mpsc::channel(1);
        let (limits_watch, current_limits) = watch::channel(self.limits);
        let (phase_tx, phase) = watch::channel(TunnelPhase::Listening(addr));

        let state = TunnelState {
            name: name.clone(),
            connect_to: self.connect_to,
            connect_timeout: self.connect_timeout,
            tunnel_limiter: RateLimiter::with_rate(self.limits.tunnel_limit),
            connection_limit: self.limits.connection_limit,
            limits: limits_watch,
            limits_rx,
            phase: phase_tx,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            observer: self.observer.clone(),
            stats: stats.clone(),
            next_id: 0,
        };
        let supervisor = Supervisor {
            listen_at: self.listen_at,
            retry_interval: self.retry_interval,
            listener_factory: self.listener_factory,
            state,
        };
        tracker.spawn(supervisor.run(listener));

        Ok(Tunnel {
            name,
            limits_tx,
            limits: current_limits,
            phase,
            shutdown,
            tracker,
            stats,
            observer: self.observer,
        })
    }
}

/// 运行中隧道的控制句柄
pub struct Tunnel {
    name: Arc<str>,
    limits_tx: mpsc::Sender<LimitsUpdate>,
    limits: watch::Receiver<TunnelLimits>,
    phase: watch::Receiver<TunnelPhase>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: TunnelStatsTracker,
    observer: Arc<dyn TunnelObserver>,
}

impl Tunnel {
    pub fn builder(listen_at: impl Into<String>, connect_to: impl Into<String>) -> TunnelBuilder {
        TunnelBuilder::new(listen_at, connect_to)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前生效的限速
    pub fn limits(&self) -> TunnelLimits {
        *self.limits.borrow()
    }

    pub fn phase(&self) -> TunnelPhase {
        *self.phase.borrow()
    }

    /// 隧道的监听地址，重试期间为 `None`
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.phase() {
            TunnelPhase::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats.get_stats()
    }

    /// 设置新的带宽限制
    ///
    /// 隧道应用后才返回，此时隧道总速率已修改，所有活动连接都已使用新的连接速率。
    /// 未变化的速率保持原样，已积累的令牌不会因更新而增加。
    ///
    /// 更新由隧道任务串行处理。该任务正在连接远端时，更新要等这次连接完成，
    /// 最长约为 `connect_timeout`（默认 10 秒）。
    pub async fn update_limits(&self, limits: TunnelLimits) -> Result<()> {
        let (applied, applied_rx) = oneshot::channel();
        self.limits_tx
            .send(LimitsUpdate { limits, applied })
            .await
            .map_err(|_| TunnelError::TunnelClosed)?;
        applied_rx.await.map_err(|_| TunnelError::TunnelClosed)
    }

    /// 关闭隧道，等待监听器、所有连接和转发任务都退出
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.observer.on_event(&self.name, &TunnelEvent::Stopped);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 使用默认选项创建隧道
pub async fn create_tunnel(
    listen_at: impl Into<String>,
    connect_to: impl Into<String>,
    limits: TunnelLimits,
) -> Result<Tunnel> {
    Tunnel::builder(listen_at, connect_to)
        .limits(limits)
        .start()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_display() {
        let limits = TunnelLimits::new(1_000_000, 500_000);
        assert_eq!(
            limits.to_string(),
            "tunnel 1000000 B/s, connection 500000 B/s"
        );
    }

    #[test]
    fn test_unlimited() {
        let limits = TunnelLimits::unlimited();
        assert_eq!(limits.tunnel_limit, MAX_BYTES_PER_SECOND);
        assert_eq!(limits.connection_limit, MAX_BYTES_PER_SECOND);
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_address() {
        let result = create_tunnel("not-an-address", "127.0.0.1:1", TunnelLimits::unlimited()).await;
        assert!(matches!(result, Err(TunnelError::ListenFailed { .. })));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let tunnel = Tunnel::builder("127.0.0.1:0", "127.0.0.1:1")
            .name("idle")
            .start()
            .await
            .unwrap();

        assert_eq!(tunnel.name(), "idle");
        assert!(tunnel.local_addr().is_some());
        assert_eq!(tunnel.stats().active_connections, 0);

        tokio::time::timeout(Duration::from_secs(2), tunnel.shutdown())
            .await
            .expect("idle tunnel should shut down promptly");
    }
}
