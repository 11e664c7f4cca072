/// 隧道控制循环
///
/// 唯一持有隧道可变状态的地方：活动连接集合、隧道级限速器、当前连接限速。
/// 接受连接、转发完成、限速更新和关闭四类事件都在这里串行处理。
use super::{LimitsUpdate, TunnelLimits, TunnelPhase};
use crate::connection::{Connection, ConnectionComplete, ConnectionContext};
use crate::error::TunnelError;
use crate::observer::{CloseReason, TunnelEvent, TunnelObserver};
use crate::rate_limiter::RateLimiter;
use crate::stats::TunnelStatsTracker;
use crate::transport::TunnelListener;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// 完成通知队列长度
const COMPLETION_QUEUE: usize = 64;

type Accepted = io::Result<(TcpStream, SocketAddr)>;

/// 隧道状态，只由所属任务访问
pub(super) struct TunnelState {
    pub(super) name: Arc<str>,
    pub(super) connect_to: String,
    pub(super) connect_timeout: Duration,
    pub(super) tunnel_limiter: RateLimiter,
    pub(super) connection_limit: u64,
    pub(super) limits: watch::Sender<TunnelLimits>,
    pub(super) limits_rx: mpsc::Receiver<LimitsUpdate>,
    pub(super) phase: watch::Sender<TunnelPhase>,
    pub(super) shutdown: CancellationToken,
    pub(super) tracker: TaskTracker,
    pub(super) observer: Arc<dyn TunnelObserver>,
    pub(super) stats: TunnelStatsTracker,
    pub(super) next_id: u64,
}

impl TunnelState {
    pub(super) fn emit(&self, event: TunnelEvent) {
        self.observer.on_event(&self.name, &event);
    }

    pub(super) fn set_phase(&self, phase: TunnelPhase) {
        self.phase.send_replace(phase);
    }

    /// 在给定的监听套接字上运行控制循环
    ///
    /// 收到关闭信号时返回 Ok(())；监听套接字不可用时返回错误。
    /// 两种情况下返回前都会关闭所有活动连接。
    pub(super) async fn run(&mut self, listener: Box<dyn TunnelListener>) -> io::Result<()> {
        let (pending_tx, mut pending_rx) = mpsc::channel::<Accepted>(1);
        let acceptor = self.shutdown.child_token();
        self.tracker
            .spawn(accept_loop(listener, pending_tx, acceptor.clone()));

        let (complete_tx, mut complete_rx) = mpsc::channel(COMPLETION_QUEUE);
        let mut active: HashMap<u64, Connection> = HashMap::new();

        let result = loop {
            tokio::select! {
                Some(accepted) = pending_rx.recv() => match accepted {
                    Ok((ingress, peer)) => {
                        if let Some(conn) = self.open_connection(ingress, peer, &complete_tx).await {
                            active.insert(conn.id(), conn);
                        }
                    }
                    Err(e) => {
                        self.emit(TunnelEvent::AcceptFailed { error: e.to_string() });
                        break Err(e);
                    }
                },
                Some(complete) = complete_rx.recv() => {
                    // 不在集合中说明已被关闭，迟到的通知直接忽略
                    if let Some(conn) = active.remove(&complete.id) {
                        let reason = match complete.error {
                            None => CloseReason::Completed,
                            Some(e) => CloseReason::Failed(e.to_string()),
                        };
                        conn.close(reason);
                    }
                }
                Some(update) = self.limits_rx.recv() => {
                    self.apply_limits(update, active.values());
                }
                _ = self.shutdown.cancelled() => {
                    self.set_phase(TunnelPhase::ShuttingDown);
                    self.emit(TunnelEvent::ShutdownStarted);
                    break Ok(());
                }
            }
        };

        // 停止接受，关闭已接受但尚未处理的套接字
        acceptor.cancel();
        pending_rx.close();
        while let Ok(accepted) = pending_rx.try_recv() {
            if let Ok((ingress, peer)) = accepted {
                debug!("Tunnel '{}' dropping pending connection from {}", self.name, peer);
                drop(ingress);
            }
        }

        let reason = match result {
            Ok(()) => CloseReason::Shutdown,
            Err(_) => CloseReason::ListenerLost,
        };
        for (_, conn) in active.drain() {
            conn.close(reason.clone());
        }

        result
    }

    /// 等待重新监听的时间间隔，期间仍然处理限速更新
    ///
    /// 返回 false 表示等待期间收到了关闭信号
    pub(super) async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        self.set_phase(TunnelPhase::Retrying);
        self.emit(TunnelEvent::ListenRetryScheduled { delay });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                Some(update) = self.limits_rx.recv() => {
                    self.apply_limits(update, std::iter::empty::<&Connection>());
                }
                _ = self.shutdown.cancelled() => {
                    self.set_phase(TunnelPhase::ShuttingDown);
                    self.emit(TunnelEvent::ShutdownStarted);
                    return false;
                }
            }
        }
    }

    fn apply_limits<'a>(
        &mut self,
        update: LimitsUpdate,
        connections: impl Iterator<Item = &'a Connection>,
    ) {
        let LimitsUpdate { limits, applied } = update;

        self.tunnel_limiter.set_rate(limits.tunnel_limit);
        self.connection_limit = limits.connection_limit;

        let mut active_connections = 0;
        for conn in connections {
            conn.limiter().set_rate(limits.connection_limit);
            active_connections += 1;
        }

        self.limits.send_replace(limits);
        self.emit(TunnelEvent::LimitsUpdated {
            limits,
            active_connections,
        });

        // 调用方可能已放弃等待
        let _ = applied.send(());
    }

    async fn open_connection(
        &mut self,
        ingress: TcpStream,
        peer: SocketAddr,
        complete: &mpsc::Sender<ConnectionComplete>,
    ) -> Option<Connection> {
        self.next_id += 1;
        let id = self.next_id;
        self.emit(TunnelEvent::ConnectionAccepted { id, peer });

        let dial = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(self.connect_to.as_str()),
        );
        let dialed = tokio::select! {
            dialed = dial => match dialed {
                Ok(Ok(egress)) => Ok(egress),
                Ok(Err(e)) => Err(TunnelError::connection_failed(&self.connect_to, e)),
                Err(_) => Err(TunnelError::timeout(self.connect_timeout)),
            },
            _ = self.shutdown.cancelled() => Err(TunnelError::Cancelled),
        };

        let egress = match dialed {
            Ok(egress) => egress,
            Err(e) => {
                self.emit(TunnelEvent::DialFailed {
                    id,
                    remote: self.connect_to.clone(),
                    error: e.to_string(),
                });
                // 入站套接字随 drop 关闭
                drop(ingress);
                return None;
            }
        };

        let ctx = ConnectionContext {
            tunnel: self.name.clone(),
            tunnel_limiter: self.tunnel_limiter.clone(),
            connection_limit: self.connection_limit,
            complete: complete.clone(),
            tracker: self.tracker.clone(),
            observer: self.observer.clone(),
            stats: self.stats.clone(),
        };
        Some(Connection::spawn(id, ingress, egress, &ctx))
    }
}

/// 接受连接并交给控制循环，accept 失败时报告错误后退出
async fn accept_loop(
    listener: Box<dyn TunnelListener>,
    pending: mpsc::Sender<Accepted>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => return,
        };
        let failed = accepted.is_err();

        // 取消时未送达的套接字随 future 一起被 drop 并关闭
        tokio::select! {
            sent = pending.send(accepted) => {
                if sent.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }

        if failed {
            return;
        }
    }
}
