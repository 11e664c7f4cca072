/// 隧道连接模块
///
/// 一个连接由入站套接字、出站套接字、连接级限速器和两个方向的转发任务组成，
/// 两个任务共享同一个取消令牌
use crate::error::TunnelError;
use crate::forwarder::{Forward, ForwardOutcome};
use crate::observer::{CloseReason, Direction, Side, TunnelEvent, TunnelObserver};
use crate::rate_limiter::RateLimiter;
use crate::stats::TunnelStatsTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 转发结束通知，发送给控制循环
#[derive(Debug)]
pub struct ConnectionComplete {
    pub id: u64,
    pub error: Option<TunnelError>,
}

/// 创建连接所需的隧道级上下文
#[derive(Clone)]
pub struct ConnectionContext {
    pub tunnel: Arc<str>,
    pub tunnel_limiter: RateLimiter,
    pub connection_limit: u64,
    pub complete: mpsc::Sender<ConnectionComplete>,
    pub tracker: TaskTracker,
    pub observer: Arc<dyn TunnelObserver>,
    pub stats: TunnelStatsTracker,
}

/// 一个活动连接
pub struct Connection {
    id: u64,
    limiter: RateLimiter,
    cancel: CancellationToken,
    closed: AtomicBool,
    tunnel: Arc<str>,
    observer: Arc<dyn TunnelObserver>,
    stats: TunnelStatsTracker,
}

impl Connection {
    /// 为一对已建立的套接字启动双向转发
    pub fn spawn<I, E>(id: u64, ingress: I, egress: E, ctx: &ConnectionContext) -> Self
    where
        I: AsyncRead + AsyncWrite + Send + 'static,
        E: AsyncRead + AsyncWrite + Send + 'static,
    {
        let limiter = RateLimiter::with_rate(ctx.connection_limit);
        let cancel = CancellationToken::new();
        let limiters = vec![ctx.tunnel_limiter.clone(), limiter.clone()];

        let (ingress_read, ingress_write) = tokio::io::split(ingress);
        let (egress_read, egress_write) = tokio::io::split(egress);

        let upstream = Forward::new(ingress_read, egress_write, limiters.clone(), Direction::Upstream)
            .with_stats(ctx.stats.clone());
        let downstream = Forward::new(egress_read, ingress_write, limiters, Direction::Downstream)
            .with_stats(ctx.stats.clone());

        ctx.tracker.spawn(forward_with_completion(
            id,
            upstream,
            Direction::Upstream,
            cancel.clone(),
            ctx.clone(),
        ));
        ctx.tracker.spawn(forward_with_completion(
            id,
            downstream,
            Direction::Downstream,
            cancel.clone(),
            ctx.clone(),
        ));

        ctx.stats.connection_started();
        ctx.observer.on_event(
            &ctx.tunnel,
            &TunnelEvent::ConnectionOpened {
                id,
                connection_limit: ctx.connection_limit,
            },
        );

        Self {
            id,
            limiter,
            cancel,
            closed: AtomicBool::new(false),
            tunnel: ctx.tunnel.clone(),
            observer: ctx.observer.clone(),
            stats: ctx.stats.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 连接级限速器
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// 关闭连接（幂等）
    ///
    /// 取消共享令牌，两个转发任务随即退出并释放各自持有的套接字。
    /// 重复调用不会产生任何效果。
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.stats.connection_ended();
        self.observer.on_event(
            &self.tunnel,
            &TunnelEvent::ConnectionClosed {
                id: self.id,
                reason,
            },
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(CloseReason::Shutdown);
    }
}

async fn forward_with_completion<R, W>(
    id: u64,
    forward: Forward<R, W>,
    direction: Direction,
    cancel: CancellationToken,
    ctx: ConnectionContext,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ForwardOutcome {
        result,
        close_error,
    } = forward.run(&cancel).await;

    if let Some(e) = close_error {
        let side = match direction {
            Direction::Upstream => Side::Egress,
            Direction::Downstream => Side::Ingress,
        };
        ctx.observer.on_event(
            &ctx.tunnel,
            &TunnelEvent::CloseFailed {
                id,
                side,
                error: e.to_string(),
            },
        );
    }

    let error = match result {
        Ok(_) => None,
        // 已被关闭，没有人等待完成通知
        Err(e) if e.is_cancelled() => return,
        Err(e) => {
            ctx.observer.on_event(
                &ctx.tunnel,
                &TunnelEvent::ForwardFailed {
                    id,
                    direction,
                    error: e.to_string(),
                },
            );
            Some(e)
        }
    };

    if cancel.is_cancelled() {
        return;
    }

    tokio::select! {
        _ = ctx.complete.send(ConnectionComplete { id, error }) => {}
        _ = cancel.cancelled() => {}
    }
}
