/// 限速转发模块
///
/// 从源读取一块数据，依次向所有限速器申请该块大小的许可，然后写入目标
use crate::error::{Result, TunnelError};
use crate::observer::Direction;
use crate::rate_limiter::{RateLimiter, FORWARDER_BUF_SIZE};
use crate::stats::TunnelStatsTracker;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// 单向转发结果
#[derive(Debug)]
pub struct ForwardOutcome {
    /// 转发的字节数（EOF 时）或转发错误
    pub result: Result<u64>,
    /// 关闭写端时的错误（仅记录，不影响结果）
    pub close_error: Option<io::Error>,
}

/// 单向限速转发
pub struct Forward<R, W> {
    from: R,
    to: W,
    limiters: Vec<RateLimiter>,
    direction: Direction,
    stats: Option<TunnelStatsTracker>,
}

impl<R, W> Forward<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(from: R, to: W, limiters: Vec<RateLimiter>, direction: Direction) -> Self {
        Self {
            from,
            to,
            limiters,
            direction,
            stats: None,
        }
    }

    /// 记录转发字节数
    pub fn with_stats(mut self, stats: TunnelStatsTracker) -> Self {
        self.stats = Some(stats);
        self
    }

    /// 转发直到 EOF、I/O 错误或取消，结束后关闭写端
    pub async fn run(mut self, cancel: &CancellationToken) -> ForwardOutcome {
        let result = self.copy(cancel).await;
        let close_error = self.to.shutdown().await.err();
        ForwardOutcome {
            result,
            close_error,
        }
    }

    async fn copy(&mut self, cancel: &CancellationToken) -> Result<u64> {
        let mut buf = vec![0u8; FORWARDER_BUF_SIZE];
        let mut total = 0u64;

        loop {
            let n = tokio::select! {
                read = self.from.read(&mut buf) => read?,
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            };
            if n == 0 {
                return Ok(total);
            }

            for limiter in &self.limiters {
                limiter.acquire(n, cancel).await?;
            }

            tokio::select! {
                written = self.to.write_all(&buf[..n]) => written?,
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            }

            total += n as u64;
            if let Some(stats) = &self.stats {
                stats.add_bytes(self.direction, n as u64);
            }
        }
    }
}
