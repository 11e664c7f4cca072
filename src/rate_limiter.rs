/// 字节速率限制器模块
///
/// 使用 governor 的 token bucket（GCRA）实现按字节计量的带宽限制，
/// 支持运行时修改速率，正在等待的请求会立即按新速率重新计算
use crate::error::{Result, TunnelError};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 转发缓冲区大小，同时也是令牌桶的突发容量
pub const FORWARDER_BUF_SIZE: usize = 32 * 1024;

/// governor 的补充间隔精度为纳秒，超过该速率无法再精确表示
pub const MAX_BYTES_PER_SECOND: u64 = 1_000_000_000;

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// 速率限制器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// 每秒允许通过的字节数，0 表示不放行任何数据
    pub bytes_per_second: u64,
    /// 突发容量（字节）
    pub burst_size: u32,
}

impl RateLimiterConfig {
    /// 使用默认突发容量（转发缓冲区大小）
    pub fn with_rate(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            burst_size: FORWARDER_BUF_SIZE as u32,
        }
    }
}

struct Inner {
    /// 当前的令牌桶，None 表示速率为 0
    bucket: watch::Sender<Option<Arc<Bucket>>>,
    rate: AtomicU64,
    burst: NonZeroU32,
}

/// 字节速率限制器
///
/// 克隆后的实例共享同一个令牌桶
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

fn build_bucket(bytes_per_second: u64, burst: NonZeroU32) -> Option<Arc<Bucket>> {
    let rate = bytes_per_second.min(MAX_BYTES_PER_SECOND) as u32;
    let rate = NonZeroU32::new(rate)?;
    let quota = Quota::per_second(rate).allow_burst(burst);
    Some(Arc::new(GovernorLimiter::direct(quota)))
}

/// 取走旧桶中剩余的全部容量，返回取走的字节数
///
/// 旧桶即将被替换，按 burst、burst/2、... 逐级尝试扣除即可得到剩余量
fn drain_available(bucket: &Bucket, burst: NonZeroU32) -> u32 {
    let mut available = 0;
    let mut step = burst.get();
    while let Some(cells) = NonZeroU32::new(step) {
        if let Ok(Ok(())) = bucket.check_n(cells) {
            available += step;
        }
        step /= 2;
    }
    available
}

/// 按新速率建桶，初始容量为 `available` 而不是满的突发容量
fn rebuild_bucket(
    bytes_per_second: u64,
    burst: NonZeroU32,
    available: u32,
) -> Option<Arc<Bucket>> {
    let bucket = build_bucket(bytes_per_second, burst)?;
    if let Some(deficit) = NonZeroU32::new(burst.get().saturating_sub(available)) {
        // 新桶是满的，扣除必然成功
        let _ = bucket.check_n(deficit);
    }
    Some(bucket)
}

impl RateLimiter {
    /// 创建新的速率限制器
    pub fn new(config: RateLimiterConfig) -> Self {
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let (bucket, _) = watch::channel(build_bucket(config.bytes_per_second, burst));

        Self {
            inner: Arc::new(Inner {
                bucket,
                rate: AtomicU64::new(config.bytes_per_second),
                burst,
            }),
        }
    }

    /// 按字节速率创建，突发容量为转发缓冲区大小
    pub fn with_rate(bytes_per_second: u64) -> Self {
        Self::new(RateLimiterConfig::with_rate(bytes_per_second))
    }

    /// 当前速率（字节/秒）
    pub fn rate(&self) -> u64 {
        self.inner.rate.load(Ordering::Acquire)
    }

    /// 突发容量（字节）
    pub fn burst_size(&self) -> u32 {
        self.inner.burst.get()
    }

    /// 修改速率，立即对所有后续请求和正在等待的请求生效
    ///
    /// 已积累的容量保留到新桶中，修改速率不会额外放行一次突发。
    /// 速率不变时什么也不做。速率为 0 期间不积累容量。
    pub fn set_rate(&self, bytes_per_second: u64) {
        if self.inner.rate.swap(bytes_per_second, Ordering::AcqRel) == bytes_per_second {
            return;
        }

        let burst = self.inner.burst;
        self.inner.bucket.send_modify(|bucket| {
            let available = bucket
                .as_deref()
                .map(|old| drain_available(old, burst))
                .unwrap_or(0);
            *bucket = rebuild_bucket(bytes_per_second, burst, available);
        });
    }

    /// 异步等待直到获得 `bytes` 字节的许可
    ///
    /// 超过突发容量的请求会被拆分成多次扣除。等待可以被 `cancel` 打断，
    /// 此时返回 `TunnelError::Cancelled`，已扣除的部分不会归还。
    pub async fn acquire(&self, bytes: usize, cancel: &CancellationToken) -> Result<()> {
        let mut updates = self.inner.bucket.subscribe();
        let burst = self.inner.burst.get() as usize;
        let mut remaining = bytes;

        while remaining > 0 {
            let chunk = remaining.min(burst);
            let Some(cells) = NonZeroU32::new(chunk as u32) else {
                break;
            };

            loop {
                if cancel.is_cancelled() {
                    return Err(TunnelError::Cancelled);
                }

                let bucket = updates.borrow_and_update().clone();
                let wait = match bucket {
                    // 速率为 0，只能等待速率更新
                    None => None,
                    Some(bucket) => match bucket.check_n(cells) {
                        Ok(Ok(())) => break,
                        Ok(Err(not_until)) => {
                            Some(not_until.wait_time_from(DefaultClock::default().now()))
                        }
                        Err(e) => return Err(TunnelError::RateLimit(e.to_string())),
                    },
                };

                let delay = async {
                    match wait {
                        Some(duration) => tokio::time::sleep(duration).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                    Ok(()) = updates.changed() => {}
                    _ = delay => {}
                }
            }

            remaining -= chunk;
        }

        Ok(())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("bytes_per_second", &self.rate())
            .field("burst_size", &self.burst_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// 不等待地扣除 `bytes` 字节，失败时返回需要等待的时间
    fn grant(limiter: &RateLimiter, bytes: u32) -> std::result::Result<(), Duration> {
        let Some(cells) = NonZeroU32::new(bytes) else {
            return Ok(());
        };
        let bucket = limiter.inner.bucket.borrow().clone();
        match bucket {
            None => Err(Duration::MAX),
            Some(bucket) => match bucket.check_n(cells) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(not_until)) => Err(not_until.wait_time_from(DefaultClock::default().now())),
                Err(_) => Err(Duration::MAX),
            },
        }
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 1000,
            burst_size: 500,
        });
        assert_eq!(limiter.rate(), 1000);
        assert_eq!(limiter.burst_size(), 500);

        let limiter = RateLimiter::with_rate(42);
        assert_eq!(limiter.burst_size() as usize, FORWARDER_BUF_SIZE);
    }

    #[test]
    fn test_rate_limiter_check() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 100,
            burst_size: 1000,
        });

        // 突发容量内的请求立即通过
        assert!(grant(&limiter, 600).is_ok());
        assert!(grant(&limiter, 400).is_ok());

        // 桶已耗尽
        let wait = grant(&limiter, 100).unwrap_err();
        assert!(wait > Duration::from_millis(500));
    }

    #[test]
    fn test_zero_rate_never_grants() {
        let limiter = RateLimiter::with_rate(0);
        assert_eq!(grant(&limiter, 1), Err(Duration::MAX));
        // 空请求总是通过
        assert!(grant(&limiter, 0).is_ok());
    }

    #[test]
    fn test_rate_limiter_clone_shares_bucket() {
        let limiter1 = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 10,
            burst_size: 100,
        });
        let limiter2 = limiter1.clone();

        assert!(grant(&limiter1, 100).is_ok());
        assert!(grant(&limiter2, 50).is_err());

        limiter2.set_rate(20);
        assert_eq!(limiter1.rate(), 20);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 10_000,
            burst_size: 1_000,
        });
        let cancel = CancellationToken::new();

        limiter.acquire(1_000, &cancel).await.unwrap();

        // 再取 1000 字节需要约 100ms
        let start = Instant::now();
        limiter.acquire(1_000, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_acquire_splits_large_requests() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 100_000,
            burst_size: 1_000,
        });
        let cancel = CancellationToken::new();

        // 5000 字节超过突发容量，拆分后约需 40ms
        let start = Instant::now();
        limiter.acquire(5_000, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let limiter = RateLimiter::with_rate(0);
        let cancel = CancellationToken::new();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(10, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should observe cancellation")
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_rate_change_wakes_waiters() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 1,
            burst_size: 1_000,
        });
        let cancel = CancellationToken::new();
        limiter.acquire(1_000, &cancel).await.unwrap();

        // 1 B/s 下需要等待约 1000 秒
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(1_000, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        limiter.set_rate(1_000_000);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should pick up the new rate")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_zero_rate_resumes_after_update() {
        let limiter = RateLimiter::with_rate(0);
        let cancel = CancellationToken::new();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(100, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        limiter.set_rate(10_000);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_rate_clamped_to_max() {
        let limiter = RateLimiter::with_rate(u64::MAX);
        assert_eq!(limiter.rate(), u64::MAX);
        assert!(grant(&limiter, FORWARDER_BUF_SIZE as u32).is_ok());
    }

    #[test]
    fn test_same_rate_does_not_refill() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 100,
            burst_size: 1_000,
        });
        assert!(grant(&limiter, 1_000).is_ok());

        for _ in 0..10 {
            limiter.set_rate(100);
        }
        assert!(grant(&limiter, 100).is_err());
    }

    #[test]
    fn test_rate_change_does_not_refill_drained_bucket() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 100,
            burst_size: 1_000,
        });
        assert!(grant(&limiter, 1_000).is_ok());

        // 来回切换速率，每次都不应得到新的突发容量
        for i in 0..10 {
            limiter.set_rate(if i % 2 == 0 { 200 } else { 100 });
            assert!(grant(&limiter, 100).is_err(), "refilled on change #{}", i);
        }
    }

    #[test]
    fn test_rate_change_keeps_remaining_capacity() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 10,
            burst_size: 1_000,
        });
        assert!(grant(&limiter, 600).is_ok());

        limiter.set_rate(20);
        assert!(grant(&limiter, 350).is_ok());
        assert!(grant(&limiter, 100).is_err());
    }

    #[test]
    fn test_zero_rate_drops_capacity() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bytes_per_second: 100,
            burst_size: 1_000,
        });
        limiter.set_rate(0);
        assert_eq!(grant(&limiter, 1), Err(Duration::MAX));

        limiter.set_rate(100);
        assert!(grant(&limiter, 500).is_err());
    }
}
