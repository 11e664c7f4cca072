use crate::observer::Direction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// 单条隧道的统计信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStats {
    /// 隧道名称
    pub name: String,
    /// 监听地址
    pub listen_at: String,
    /// 远端地址
    pub connect_to: String,
    /// 累计转发的连接数
    pub total_connections: u64,
    /// 当前活动连接数
    pub active_connections: u64,
    /// 入站到出站方向转发的字节数
    pub bytes_upstream: u64,
    /// 出站到入站方向转发的字节数
    pub bytes_downstream: u64,
    /// 隧道创建时间（Unix 时间戳）
    pub start_time: u64,
}

/// 单条隧道的统计计数器
#[derive(Debug, Clone)]
pub struct TunnelStatsTracker {
    name: String,
    listen_at: String,
    connect_to: String,
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    bytes_upstream: Arc<AtomicU64>,
    bytes_downstream: Arc<AtomicU64>,
    start_time: u64,
}

impl TunnelStatsTracker {
    pub fn new(name: String, listen_at: String, connect_to: String) -> Self {
        Self {
            name,
            listen_at,
            connect_to,
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            bytes_upstream: Arc::new(AtomicU64::new(0)),
            bytes_downstream: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// 连接建立时调用
    pub fn connection_started(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// 连接关闭时调用一次
    pub fn connection_ended(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// 累加某个方向转发的字节数
    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        let counter = match direction {
            Direction::Upstream => &self.bytes_upstream,
            Direction::Downstream => &self.bytes_downstream,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 获取当前统计快照
    pub fn get_stats(&self) -> TunnelStats {
        TunnelStats {
            name: self.name.clone(),
            listen_at: self.listen_at.clone(),
            connect_to: self.connect_to.clone(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts() {
        let tracker = TunnelStatsTracker::new(
            "web".to_string(),
            "127.0.0.1:8080".to_string(),
            "127.0.0.1:80".to_string(),
        );
        let shared = tracker.clone();

        tracker.connection_started();
        tracker.connection_started();
        shared.connection_ended();
        tracker.add_bytes(Direction::Upstream, 100);
        shared.add_bytes(Direction::Downstream, 40);

        let stats = tracker.get_stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.bytes_upstream, 100);
        assert_eq!(stats.bytes_downstream, 40);
        assert_eq!(stats.listen_at, "127.0.0.1:8080");
    }
}
