use crate::config::{AppConfig, Settings, TunnelConfig};
use crate::error::Result;
use crate::observer::{TracingObserver, TunnelObserver};
use crate::stats::TunnelStats;
use crate::tunnel::Tunnel;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 运行中的隧道及其配置
struct ManagedTunnel {
    config: TunnelConfig,
    tunnel: Tunnel,
}

/// 配置重新加载的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    /// 仅更新了限速的隧道
    pub updated: Vec<String>,
    /// 地址变化而重启的隧道
    pub restarted: Vec<String>,
    /// 新增的隧道
    pub added: Vec<String>,
    /// 已移除的隧道
    pub removed: Vec<String>,
    /// 启动失败的隧道
    pub failed: Vec<String>,
}

/// 隧道管理器
///
/// 按配置启动所有隧道，支持热重载和统一关闭。
pub struct TunnelManager {
    settings: Settings,
    tunnels: HashMap<String, ManagedTunnel>,
    observer: Arc<dyn TunnelObserver>,
}

impl TunnelManager {
    /// 启动配置中的所有隧道
    ///
    /// 任意隧道首次监听失败都会关闭已启动的隧道并返回错误。
    pub async fn start(config: &AppConfig) -> Result<Self> {
        Self::start_with_observer(config, Arc::new(TracingObserver)).await
    }

    pub async fn start_with_observer(
        config: &AppConfig,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<Self> {
        let mut manager = Self {
            settings: config.settings.clone(),
            tunnels: HashMap::new(),
            observer,
        };

        for tunnel_config in &config.tunnels {
            match manager.start_tunnel(tunnel_config).await {
                Ok(tunnel) => {
                    manager.tunnels.insert(
                        tunnel_config.name.clone(),
                        ManagedTunnel {
                            config: tunnel_config.clone(),
                            tunnel,
                        },
                    );
                }
                Err(e) => {
                    error!("Failed to start tunnel '{}': {}", tunnel_config.name, e);
                    manager.shutdown_all().await;
                    return Err(e);
                }
            }
        }

        info!("Started {} tunnel(s)", manager.tunnels.len());
        Ok(manager)
    }

    async fn start_tunnel(&self, config: &TunnelConfig) -> Result<Tunnel> {
        config
            .builder(&self.settings)
            .observer(self.observer.clone())
            .start()
            .await
    }

    /// 应用新的配置
    ///
    /// 地址不变的隧道只更新限速，已有连接不受影响；地址变化的隧道先关闭再重启。
    /// 新隧道启动失败只记录日志，不影响其它隧道。
    pub async fn reload(&mut self, config: &AppConfig) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        // 重试间隔和连接超时只对之后启动的隧道生效
        self.settings = config.settings.clone();

        let wanted: HashMap<&str, &TunnelConfig> = config
            .tunnels
            .iter()
            .map(|t| (t.name.as_str(), t))
            .collect();

        let removed: Vec<String> = self
            .tunnels
            .keys()
            .filter(|name| !wanted.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(managed) = self.tunnels.remove(&name) {
                info!("Removing tunnel '{}'", name);
                managed.tunnel.shutdown().await;
                summary.removed.push(name);
            }
        }

        // 先关闭地址变化的隧道，释放旧端口后再启动
        let mut to_start = Vec::new();
        for tunnel_config in &config.tunnels {
            match self.tunnels.remove(&tunnel_config.name) {
                Some(managed) if managed.config.same_endpoints(tunnel_config) => {
                    if managed.config.limits() != tunnel_config.limits() {
                        if let Err(e) = managed.tunnel.update_limits(tunnel_config.limits()).await
                        {
                            warn!(
                                "Failed to update limits of tunnel '{}': {}",
                                tunnel_config.name, e
                            );
                        } else {
                            summary.updated.push(tunnel_config.name.clone());
                        }
                    }
                    self.tunnels.insert(
                        tunnel_config.name.clone(),
                        ManagedTunnel {
                            config: tunnel_config.clone(),
                            tunnel: managed.tunnel,
                        },
                    );
                }
                Some(managed) => {
                    info!(
                        "Restarting tunnel '{}': {} -> {}",
                        tunnel_config.name, tunnel_config.listen_at, tunnel_config.connect_to
                    );
                    managed.tunnel.shutdown().await;
                    to_start.push((tunnel_config, true));
                }
                None => to_start.push((tunnel_config, false)),
            }
        }

        for (tunnel_config, restarted) in to_start {
            match self.start_tunnel(tunnel_config).await {
                Ok(tunnel) => {
                    self.tunnels.insert(
                        tunnel_config.name.clone(),
                        ManagedTunnel {
                            config: tunnel_config.clone(),
                            tunnel,
                        },
                    );
                    if restarted {
                        summary.restarted.push(tunnel_config.name.clone());
                    } else {
                        summary.added.push(tunnel_config.name.clone());
                    }
                }
                Err(e) => {
                    error!("Failed to start tunnel '{}': {}", tunnel_config.name, e);
                    summary.failed.push(tunnel_config.name.clone());
                }
            }
        }

        info!(
            "Configuration reloaded: {} updated, {} restarted, {} added, {} removed, {} failed",
            summary.updated.len(),
            summary.restarted.len(),
            summary.added.len(),
            summary.removed.len(),
            summary.failed.len()
        );
        summary
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tunnel> {
        self.tunnels.get(name).map(|managed| &managed.tunnel)
    }

    /// 所有隧道的统计快照，按名称排序
    pub fn stats(&self) -> Vec<TunnelStats> {
        let mut stats: Vec<TunnelStats> = self
            .tunnels
            .values()
            .map(|managed| managed.tunnel.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// 关闭所有隧道并等待它们结束
    pub async fn shutdown_all(&mut self) {
        for (name, managed) in self.tunnels.drain() {
            info!("Shutting down tunnel '{}'", name);
            managed.tunnel.shutdown().await;
        }
    }
}
