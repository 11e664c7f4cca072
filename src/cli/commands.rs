use anyhow::Result;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::manager::TunnelManager;

use super::config::{check_config, expand_path};
use super::template;

/// 执行 CLI 命令
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run_tunnels(config).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
    }

    Ok(())
}

/// 运行所有配置的隧道，直到收到 Ctrl+C
async fn run_tunnels(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    info!("Loading configuration from: {}", config_path);
    let app_config = AppConfig::load(&config_path)?;

    let mut manager = TunnelManager::start(&app_config).await?;
    let mut reload = ReloadSignal::new()?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
            _ = reload.recv() => {
                info!("Reloading configuration from: {}", config_path);
                match AppConfig::load(&config_path) {
                    Ok(new_config) => {
                        manager.reload(&new_config).await;
                    }
                    Err(e) => warn!("Keeping current configuration, reload failed: {:#}", e),
                }
            }
        }
    }

    for stats in manager.stats() {
        info!(
            "Tunnel '{}': {} connections, {} bytes up, {} bytes down",
            stats.name, stats.total_connections, stats.bytes_upstream, stats.bytes_downstream
        );
    }
    manager.shutdown_all().await;
    info!("All tunnels stopped");

    Ok(())
}

/// SIGHUP 触发配置重载
#[cfg(unix)]
struct ReloadSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self(signal(SignalKind::hangup())?))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

/// 非 Unix 平台不支持重载
#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}
