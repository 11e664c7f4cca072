use super::control::TunnelState;
use super::TunnelPhase;
use crate::observer::TunnelEvent;
use crate::transport::{ListenerFactory, TunnelListener};
use std::sync::Arc;
use std::time::Duration;

/// 监听套接字监督者
///
/// 持有监听套接字，accept 失败后丢弃它，等待固定间隔后重新监听，
/// 直到收到关闭信号。
pub(super) struct Supervisor {
    pub(super) listen_at: String,
    pub(super) retry_interval: Duration,
    pub(super) listener_factory: Arc<dyn ListenerFactory>,
    pub(super) state: TunnelState,
}

impl Supervisor {
    pub(super) async fn run(mut self, listener: Box<dyn TunnelListener>) {
        self.serve(listener).await;
        self.state.set_phase(TunnelPhase::Stopped);
    }

    async fn serve(&mut self, listener: Box<dyn TunnelListener>) {
        let mut listener = Some(listener);

        loop {
            if let Some(active) = listener.take() {
                if let Ok(addr) = active.local_addr() {
                    self.state.set_phase(TunnelPhase::Listening(addr));
                }

                // 控制循环返回时监听套接字已被释放
                if self.state.run(active).await.is_ok() {
                    return;
                }
            }

            if !self.state.wait_for_retry(self.retry_interval).await {
                return;
            }

            match self.listener_factory.bind(&self.listen_at).await {
                Ok(relisten) => match relisten.local_addr() {
                    Ok(addr) => {
                        self.state.emit(TunnelEvent::ListenStarted { addr });
                        listener = Some(relisten);
                    }
                    Err(e) => self.state.emit(TunnelEvent::ListenFailed {
                        error: e.to_string(),
                    }),
                },
                Err(e) => self.state.emit(TunnelEvent::ListenFailed {
                    error: e.to_string(),
                }),
            }
        }
    }
}
