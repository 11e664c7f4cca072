use super::{ListenerFactory, TunnelListener};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// 基于 tokio TcpListener 的监听套接字
pub struct TcpTunnelListener {
    listener: TcpListener,
}

impl TcpTunnelListener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl TunnelListener for TcpTunnelListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// 默认的监听工厂
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpListenerFactory;

#[async_trait]
impl ListenerFactory for TcpListenerFactory {
    async fn bind(&self, addr: &str) -> io::Result<Box<dyn TunnelListener>> {
        let listener = TcpTunnelListener::bind(addr).await?;
        Ok(Box::new(listener))
    }
}
