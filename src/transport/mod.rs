mod tcp;

pub use tcp::{TcpListenerFactory, TcpTunnelListener};

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// 监听套接字抽象
///
/// accept 返回错误即表示该监听套接字已不可用，监督者会丢弃它并重新监听
#[async_trait]
pub trait TunnelListener: Send + Sync {
    /// 接受新的入站连接
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    /// 获取实际绑定的地址
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// 监听套接字工厂，初次监听和重新监听都经过这里
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    /// 在指定地址上监听
    async fn bind(&self, addr: &str) -> io::Result<Box<dyn TunnelListener>>;
}
