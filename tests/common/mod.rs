//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bw_tunnel::transport::{ListenerFactory, TunnelListener};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break, // Connection closed
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Server that reads and discards everything, counting bytes per connection
pub struct CountingSink {
    pub addr: SocketAddr,
    counters: Arc<Mutex<Vec<Arc<AtomicU64>>>>,
}

impl CountingSink {
    pub async fn start() -> Self {
        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind sink server");
        let addr = listener.local_addr().expect("Failed to get sink addr");
        let counters: Arc<Mutex<Vec<Arc<AtomicU64>>>> = Arc::default();

        let registry = counters.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = Arc::new(AtomicU64::new(0));
                registry.lock().push(counter.clone());
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        counter.fetch_add(n as u64, Ordering::Relaxed);
                    }
                });
            }
        });

        Self { addr, counters }
    }

    /// Bytes received so far on each accepted connection
    pub fn counts(&self) -> Vec<u64> {
        self.counters
            .lock()
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.counts().iter().sum()
    }
}

/// Send data through the tunnel and read back the echo
pub async fn echo_through(
    port: u16,
    test_data: &[u8],
    timeout_duration: Duration,
) -> Result<Vec<u8>, String> {
    timeout(timeout_duration, async {
        let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .map_err(|e| format!("Failed to connect to tunnel: {}", e))?;
        echo_on(&mut stream, test_data).await
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// Write data to an open stream and read the same amount back
pub async fn echo_on(stream: &mut TcpStream, test_data: &[u8]) -> Result<Vec<u8>, String> {
    stream
        .write_all(test_data)
        .await
        .map_err(|e| format!("Failed to write data: {}", e))?;

    let mut response = vec![0u8; test_data.len()];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| format!("Failed to read response: {}", e))?;
    Ok(response)
}

/// Wait until something accepts connections on the port
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Listener factory whose listeners can be killed on demand
#[derive(Default)]
pub struct FlakyListenerFactory {
    kill: Arc<Notify>,
    binds: AtomicUsize,
}

impl FlakyListenerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the current listener fail its next accept
    pub fn kill_listener(&self) {
        self.kill.notify_one();
    }

    /// Number of successful binds so far
    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListenerFactory for FlakyListenerFactory {
    async fn bind(&self, addr: &str) -> io::Result<Box<dyn TunnelListener>> {
        let inner = TokioTcpListener::bind(addr).await?;
        self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FlakyListener {
            inner,
            kill: self.kill.clone(),
        }))
    }
}

struct FlakyListener {
    inner: TokioTcpListener,
    kill: Arc<Notify>,
}

#[async_trait]
impl TunnelListener for FlakyListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        tokio::select! {
            accepted = self.inner.accept() => accepted,
            _ = self.kill.notified() => Err(io::Error::other("listener killed")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
