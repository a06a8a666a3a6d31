//! Test harness for tenant proxy integration tests.
//!
//! Spawns loopback upstreams and a proxy server on ephemeral ports.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use tenant_proxy::{
    ProxyServer, ServerConfig, ServerStats, ShutdownReport, TenantDirectory, TenantRecord,
};

/// Loopback listener that runs `handle` for every accepted connection until
/// dropped.
struct UpstreamListener {
    addr: SocketAddr,
    connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl UpstreamListener {
    async fn spawn<F, Fut>(handle: F) -> io::Result<Self>
    where
        F: Fn(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&connections);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle(stream));
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for UpstreamListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Upstream that echoes every byte back until the peer closes.
#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub bytes_received: Arc<AtomicU64>,
    upstream: UpstreamListener,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let bytes_received = Arc::new(AtomicU64::new(0));
        let bytes = Arc::clone(&bytes_received);

        let upstream = UpstreamListener::spawn(move |mut stream| {
            let bytes = Arc::clone(&bytes);
            async move {
                let (mut reader, mut writer) = stream.split();
                if let Ok(n) = tokio::io::copy(&mut reader, &mut writer).await {
                    bytes.fetch_add(n, Ordering::Relaxed);
                }
            }
        })
        .await?;

        Ok(Self {
            addr: upstream.addr,
            bytes_received,
            upstream,
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.upstream.connections.load(Ordering::Relaxed)
    }
}

/// Upstream that reads each connection to EOF, records what it got and then
/// answers with a fixed reply.
#[allow(dead_code)]
pub struct CaptureBackend {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    upstream: UpstreamListener,
}

#[allow(dead_code)]
impl CaptureBackend {
    pub async fn spawn(reply: &'static [u8]) -> io::Result<Self> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&received);

        let upstream = UpstreamListener::spawn(move |mut stream| {
            let store = Arc::clone(&store);
            async move {
                let mut data = Vec::new();
                if stream.read_to_end(&mut data).await.is_err() {
                    return;
                }
                store.lock().unwrap().push(data);
                let _ = stream.write_all(reply).await;
            }
        })
        .await?;

        Ok(Self {
            addr: upstream.addr,
            received,
            upstream,
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.upstream.connections.load(Ordering::Relaxed)
    }

    /// Payloads received so far, one per finished connection.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until `count` connections have been fully received.
    pub async fn wait_for_payloads(&self, count: usize) -> Vec<Vec<u8>> {
        for _ in 0..200 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} upstream payloads");
    }
}

/// A port nothing listens on.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[allow(dead_code)]
pub fn tenant(id: &str, addr: SocketAddr) -> TenantRecord {
    TenantRecord::new(id, addr.ip().to_string(), addr.port())
}

/// A running proxy server on a loopback ephemeral port.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub server: Arc<ProxyServer>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(tenants: Vec<TenantRecord>) -> io::Result<Self> {
        Self::spawn_with(tenants, |_| {}).await
    }

    pub async fn spawn_with<F>(tenants: Vec<TenantRecord>, configure: F) -> io::Result<Self>
    where
        F: FnOnce(&mut ServerConfig),
    {
        let directory = TenantDirectory::new(tenants).map_err(io::Error::other)?;

        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        configure(&mut config);

        let server = Arc::new(ProxyServer::new(config, Arc::new(directory)));
        let listen_addr = server.start().await.map_err(io::Error::other)?;

        Ok(Self {
            listen_addr,
            server,
        })
    }

    pub fn stats(&self) -> &ServerStats {
        self.server.stats()
    }

    pub async fn stop(&self) -> ShutdownReport {
        self.server.stop().await.unwrap()
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.listen_addr).await.unwrap()
    }
}

/// Send `request`, half-close and read the full response.
#[allow(dead_code)]
pub async fn exchange(addr: SocketAddr, request: &[u8]) -> io::Result<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request).await?;
        stream.shutdown().await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(response)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "exchange timed out"))?
}
