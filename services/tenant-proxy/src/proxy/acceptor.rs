//! Listening socket ownership.
//!
//! [`ConnectionAcceptor`] binds the proxy port and hands out accepted client
//! connections. Stopping it closes the listening socket and wakes any pending
//! `accept()` with [`Accepted::Stopped`], so the accept loop never has to
//! poll a flag.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ProxyError, Result};

/// Outcome of [`ConnectionAcceptor::accept`].
#[derive(Debug)]
pub enum Accepted {
    /// A client connected.
    Connection {
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    /// The acceptor has been stopped. Not an error.
    Stopped,
}

/// Cloneable handle that stops a [`ConnectionAcceptor`] from another task.
#[derive(Debug, Clone)]
pub struct AcceptorStopper {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl AcceptorStopper {
    /// Request the acceptor to stop. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Owns the listening socket.
pub struct ConnectionAcceptor {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl ConnectionAcceptor {
    /// Bind and listen on `bind_addr`.
    pub async fn start(bind_addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: bind_addr,
            source,
        })?;

        info!(bind_addr = %local_addr, "Listener bound");

        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            listener: Some(listener),
            local_addr,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping this acceptor from another task.
    pub fn stopper(&self) -> AcceptorStopper {
        AcceptorStopper {
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }

    /// True once the listening socket has been closed.
    pub fn is_stopped(&self) -> bool {
        self.listener.is_none()
    }

    /// Wait for the next client or for a stop request.
    ///
    /// Errors are accept failures on a live socket; the caller decides
    /// whether to keep going.
    pub async fn accept(&mut self) -> io::Result<Accepted> {
        if *self.stop_rx.borrow() {
            self.close();
        }

        let accepted = {
            let Some(listener) = self.listener.as_ref() else {
                return Ok(Accepted::Stopped);
            };

            tokio::select! {
                biased;
                _ = self.stop_rx.wait_for(|stopped| *stopped) => None,
                result = listener.accept() => Some(result?),
            }
        };

        match accepted {
            Some((stream, peer_addr)) => Ok(Accepted::Connection { stream, peer_addr }),
            None => {
                self.close();
                Ok(Accepted::Stopped)
            }
        }
    }

    /// Close the listening socket. Idempotent.
    pub fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        self.close();
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!(bind_addr = %self.local_addr, "Listening socket closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_reports_bound_addr() {
        let acceptor = ConnectionAcceptor::start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        assert!(!acceptor.is_stopped());
    }

    #[tokio::test]
    async fn test_start_port_in_use() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = blocker.local_addr().unwrap();

        let result = ConnectionAcceptor::start(addr).await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_accept_connection() {
        let mut acceptor = ConnectionAcceptor::start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = acceptor.local_addr();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), acceptor.accept());
        let client = client.unwrap();

        match accepted.unwrap() {
            Accepted::Connection { peer_addr, .. } => {
                assert_eq!(peer_addr, client.local_addr().unwrap())
            }
            Accepted::Stopped => panic!("expected a connection"),
        }
    }

    #[tokio::test]
    async fn test_stopper_unblocks_pending_accept() {
        let mut acceptor = ConnectionAcceptor::start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let stopper = acceptor.stopper();

        let pending = tokio::spawn(async move {
            let result = acceptor.accept().await.unwrap();
            (result, acceptor)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.stop();

        let (result, acceptor) = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Accepted::Stopped));
        assert!(acceptor.is_stopped());

        // The listening socket is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut acceptor = ConnectionAcceptor::start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        acceptor.stop();
        acceptor.stop();
        acceptor.stopper().stop();

        assert!(matches!(acceptor.accept().await.unwrap(), Accepted::Stopped));
        assert!(matches!(acceptor.accept().await.unwrap(), Accepted::Stopped));
    }
}
