use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::com::{AsError, AsResult};

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Opens the byte stream a pipeline or a liveness check talks over.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str, deadline: Duration) -> AsResult<(BoxRead, BoxWrite)>;
}

/// Plain TCP with `TCP_NODELAY` and keepalive.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    keepalive: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, deadline: Duration) -> AsResult<(BoxRead, BoxWrite)> {
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| AsError::Dial {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|err| AsError::Dial {
                addr: addr.to_string(),
                reason: err.to_string(),
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(backend = %addr, error = %err, "failed to set TCP_NODELAY");
        }
        let keepalive = TcpKeepalive::new()
            .with_time(self.keepalive)
            .with_interval(self.keepalive);
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!(backend = %addr, error = %err, "failed to enable backend TCP keepalive");
        }
        let (read, write) = stream.into_split();
        Ok((Box::new(read), Box::new(write)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_refused_maps_to_dial_error() {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return,
            Err(err) => panic!("bind failed: {err}"),
        };
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpDialer::new().dial(&addr, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(AsError::Dial { .. })));
    }

    #[tokio::test]
    async fn dial_returns_split_halves() {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return,
            Err(err) => panic!("bind failed: {err}"),
        };
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (mut read, mut write) = TcpDialer::new()
            .dial(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
