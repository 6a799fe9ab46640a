use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::core::{Error, Result, DEFAULT_READ_TIMEOUT_SECS};
use super::Transport;

/// Direct TCP transport, for telnet-style forwarding and testing
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Creates a transport targeting `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpTransport {
            host: host.into(),
            port,
            timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            stream: None,
        }
    }

    /// Overrides the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::transport("not connected"))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::transport(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::transport(format!("connect to {} failed: {}", addr, e)))?;
        info!(addr = %addr, "TCP connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream
            .write_all(data)
            .await
            .map_err(|e| Error::transport(format!("TCP write failed: {}", e)))?;
        debug!(len = data.len(), "TCP sent");
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        let mut buf = vec![0u8; max];
        let n = tokio::time::timeout(timeout, stream.read(&mut buf))
            .await
            .map_err(|_| Error::transport("TCP read timed out"))?
            .map_err(|e| Error::transport(format!("TCP read failed: {}", e)))?;
        buf.truncate(n);
        debug!(len = n, "TCP received");
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("TCP connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_read_write_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"[FBB-7.0-B$]\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let mut transport = TcpTransport::new("127.0.0.1", addr.port());
        transport.open().await.unwrap();
        let greeting = transport.read(64).await.unwrap();
        assert_eq!(&greeting[..], b"[FBB-7.0-B$]\r\n");
        transport.write(b"FQ\r\n").await.unwrap();
        let echoed = server.await.unwrap();
        assert_eq!(echoed, b"FQ\r\n");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_before_open_fails() {
        let mut transport = TcpTransport::new("127.0.0.1", 1);
        assert!(transport.read(16).await.is_err());
        assert!(transport.write(b"x").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            // Hold the socket open without sending anything
            tokio::time::sleep(Duration::from_secs(120)).await;
        });

        let mut transport =
            TcpTransport::new("127.0.0.1", addr.port()).with_timeout(Duration::from_secs(1));
        transport.open().await.unwrap();
        let err = transport.read(16).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
