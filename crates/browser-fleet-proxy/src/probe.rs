//! Connectivity probe used to validate proxy reachability.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Checks that a host:port accepts connections.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Returns the connect latency on success.
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> anyhow::Result<Duration>;
}

/// Plain TCP connect probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> anyhow::Result<Duration> {
        let started = Instant::now();
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {host}:{port} timed out after {timeout:?}"))?
            .with_context(|| format!("connect to {host}:{port}"))?;
        drop(stream);
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_probe_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let latency = TcpProbe
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(latency < Duration::from_secs(2));
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_fails_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpProbe
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("127.0.0.1"));
    }
}
