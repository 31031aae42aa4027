use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::trace;

/// Decides whether a backend accepts connections
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, host: &str, port: u16) -> bool;
}

/// Readiness as "a TCP connect succeeds within the timeout"
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_ready(&self, host: &str, port: u16) -> bool {
        match timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!("Probe of {}:{} refused: {}", host, port, e);
                false
            }
            Err(_) => {
                trace!("Probe of {}:{} timed out after {:?}", host, port, self.timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe() {
        let probe = TcpProbe::new(Duration::from_millis(500));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe.is_ready("127.0.0.1", port).await);

        drop(listener);
        assert!(!probe.is_ready("127.0.0.1", port).await);
    }
}
