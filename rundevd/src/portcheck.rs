//! TCP readiness probe for the user process's port.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(40);

/// Abstraction over port probing so tests can substitute a fake.
#[async_trait]
pub trait PortChecker: Send + Sync {
    /// One connect attempt with a short timeout.
    async fn check_port(&self) -> bool;

    /// Polls until the port accepts a connection. Callers bound this with
    /// their own deadline; the loop itself never gives up.
    async fn wait_port(&self);
}

/// Probes `localhost:<port>` on a fixed tick.
pub struct TcpPortChecker {
    port: u16,
    retry_interval: Duration,
    dial_timeout: Duration,
}

impl TcpPortChecker {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl PortChecker for TcpPortChecker {
    async fn check_port(&self) -> bool {
        matches!(
            timeout(self.dial_timeout, TcpStream::connect(("localhost", self.port))).await,
            Ok(Ok(_))
        )
    }

    async fn wait_port(&self) {
        let mut tick = interval(self.retry_interval);
        loop {
            tick.tick().await;
            if self.check_port().await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn check_succeeds_on_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = TcpPortChecker::new(port);
        assert!(checker.check_port().await);
    }

    #[tokio::test]
    async fn wait_returns_once_port_opens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checker = TcpPortChecker::new(port);
        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            TcpListener::bind(("127.0.0.1", port)).await.unwrap()
        });

        timeout(Duration::from_secs(5), checker.wait_port())
            .await
            .expect("port never opened");
        let _listener = opener.await.unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener); // port is now closed

        let checker = TcpPortChecker::new(port);
        assert!(timeout(Duration::from_millis(200), checker.wait_port())
            .await
            .is_err());
    }
}
