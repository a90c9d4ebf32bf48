//! Forwarder verification
//!
//! A bound port proves nothing: `kubectl port-forward` binds before the
//! tunnel to the pod works. Only an HTTP answer with an accepted status
//! counts.

use std::time::Duration;

use async_trait::async_trait;
use kubelab_kube::{HttpProbe, ProbeError};
use kubelab_proto::ACCEPTED_STATUS_CODES;

/// Connectivity check for a local port
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, port: u16) -> Result<(), ProbeError>;
}

/// GET `/` on the loopback port and accept 200, 301 or 302
#[derive(Debug, Clone, Default)]
pub struct HttpVerifier {
    probe: HttpProbe,
}

impl HttpVerifier {
    pub fn new(probe: HttpProbe) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, port: u16) -> Result<(), ProbeError> {
        let status = self.probe.local_status(port, "/").await?;
        if ACCEPTED_STATUS_CODES.contains(&status) {
            Ok(())
        } else {
            Err(ProbeError::UnexpectedStatus {
                address: format!("127.0.0.1:{}", port),
                status,
            })
        }
    }
}

/// Timing of post-launch verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    /// Wait after launch before the first attempt
    pub settle: Duration,
    /// Attempts for the first mapping of a request
    pub primary_attempts: u32,
    /// Attempts for every other mapping
    pub secondary_attempts: u32,
    /// Fixed delay between attempts
    pub attempt_interval: Duration,
}

impl VerifyPolicy {
    pub fn attempts(&self, primary: bool) -> u32 {
        let attempts = if primary {
            self.primary_attempts
        } else {
            self.secondary_attempts
        };
        attempts.max(1)
    }
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            primary_attempts: 5,
            secondary_attempts: 3,
            attempt_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(response.as_bytes()).await;
        });
        port
    }

    #[tokio::test]
    async fn test_redirect_is_accepted() {
        let port = serve_once("HTTP/1.1 302 Found\r\nLocation: /login\r\n\r\n").await;
        assert!(HttpVerifier::default().verify(port).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_found_is_rejected() {
        let port = serve_once("HTTP/1.1 404 Not Found\r\n\r\n").await;
        let err = HttpVerifier::default().verify(port).await.unwrap_err();
        assert!(matches!(err, ProbeError::UnexpectedStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_bound_but_silent_port_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        assert!(HttpVerifier::default().verify(port).await.is_err());
    }

    #[test]
    fn test_attempts() {
        let policy = VerifyPolicy::default();
        assert_eq!(policy.attempts(true), 5);
        assert_eq!(policy.attempts(false), 3);

        let policy = VerifyPolicy {
            secondary_attempts: 0,
            ..policy
        };
        assert_eq!(policy.attempts(false), 1);
    }
}
