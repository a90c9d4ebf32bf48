//! HTTP status probe
//!
//! URL probes go through `reqwest` so both `http://` and `https://` targets
//! work. Local port checks only need the status line and speak plain HTTP
//! over a `TcpStream`.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProbeError;

/// Default timeout for one probe (connect, request and status line)
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP status prober
#[derive(Debug, Clone)]
pub struct HttpProbe {
    timeout: Duration,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Set probe timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// GET `url` (http or https) and return the response status code
    ///
    /// Redirects are followed; the status of the final response is returned.
    pub async fn status(&self, url: &str) -> Result<u16, ProbeError> {
        let parsed = url::Url::parse(url).map_err(|e| ProbeError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProbeError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let address = match (parsed.host_str(), parsed.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            _ => {
                return Err(ProbeError::InvalidUrl {
                    url: url.to_string(),
                    reason: "no host".to_string(),
                })
            }
        };

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent("kubelab")
            .build()
            .map_err(|e| ProbeError::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        let response = client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout {
                    address: address.clone(),
                }
            } else {
                ProbeError::ConnectionFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        debug!(address = %address, url = %url, status = status, "HTTP probe answered");
        Ok(status)
    }

    /// GET `path` on a local port and return the response status code
    pub async fn local_status(&self, port: u16, path: &str) -> Result<u16, ProbeError> {
        self.status_at("127.0.0.1", port, path).await
    }

    async fn status_at(&self, host: &str, port: u16, path: &str) -> Result<u16, ProbeError> {
        let address = format!("{}:{}", host, port);

        let status = tokio::time::timeout(self.timeout, request_status(host, &address, path))
            .await
            .map_err(|_| ProbeError::Timeout {
                address: address.clone(),
            })??;

        debug!(address = %address, path = %path, status = status, "HTTP probe answered");
        Ok(status)
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

async fn request_status(host: &str, address: &str, path: &str) -> Result<u16, ProbeError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| ProbeError::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nUser-Agent: kubelab\r\n\r\n",
        path, host
    );

    let (read_half, mut write_half) = tokio::io::split(stream);

    write_half
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProbeError::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let mut reader = BufReader::new(read_half);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| ProbeError::InvalidResponse {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    parse_status_line(&status_line).ok_or_else(|| ProbeError::InvalidResponse {
        address: address.to_string(),
        reason: if status_line.is_empty() {
            "connection closed before a response".to_string()
        } else {
            format!("bad status line: {}", status_line.trim())
        },
    })
}

/// Extract the code from `HTTP/1.1 200 OK`
fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
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

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_line("HTTP/1.0 302 Found"), Some(302));
        assert_eq!(parse_status_line("SSH-2.0-OpenSSH"), None);
        assert_eq!(parse_status_line(""), None);
    }

    #[tokio::test]
    async fn test_local_status() {
        let port = serve_once("HTTP/1.1 301 Moved Permanently\r\nLocation: /ui\r\n\r\n").await;
        let status = HttpProbe::new().local_status(port, "/").await.unwrap();
        assert_eq!(status, 301);
    }

    #[tokio::test]
    async fn test_status_from_url() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable\r\n\r\n").await;
        let status = HttpProbe::new()
            .status(&format!("http://127.0.0.1:{}/health", port))
            .await
            .unwrap();
        assert_eq!(status, 503);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpProbe::new().local_status(port, "/").await.unwrap_err();
        assert!(matches!(err, ProbeError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_scheme() {
        let err = HttpProbe::new()
            .status("ftp://example.com/health")
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_https_url_is_attempted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpProbe::new()
            .status(&format!("https://127.0.0.1:{}/health", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ConnectionFailed { .. }), "{:?}", err);
    }
}
