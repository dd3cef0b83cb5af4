//! Health probing for pool members
//!
//! A probe is a TCP connect to the proxy followed by an HTTP GET through it to
//! a fixed target. Probes never touch the registry; they only produce results.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Result, WardenError};
use crate::models::{ProbeErrorKind, ProbeResult, Proxy};

/// Something that can test a proxy
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe a proxy. `Err` means the probe itself could not be carried out.
    async fn probe(&self, proxy: &Proxy) -> Result<ProbeResult>;
}

/// Prober configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub target_url: Url,
    pub tcp_timeout: Duration,
    pub http_timeout: Duration,
}

impl ProbeConfig {
    /// Upper bound for a single probe
    pub fn max_probe_duration(&self) -> Duration {
        self.tcp_timeout + self.http_timeout
    }
}

/// Two-stage TCP + HTTP prober
pub struct HttpProber {
    config: ProbeConfig,
}

impl HttpProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Open and drop a TCP connection to the proxy itself
    async fn connect_stage(&self, proxy: &Proxy) -> Result<u64> {
        let start = Instant::now();
        let addr = format!("{}:{}", proxy.host, proxy.port);

        match timeout(self.config.tcp_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(start.elapsed().as_millis() as u64),
            Ok(Err(e)) => Err(WardenError::TcpConnectFailure(format!("{}: {}", addr, e))),
            Err(_) => Err(WardenError::TcpConnectFailure(format!(
                "{}: connect timed out",
                addr
            ))),
        }
    }

    fn build_client(&self, proxy: &Proxy) -> Result<reqwest::Client> {
        let mut upstream = reqwest::Proxy::all(proxy.proxy_url())
            .map_err(|e| WardenError::ProxyProtocolError(e.to_string()))?;
        if let Some(creds) = &proxy.credentials {
            upstream = upstream.basic_auth(&creds.username, &creds.password);
        }

        reqwest::Client::builder()
            .proxy(upstream)
            .danger_accept_invalid_certs(true)
            .connect_timeout(self.config.tcp_timeout)
            .timeout(self.config.http_timeout)
            .build()
            .map_err(|e| WardenError::Internal(format!("failed to build probe client: {}", e)))
    }

    /// GET the target through the proxy, returning the response status
    async fn http_stage(&self, client: &reqwest::Client) -> Result<u16> {
        let response = client.get(self.config.target_url.clone()).send().await?;
        let status = response.status().as_u16();
        // drain so the whole round-trip is timed
        response.bytes().await?;
        Ok(status)
    }
}

/// Map the outcome of the HTTP stage to a result
pub fn classify(outcome: Result<u16>, latency_ms: u64) -> ProbeResult {
    match outcome {
        Ok(status) if status < 400 => ProbeResult::healthy(status, latency_ms),
        Ok(status) => ProbeResult::http_error(status, latency_ms),
        Err(WardenError::HttpTimeout) => ProbeResult::failed(ProbeErrorKind::Timeout),
        Err(WardenError::TcpConnectFailure(_)) => ProbeResult::failed(ProbeErrorKind::TcpFailed),
        Err(_) => ProbeResult::failed(ProbeErrorKind::ProxyError),
    }
}

#[async_trait]
impl Prober for HttpProber {
    #[instrument(skip(self, proxy), fields(key = %proxy.key))]
    async fn probe(&self, proxy: &Proxy) -> Result<ProbeResult> {
        let client = self.build_client(proxy)?;

        let tcp_latency = match self.connect_stage(proxy).await {
            Ok(latency) => latency,
            Err(e) => {
                debug!("TCP stage failed: {}", e);
                return Ok(classify(Err(e), 0));
            }
        };

        let start = Instant::now();
        let outcome = self.http_stage(&client).await;
        let latency = start.elapsed().as_millis() as u64;

        if let Err(ref e) = outcome {
            debug!("HTTP stage failed: {}", e);
        }

        Ok(classify(outcome, latency).with_tcp_latency(tcp_latency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyEntry;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn proxy_at(port: u16) -> Proxy {
        let entry = ProxyEntry::parse(&format!("127.0.0.1:{}", port)).unwrap();
        Proxy::new(entry, 50, Utc::now())
    }

    fn prober() -> HttpProber {
        HttpProber::new(ProbeConfig {
            target_url: Url::parse("http://probe-target.test/ip").unwrap(),
            tcp_timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(2),
        })
    }

    /// Minimal forward proxy answering every request with `status`
    async fn fake_proxy(status: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {} Test\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}",
                        status
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        port
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Ok(200), 10), ProbeResult::healthy(200, 10));
        assert_eq!(classify(Ok(399), 10), ProbeResult::healthy(399, 10));
        assert_eq!(classify(Ok(400), 10), ProbeResult::http_error(400, 10));
        assert_eq!(
            classify(Err(WardenError::HttpTimeout), 10).error_kind(),
            Some(ProbeErrorKind::Timeout)
        );
        assert_eq!(
            classify(Err(WardenError::TcpConnectFailure("x".into())), 0).error_kind(),
            Some(ProbeErrorKind::TcpFailed)
        );
        assert_eq!(
            classify(Err(WardenError::ProxyProtocolError("reset".into())), 10).error_kind(),
            Some(ProbeErrorKind::ProxyError)
        );
        assert_eq!(
            classify(Err(WardenError::HttpTimeout), 10).latency_ms,
            None
        );
    }

    #[tokio::test]
    async fn test_closed_port_is_tcp_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = prober().probe(&proxy_at(port)).await.unwrap();
        assert_eq!(result.error_kind(), Some(ProbeErrorKind::TcpFailed));
        assert!(result.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_healthy_proxy() {
        let port = fake_proxy(200).await;

        let result = prober().probe(&proxy_at(port)).await.unwrap();
        assert!(result.ok(), "unexpected result {:?}", result);
        assert_eq!(result.http_status(), Some(200));
        assert!(result.latency_ms.is_some());
        assert!(result.tcp_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_error_status_is_http_error() {
        let port = fake_proxy(403).await;

        let result = prober().probe(&proxy_at(port)).await.unwrap();
        assert_eq!(result.error_kind(), Some(ProbeErrorKind::HttpError));
        assert_eq!(result.http_status(), Some(403));
    }
}
