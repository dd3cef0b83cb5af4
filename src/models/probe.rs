use serde::Serialize;

/// Why a probe failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    /// The proxy did not accept a TCP connection
    TcpFailed,
    /// The health endpoint answered through the proxy with a status >= 400
    HttpError,
    /// The HTTP round-trip did not finish in time
    Timeout,
    /// Any other failure talking through the proxy
    ProxyError,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::TcpFailed => "tcp_failed",
            ProbeErrorKind::HttpError => "http_error",
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::ProxyError => "proxy_error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tcp_failed" => Some(ProbeErrorKind::TcpFailed),
            "http_error" => Some(ProbeErrorKind::HttpError),
            "timeout" => Some(ProbeErrorKind::Timeout),
            "proxy_error" => Some(ProbeErrorKind::ProxyError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ProbeVerdict {
    Healthy {
        http_status: u16,
    },
    Failed {
        kind: ProbeErrorKind,
        http_status: Option<u16>,
    },
}

/// Result of probing one proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub verdict: ProbeVerdict,
    /// End-to-end HTTP stage latency
    pub latency_ms: Option<u64>,
    /// TCP connect latency, diagnostics only
    pub tcp_latency_ms: Option<u64>,
}

impl ProbeResult {
    pub fn healthy(http_status: u16, latency_ms: u64) -> Self {
        ProbeResult {
            verdict: ProbeVerdict::Healthy { http_status },
            latency_ms: Some(latency_ms),
            tcp_latency_ms: None,
        }
    }

    pub fn failed(kind: ProbeErrorKind) -> Self {
        ProbeResult {
            verdict: ProbeVerdict::Failed {
                kind,
                http_status: None,
            },
            latency_ms: None,
            tcp_latency_ms: None,
        }
    }

    pub fn http_error(http_status: u16, latency_ms: u64) -> Self {
        ProbeResult {
            verdict: ProbeVerdict::Failed {
                kind: ProbeErrorKind::HttpError,
                http_status: Some(http_status),
            },
            latency_ms: Some(latency_ms),
            tcp_latency_ms: None,
        }
    }

    pub fn with_tcp_latency(mut self, tcp_latency_ms: u64) -> Self {
        self.tcp_latency_ms = Some(tcp_latency_ms);
        self
    }

    pub fn ok(&self) -> bool {
        matches!(self.verdict, ProbeVerdict::Healthy { .. })
    }

    pub fn http_status(&self) -> Option<u16> {
        match self.verdict {
            ProbeVerdict::Healthy { http_status } => Some(http_status),
            ProbeVerdict::Failed { http_status, .. } => http_status,
        }
    }

    pub fn error_kind(&self) -> Option<ProbeErrorKind> {
        match self.verdict {
            ProbeVerdict::Healthy { .. } => None,
            ProbeVerdict::Failed { kind, .. } => Some(kind),
        }
    }
}
