use serde::{Deserialize, Serialize};

use super::{Proxy, ProxyFilter, ProxyStatus};

/// Constraints for acquiring a proxy on behalf of an account
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcquireRequest {
    pub account_id: String,
    pub min_score: Option<u8>,
    pub country: Option<String>,
}

impl AcquireRequest {
    pub fn for_account(account_id: impl Into<String>) -> Self {
        AcquireRequest {
            account_id: account_id.into(),
            ..AcquireRequest::default()
        }
    }

    /// Filter a candidate must satisfy to be handed out
    pub fn filter(&self) -> ProxyFilter {
        ProxyFilter {
            status: Some(ProxyStatus::Available),
            min_score: self.min_score,
            country: self.country.clone(),
        }
    }
}

/// What a consuming workflow receives for its own client configuration
#[derive(Debug, Clone, Serialize)]
pub struct ProxyHandle {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub url: String,
    pub score: u8,
    pub country_hint: Option<String>,
}

impl From<&Proxy> for ProxyHandle {
    fn from(proxy: &Proxy) -> Self {
        ProxyHandle {
            key: proxy.key.clone(),
            host: proxy.host.clone(),
            port: proxy.port,
            username: proxy.credentials.as_ref().map(|c| c.username.clone()),
            password: proxy.credentials.as_ref().map(|c| c.password.clone()),
            url: proxy.url_with_credentials(),
            score: proxy.score,
            country_hint: proxy.country_hint.clone(),
        }
    }
}
