//! Outbound HTTP transport

use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Transport for signed webhook posts.
///
/// Returns the HTTP status on any response; network failures and timeouts
/// are `Err`.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// POST `body` to `url` with the given headers
    async fn post(&self, url: &str, headers: &[(String, String)], body: &[u8]) -> Result<u16>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("webhook-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationTransport for HttpTransport {
    async fn post(&self, url: &str, headers: &[(String, String)], body: &[u8]) -> Result<u16> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Transport(format!("timeout posting to {}", url))
            } else {
                Error::from(e)
            }
        })?;

        Ok(response.status().as_u16())
    }
}
