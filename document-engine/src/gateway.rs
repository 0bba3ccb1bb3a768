//! Provider gateway interface

use crate::config::GatewayConfig;
use crate::types::{DispatchOutcome, Document};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Provider gateway trait.
///
/// Implementations never fail: every problem is classified into the
/// outcome so the worker can decide between retrying and dead-lettering.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Submit a document to the provider
    async fn submit(&self, document: &Document) -> DispatchOutcome;

    /// Get gateway name
    fn name(&self) -> &str;
}

/// Map a provider HTTP status to an outcome class.
///
/// 408, 429 and 5xx are transient; every other non-2xx is a rejection.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

/// HTTP status class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Success,
    /// Retry later
    Transient,
    /// Do not retry
    Permanent,
}

/// Generic JSON-over-HTTP gateway.
///
/// POSTs `{base_url}/documents/{kind}` and reads the provider ID from the
/// `provider_ref` (or `id`) field of the response body. The document ID is
/// sent as `Idempotency-Key` so a retried submission is not filed twice.
#[derive(Debug, Clone)]
pub struct HttpProviderGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpProviderGateway {
    /// Create gateway
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("document-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, document: &Document) -> String {
        format!(
            "{}/documents/{}",
            self.config.base_url.trim_end_matches('/'),
            document.kind.as_str()
        )
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn submit(&self, document: &Document) -> DispatchOutcome {
        let payload: serde_json::Value = match serde_json::from_str(&document.payload) {
            Ok(payload) => payload,
            Err(e) => return DispatchOutcome::Permanent(format!("stored payload is not JSON: {}", e)),
        };
        let body = serde_json::json!({
            "document_id": document.document_id,
            "tenant_id": document.tenant_id,
            "kind": document.kind,
            "external_reference": document.external_reference,
            "payload": payload,
        });

        let mut request = self
            .client
            .post(self.endpoint(document))
            .header("Idempotency-Key", document.document_id.to_string())
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return DispatchOutcome::Transient("provider timeout".to_string()),
            Err(e) => return DispatchOutcome::Transient(format!("provider unreachable: {}", e)),
        };

        let status = response.status().as_u16();
        match classify_status(status) {
            StatusClass::Success => {
                let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
                match body
                    .get("provider_ref")
                    .or_else(|| body.get("id"))
                    .and_then(|v| v.as_str())
                {
                    Some(provider_ref) => DispatchOutcome::Accepted {
                        provider_ref: provider_ref.to_string(),
                    },
                    None => DispatchOutcome::Transient(format!(
                        "provider answered {} without a reference",
                        status
                    )),
                }
            }
            StatusClass::Transient => {
                DispatchOutcome::Transient(format!("provider answered {}", status))
            }
            StatusClass::Permanent => {
                let detail = response.text().await.unwrap_or_default();
                DispatchOutcome::Permanent(format!("provider rejected with {}: {}", status, detail))
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(202), StatusClass::Success);
        assert_eq!(classify_status(408), StatusClass::Transient);
        assert_eq!(classify_status(429), StatusClass::Transient);
        assert_eq!(classify_status(503), StatusClass::Transient);
        assert_eq!(classify_status(400), StatusClass::Permanent);
        assert_eq!(classify_status(422), StatusClass::Permanent);
        assert_eq!(classify_status(301), StatusClass::Permanent);
    }

    #[test]
    fn test_endpoint_per_kind() {
        let gateway = HttpProviderGateway::new(GatewayConfig {
            base_url: "https://provider.test/".to_string(),
            ..GatewayConfig::default()
        })
        .unwrap();

        let now = chrono::Utc::now();
        let document = Document {
            document_id: uuid::Uuid::now_v7(),
            tenant_id: ledger_core::TenantId::new(),
            kind: crate::types::DocumentKind::Despatch,
            status: crate::types::DocumentStatus::Processing,
            provider_ref: None,
            external_reference: None,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            payload: "{}".to_string(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(gateway.endpoint(&document), "https://provider.test/documents/despatch");
    }
}
