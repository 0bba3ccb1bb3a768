//! Node assembly
//!
//! Wires storage, ledger, idempotency guard, webhook engine and document
//! engine together and runs the background loops: dispatch worker, webhook
//! worker, reservation sweep and idempotency purge.

use crate::config::EngineConfig;
use crate::engine::DocumentEngine;
use crate::gateway::{HttpProviderGateway, ProviderGateway};
use crate::validator::{BasicValidator, PayloadValidator};
use crate::worker::DispatchWorker;
use crate::{Error, Result};
use chrono::Utc;
use idempotency::{IdempotencyConfig, IdempotencyGuard};
use ledger_core::{EventSink, Ledger, Storage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use webhook_engine::{HttpTransport, NotificationTransport, WebhookConfig, WebhookEngine};

/// Node configuration, one section per component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Ledger and storage
    pub ledger: ledger_core::Config,

    /// Idempotency guard
    pub idempotency: IdempotencyConfig,

    /// Webhook delivery
    pub webhooks: WebhookConfig,

    /// Documents and dispatch
    pub documents: EngineConfig,
}

impl NodeConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load every section from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            ledger: ledger_core::Config::from_env()?,
            idempotency: IdempotencyConfig::from_env()?,
            webhooks: WebhookConfig::from_env()?,
            documents: EngineConfig::from_env()?,
        })
    }
}

/// Running node
pub struct Node {
    ledger: Ledger,
    guard: IdempotencyGuard,
    webhooks: WebhookEngine,
    documents: DocumentEngine,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("ledger", &self.ledger)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Start a node talking HTTP to the provider and to webhook receivers
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let gateway = HttpProviderGateway::new(config.documents.gateway.clone())?;
        let transport = HttpTransport::new(Duration::from_secs(config.webhooks.request_timeout_secs))?;
        Self::start_with(config, Arc::new(gateway), Arc::new(transport), Arc::new(BasicValidator)).await
    }

    /// Start a node with explicit collaborators
    pub async fn start_with(
        config: NodeConfig,
        gateway: Arc<dyn ProviderGateway>,
        transport: Arc<dyn NotificationTransport>,
        validator: Arc<dyn PayloadValidator>,
    ) -> Result<Self> {
        let storage = Storage::open(&config.ledger)?;

        let webhooks = WebhookEngine::new(storage.clone(), transport, config.webhooks.clone());
        let sink: Arc<dyn EventSink> = Arc::new(webhooks.clone());

        let ledger = Ledger::with_storage(config.ledger.clone(), storage.clone(), sink.clone())?;
        let guard = IdempotencyGuard::new(storage, config.idempotency.clone());
        let documents = DocumentEngine::new(ledger.clone(), guard.clone(), validator, sink, config.documents.clone());
        let worker = DispatchWorker::new(documents.clone(), gateway);

        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn({
            let rx = rx.clone();
            async move { worker.run(rx).await }
        }));

        tasks.push(tokio::spawn({
            let webhooks = webhooks.clone();
            let rx = rx.clone();
            async move { webhooks.run(rx).await }
        }));

        tasks.push(tokio::spawn(sweep_reservations(
            ledger.clone(),
            Duration::from_secs(config.ledger.reservations.sweep_interval_secs.max(1)),
            rx.clone(),
        )));

        tasks.push(tokio::spawn(purge_idempotency(
            guard.clone(),
            Duration::from_secs(config.idempotency.purge_interval_secs.max(1)),
            rx,
        )));

        tracing::info!(
            service = %config.ledger.service_name,
            charging = ?config.documents.charging,
            "Node started"
        );

        Ok(Self {
            ledger,
            guard,
            webhooks,
            documents,
            shutdown,
            tasks,
        })
    }

    /// Document engine
    pub fn documents(&self) -> &DocumentEngine {
        &self.documents
    }

    /// Webhook engine
    pub fn webhooks(&self) -> &WebhookEngine {
        &self.webhooks
    }

    /// Ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Idempotency guard
    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// Stop the background loops, then the ledger writer
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Node shutting down");
        let _ = self.shutdown.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }

        self.ledger.shutdown().await?;
        tracing::info!("Node stopped");
        Ok(())
    }
}

async fn sweep_reservations(ledger: Ledger, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        match ledger.sweep_expired_reservations(Utc::now()).await {
            Ok(cancelled) if !cancelled.is_empty() => {
                tracing::info!(count = cancelled.len(), "Expired reservations cancelled")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Reservation sweep failed"),
        }
    }
}

async fn purge_idempotency(guard: IdempotencyGuard, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        match guard.purge_expired(Utc::now()) {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Idempotency records purged"),
            Err(e) => tracing::error!(error = %e, "Idempotency purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_sections_default() {
        let config: NodeConfig = toml::from_str(
            r#"
            [ledger]
            service_name = "reliability-node"
            default_unit = "TRY"

            [documents]
            charging = "pooled"
            "#,
        )
        .unwrap();

        assert_eq!(config.ledger.service_name, "reliability-node");
        assert_eq!(config.ledger.default_unit, "TRY");
        assert_eq!(config.ledger.mailbox_capacity, 1000);
        assert_eq!(config.documents.charging, crate::config::ChargingModel::Pooled);
        assert_eq!(config.webhooks.max_concurrency, 16);
        assert_eq!(config.idempotency.retention_secs, 86_400);
    }

    #[test]
    fn test_webhook_setup_errors_surface_as_webhook() {
        let err: Error = webhook_engine::Error::Config("bad timeout".into()).into();
        assert!(matches!(err, Error::Webhook(_)));
        assert!(err.to_string().contains("bad timeout"));
    }
}
