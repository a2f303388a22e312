//! Outbox relay: delivers one service's outbox rows to the events exchange.
//!
//! The relay owns a Postgres pool, a [`ResilientPublisher`] on RabbitMQ and an
//! [`OutboxWorker`] bound to `SERVICE_NAME`. It runs until told to stop.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use hireflow_infra::broker::AmqpConnector;
use hireflow_infra::config::{ConfigError, DeliveryConfig};
use hireflow_infra::outbox::{OutboxStore, OutboxWorker, PostgresOutboxStore};
use hireflow_infra::publisher::ResilientPublisher;

/// Failed rows reported at startup.
const FAILED_ROWS_REPORTED: usize = 20;

/// Everything the relay reads from the environment.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub database_url: String,
    pub delivery: DeliveryConfig,
}

impl RelaySettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        Ok(Self {
            database_url,
            delivery: DeliveryConfig::from_lookup(lookup)?,
        })
    }
}

/// Connect, start delivering and run until `shutdown` resolves.
pub async fn run(settings: RelaySettings, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let pool = PgPool::connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresOutboxStore::new(pool));
    store
        .ensure_schema()
        .await
        .context("failed to prepare the outbox table")?;

    let service = settings.delivery.service_name.clone();
    report_failed_rows(store.as_ref(), &service).await;

    let publisher = ResilientPublisher::new(
        AmqpConnector::new(settings.delivery.rabbitmq_url.clone()),
        settings.delivery.publisher.clone(),
    );
    if let Err(err) = publisher.ensure_connection().await {
        // The publisher keeps retrying on its own; rows wait in the outbox meanwhile.
        warn!(error = %err, "broker not reachable at startup");
    }

    let worker = OutboxWorker::new(
        store,
        Arc::new(publisher.clone()),
        settings.delivery.outbox_worker.clone(),
    );
    worker.start();
    info!(source_service = %service, exchange = publisher.exchange(), "outbox relay running");

    shutdown.await;

    info!("outbox relay shutting down");
    worker.shutdown().await;
    publisher
        .close()
        .await
        .context("failed to close the broker connection")?;
    Ok(())
}

async fn report_failed_rows<S: OutboxStore>(store: &S, service: &str) {
    match store.list_failed(service, FAILED_ROWS_REPORTED).await {
        Ok(rows) if rows.is_empty() => {}
        Ok(rows) => {
            for row in &rows {
                warn!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    attempts = row.attempts,
                    error = row.error.as_deref().unwrap_or(""),
                    "outbox row parked as failed"
                );
            }
            warn!(count = rows.len(), source_service = service, "failed outbox rows need attention");
        }
        Err(err) => warn!(error = %err, "could not list failed outbox rows"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn database_url_is_required() {
        let err = RelaySettings::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));

        let err = RelaySettings::from_lookup(lookup(&[("DATABASE_URL", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn delivery_settings_come_from_the_same_source() {
        let settings = RelaySettings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/hireflow"),
            ("SERVICE_NAME", "applications"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(settings.database_url, "postgres://localhost/hireflow");
        assert_eq!(settings.delivery.outbox_worker.source_service, "applications");
        assert_eq!(
            settings.delivery.outbox_worker.poll_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn invalid_delivery_settings_are_rejected() {
        let err = RelaySettings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/hireflow"),
            ("OUTBOX_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. }));
    }
}
