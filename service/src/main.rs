//! Census RM case processor.
//!
//! Consumes every inbound event topic, applies each message to the case
//! database in one transaction, and relays the resulting outbound events.
//!
//! Startup order:
//! 1. Configuration (`.env`, then the environment) and tracing
//! 2. Prometheus exporter
//! 3. `PostgreSQL` pool and migrations
//! 4. Broker, HTTP collaborators, UAC/QID cache, case reference generator
//! 5. One worker pool per event family, the delay relay and the outbox relay
//!
//! Ctrl+C or SIGTERM broadcasts shutdown; workers finish their current
//! message and exit.

mod clients;
mod config;

use census_rm_core::bus::MessageBus;
use census_rm_core::case_ref::CaseRefGenerator;
use census_rm_core::envelope::EventFamily;
use census_rm_core::environment::{Clock, SystemClock};
use census_rm_postgres::PostgresCaseStore;
use census_rm_redpanda::RedpandaMessageBus;
use census_rm_runtime::metrics::MetricsServer;
use census_rm_runtime::{
    CaseEventHandler, CaseProcessor, DelayRelay, EventConsumer, OutboxRelay, ResiliencePipeline,
    RetryPolicy, UacQidCache,
};
use clients::{HttpAddressIndex, HttpExceptionManager, HttpUacQidGenerator, http_client};
use config::Config;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is normal outside development.
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "census_rm_case_processor=info,census_rm_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting census RM case processor");
    let config = Config::from_env();

    let mut metrics = MetricsServer::new(config.metrics_addr()?);
    metrics.start()?;

    let store = PostgresCaseStore::connect(&config.postgres.url, config.postgres.max_connections).await?;
    store.migrate().await?;
    info!("Database migrations applied");

    let bus: Arc<dyn MessageBus> = Arc::new(
        RedpandaMessageBus::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .producer_acks(&config.redpanda.producer_acks)
            .retain_backoff(config.redpanda.retain_backoff)
            .build()?,
    );

    let http = http_client(config.collaborators.timeout)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let uac_cache = Arc::new(UacQidCache::new(
        Arc::new(HttpUacQidGenerator::new(
            http.clone(),
            &config.collaborators.uac_service_url,
        )),
        config.uac_cache_config(),
    ));
    let processor = Arc::new(CaseProcessor::new(
        Arc::new(store.clone()),
        uac_cache,
        Arc::new(CaseRefGenerator::new(config.case_ref.secret.as_bytes())?),
        Arc::new(HttpAddressIndex::new(
            http.clone(),
            &config.collaborators.address_index_url,
            RetryPolicy::default(),
        )),
        Arc::clone(&clock),
    ));
    let resilience = Arc::new(ResiliencePipeline::new(
        Arc::new(HttpExceptionManager::new(
            http,
            &config.collaborators.exception_manager_url,
        )),
        Arc::clone(&bus),
        Arc::clone(&clock),
        config.resilience_config(),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut workers = Vec::new();

    for family in EventFamily::ALL {
        let topic = config.topics.topic(family);
        let consumer = EventConsumer::builder()
            .name(family.name())
            .topics(vec![topic.clone()])
            .bus(Arc::clone(&bus))
            .handler(Arc::new(CaseEventHandler::new(
                family,
                Arc::clone(&processor),
                Arc::clone(&resilience),
            )))
            .shutdown(shutdown_tx.subscribe())
            .build()?;
        workers.extend(consumer.spawn_workers(config.topics.concurrency));
        info!(family = family.name(), topic = %topic, workers = config.topics.concurrency, "Consumer started");
    }

    let delay_relay = EventConsumer::builder()
        .name("delay-relay")
        .topics(vec![config.topics.delay.clone()])
        .bus(Arc::clone(&bus))
        .handler(Arc::new(DelayRelay::new(
            Arc::clone(&bus),
            Arc::clone(&clock),
            config.topics.quarantine.clone(),
            config.resilience.max_delay_wait,
        )))
        .shutdown(shutdown_tx.subscribe())
        .build()?;
    workers.push(delay_relay.spawn());

    workers.push(
        OutboxRelay::new(Arc::new(store), Arc::clone(&bus), config.outbox_config())
            .spawn(shutdown_tx.subscribe()),
    );
    info!("Case processor running");

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    let drained = tokio::time::timeout(config.server.shutdown_timeout, async {
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Shutdown timeout elapsed with workers still running");
    }

    info!("Case processor stopped");
    Ok(())
}

/// Graceful shutdown signal handler.
///
/// Waits for:
/// - Ctrl+C (SIGINT)
/// - SIGTERM (in production environments)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
