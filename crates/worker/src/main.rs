//! Herald worker binary entrypoint.

use std::sync::Arc;

use herald_broker::{AmqpBroker, Broker, RetryCoordinator, RetryMode, TopologyManager};
use herald_common::config::WorkerConfig;
use herald_common::db;
use herald_common::store::{PgRecordStore, apply_channel_rows, load_channel_rows};
use herald_common::telemetry::{FluentdSink, LogSink, NoopSink, init_tracing};
use herald_notifier::ChannelRegistry;

use herald_worker::consumer::{Consumer, Counters, MessageHandler};
use herald_worker::health::{self, HealthState};
use herald_worker::processor::DeliveryProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("Herald worker starting...");

    // Load configuration
    let mut config = WorkerConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    // Channel rows in the database override environment settings
    match load_channel_rows(&pool).await {
        Ok(rows) => apply_channel_rows(&mut config.channels, rows)?,
        Err(e) => tracing::warn!(error = %e, "Could not load channel settings, using environment only"),
    }

    let registry = ChannelRegistry::from_config(&config.channels, reqwest::Client::new())?;

    let sink: Arc<dyn LogSink> = match &config.fluentd_http_url {
        Some(url) => {
            tracing::info!(url = %url, "Forwarding delivery events to Fluentd");
            Arc::new(FluentdSink::new(
                url.clone(),
                config.service_name.clone(),
                config.service_env.clone(),
            ))
        }
        None => Arc::new(NoopSink),
    };

    // Connect to the broker
    let amqp = Arc::new(AmqpBroker::connect(&config.amqp_url, &config.service_name).await?);
    let broker: Arc<dyn Broker> = amqp.clone();

    let mode = if config.declare_infra {
        TopologyManager::new(config.topology.clone(), config.retry.clone())
            .declare(broker.as_ref())
            .await?;
        RetryMode::Ladder
    } else {
        tracing::info!("Topology declaration disabled, retrying in process");
        RetryMode::InProcess
    };

    let processor = DeliveryProcessor::new(
        registry,
        Arc::new(PgRecordStore::new(pool)),
        config.default_channel,
        config.send_timeout,
    )
    .with_sink(sink);
    let coordinator = RetryCoordinator::new(config.topology.clone(), config.retry.clone(), mode);

    let counters = Arc::new(Counters::default());
    let handler = MessageHandler::new(
        broker.clone(),
        Arc::new(processor),
        Arc::new(coordinator),
        counters.clone(),
    );
    let consumer = Consumer::new(handler, config.topology.queue.clone(), config.prefetch);
    let health_state = HealthState::new(broker.clone(), counters, config.service_name.clone());

    tracing::info!(
        queue = %config.topology.queue,
        max_retries = config.retry.max_retries(),
        "Starting consumer"
    );

    // Run until Ctrl+C or a fatal broker error
    let result = tokio::select! {
        result = consumer.run() => {
            result.map_err(|e| {
                tracing::error!(error = %e, "Consumer exited with error");
                e
            })
        }
        result = health::serve(config.health_addr, health_state) => {
            result.map_err(|e| {
                tracing::error!(error = %e, "Health server exited with error");
                e
            })
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            Ok(())
        }
    };

    // No new deliveries are taken once `run` is dropped; let in-flight ones settle
    consumer.drain(config.shutdown_grace).await;

    if let Err(e) = amqp.close().await {
        tracing::warn!(error = %e, "Broker connection did not close cleanly");
    }

    tracing::info!("Herald worker stopped.");
    result.map_err(Into::into)
}
