//! Wires the broker, consumers, producer and metrics into one running service.

use std::sync::Arc;
use std::time::Duration;

use courier::{ConsumerBuilder, ConsumerHandle, MessageHandler, MetricsRecorder, Producer};
use courier_broker::MemoryBroker;
use courier_core::MessageId;
use opentelemetry::global;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::weather::{WeatherCreated, WeatherDeleted, WeatherDeletion, WeatherForecast};

pub struct Service {
    settings: Settings,
    broker: MemoryBroker,
    producer: Producer,
    metrics: MetricsRecorder,
    consumers: Vec<ConsumerHandle>,
    reporter: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Service {
    /// Subscribe one consumer per weather topic and start background tasks.
    pub fn start(settings: Settings, broker: MemoryBroker) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();

        let metrics = MetricsRecorder::new(
            global::meter("courier-server"),
            settings.metrics.namespace.clone(),
            settings.metrics.window(),
        );
        metrics.start(settings.metrics.sweep_interval());

        let producer =
            Producer::new(Arc::new(broker.clone())).with_tracer(global::tracer("courier-server"));

        let consumers = vec![
            spawn_consumer(
                &settings,
                &broker,
                &producer,
                &metrics,
                &shutdown,
                &settings.demo.create_topic,
                WeatherCreated,
            )?,
            spawn_consumer(
                &settings,
                &broker,
                &producer,
                &metrics,
                &shutdown,
                &settings.demo.delete_topic,
                WeatherDeleted,
            )?,
        ];

        let reporter = spawn_reporter(
            metrics.clone(),
            settings.demo.report_interval(),
            shutdown.clone(),
        );

        info!(
            create_topic = %settings.demo.create_topic,
            delete_topic = %settings.demo.delete_topic,
            subscription = %settings.consumer.subscription,
            "Service started"
        );

        Ok(Self {
            settings,
            broker,
            producer,
            metrics,
            consumers,
            reporter,
            shutdown,
        })
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Publish sample forecasts, then delete the first one.
    pub async fn publish_demo(&self) -> anyhow::Result<Vec<MessageId>> {
        let demo = &self.settings.demo;
        let mut published = Vec::with_capacity(demo.publish_count as usize + 1);
        let mut first = None;

        for index in 0..demo.publish_count {
            let forecast = WeatherForecast::sample(index);
            if first.is_none() {
                first = forecast.id;
            }
            published.push(
                self.producer
                    .publish_json(&demo.create_topic, &forecast, None)
                    .await?,
            );
        }

        if let Some(id) = first {
            published.push(
                self.producer
                    .publish_json(&demo.delete_topic, &WeatherDeletion { id }, None)
                    .await?,
            );
        }

        info!(count = published.len(), "Published demo forecasts");
        Ok(published)
    }

    /// Stop consumers, the rate reporter and the metrics sweep.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.cancel();

        for consumer in self.consumers {
            if let Err(e) = consumer.shutdown().await {
                warn!(error = %e, "Consumer did not shut down cleanly");
            }
        }
        self.reporter.await?;
        self.metrics.shutdown().await;

        info!("Service stopped");
        Ok(())
    }
}

fn spawn_consumer(
    settings: &Settings,
    broker: &MemoryBroker,
    producer: &Producer,
    metrics: &MetricsRecorder,
    shutdown: &CancellationToken,
    topic: &str,
    handler: impl MessageHandler + 'static,
) -> anyhow::Result<ConsumerHandle> {
    let subscription = broker.subscribe(settings.consumer.subscription_options(topic))?;

    let consumer = ConsumerBuilder::new(settings.consumer.consumer_settings(topic))
        .consumer(subscription)
        .handler(handler)
        .producer(producer.clone())
        .metrics(metrics.clone())
        .shutdown_token(shutdown.child_token())
        .build()?;

    Ok(consumer.spawn())
}

fn spawn_reporter(
    metrics: MetricsRecorder,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for event_type in metrics.event_types() {
                        info!(
                            event_type = %event_type,
                            per_second = metrics.rate(&event_type),
                            count = metrics.count(&event_type),
                            "Processing rate"
                        );
                    }
                }
            }
        }
    })
}
