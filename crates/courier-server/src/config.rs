use std::time::Duration;

use config::{Config, ConfigError, Environment};
use courier::ConsumerSettings;
use courier_broker::{InitialPosition, SubscriptionMode, SubscriptionOptions};
use courier_core::{Backoff, ResiliencePolicy};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub telemetry: TelemetrySettings,
    pub metrics: MetricsSettings,
    pub consumer: ConsumerConfig,
    pub demo: DemoSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    #[default]
    Stdout,
    Otlp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    /// Install OpenTelemetry providers; when false only `tracing` logs are emitted
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// `deployment.environment` resource attribute
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub exporter: ExporterKind,
    /// gRPC endpoint used when `exporter = "otlp"`
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

/// Windowed metrics recorder settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    /// Prefix of every exported instrument, e.g. `<namespace>.weather_created_per_second`
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
    /// Trailing window for per-second rates
    #[serde(default = "default_metrics_window_secs")]
    pub window_secs: u64,
    /// How often expired samples are evicted
    #[serde(default = "default_metrics_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Settings shared by every consumer the service runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_subscription")]
    pub subscription: String,
    #[serde(default)]
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub initial_position: InitialPosition,
    /// Unacknowledged messages a consumer may hold
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Policy around `receive()` and `acknowledge()`
    #[serde(default = "default_receive_policy")]
    pub receive: ResiliencePolicy,
    /// Policy around the message handler
    #[serde(default = "default_process_policy")]
    pub process: ResiliencePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemoSettings {
    #[serde(default = "default_create_topic")]
    pub create_topic: String,
    #[serde(default = "default_delete_topic")]
    pub delete_topic: String,
    /// Forecasts published at startup
    #[serde(default = "default_publish_count")]
    pub publish_count: u32,
    /// How often processing rates are logged
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            // Built-in defaults to avoid missing-section errors
            .set_default("telemetry.enabled", default_telemetry_enabled())?
            .set_default("telemetry.service_name", default_service_name())?
            .set_default("telemetry.environment", default_environment())?
            .set_default("telemetry.log_level", default_log_level())?
            .set_default("telemetry.log_format", default_log_format())?
            .set_default("telemetry.exporter", "stdout")?
            .set_default("metrics.namespace", default_metrics_namespace())?
            .set_default("metrics.window_secs", default_metrics_window_secs() as i64)?
            .set_default(
                "metrics.sweep_interval_secs",
                default_metrics_sweep_interval_secs() as i64,
            )?
            .set_default("consumer.subscription", default_subscription())?
            .set_default("consumer.mode", "shared")?
            .set_default("consumer.initial_position", "earliest")?
            .set_default("consumer.prefetch", default_prefetch() as i64)?
            .set_default("demo.create_topic", default_create_topic())?
            .set_default("demo.delete_topic", default_delete_topic())?
            .set_default("demo.publish_count", default_publish_count() as i64)?
            .set_default(
                "demo.report_interval_secs",
                default_report_interval_secs() as i64,
            )?
            // Single canonical source: COURIER_* (flat, single underscore)
            .add_source(Environment::with_prefix("COURIER").separator("_"));

        // Standard OpenTelemetry variables take precedence
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            builder = builder
                .set_override("telemetry.otlp_endpoint", endpoint)?
                .set_override("telemetry.exporter", "otlp")?;
        }
        if let Ok(service_name) = std::env::var("OTEL_SERVICE_NAME") {
            builder = builder.set_override("telemetry.service_name", service_name)?;
        }

        builder.build()?.try_deserialize()
    }
}

impl MetricsSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ConsumerConfig {
    pub fn subscription_options(&self, topic: &str) -> SubscriptionOptions {
        SubscriptionOptions::new(topic, self.subscription.clone())
            .mode(self.mode)
            .initial_position(self.initial_position)
            .prefetch(self.prefetch)
    }

    pub fn consumer_settings(&self, topic: &str) -> ConsumerSettings {
        ConsumerSettings {
            topic: topic.to_string(),
            subscription: self.subscription.clone(),
            receive_policy: self.receive.clone(),
            process_policy: self.process.clone(),
        }
    }
}

impl DemoSettings {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            service_name: default_service_name(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            exporter: ExporterKind::default(),
            otlp_endpoint: None,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            namespace: default_metrics_namespace(),
            window_secs: default_metrics_window_secs(),
            sweep_interval_secs: default_metrics_sweep_interval_secs(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            subscription: default_subscription(),
            mode: SubscriptionMode::default(),
            initial_position: InitialPosition::default(),
            prefetch: default_prefetch(),
            receive: default_receive_policy(),
            process: default_process_policy(),
        }
    }
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            create_topic: default_create_topic(),
            delete_topic: default_delete_topic(),
            publish_count: default_publish_count(),
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telemetry: TelemetrySettings::default(),
            metrics: MetricsSettings::default(),
            consumer: ConsumerConfig::default(),
            demo: DemoSettings::default(),
        }
    }
}

fn default_telemetry_enabled() -> bool {
    true
}

fn default_service_name() -> String {
    "courier-server".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_namespace() -> String {
    "courier".to_string()
}

fn default_metrics_window_secs() -> u64 {
    60
}

fn default_metrics_sweep_interval_secs() -> u64 {
    5
}

fn default_subscription() -> String {
    "courier-server".to_string()
}

fn default_prefetch() -> usize {
    100
}

fn default_receive_policy() -> ResiliencePolicy {
    ResiliencePolicy::new(5, Duration::from_millis(500), Backoff::Exponential)
        .with_max_delay(Duration::from_secs(10))
}

fn default_process_policy() -> ResiliencePolicy {
    // Shallow on purpose: poison messages go to the DLQ quickly
    ResiliencePolicy::new(3, Duration::from_millis(500), Backoff::Linear)
}

fn default_create_topic() -> String {
    "weather-create".to_string()
}

fn default_delete_topic() -> String {
    "weather-delete".to_string()
}

fn default_publish_count() -> u32 {
    5
}

fn default_report_interval_secs() -> u64 {
    10
}
