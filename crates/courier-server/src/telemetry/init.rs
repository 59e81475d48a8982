use courier_core::MessagePropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{ExporterKind, TelemetrySettings};

const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// Guard that ensures proper shutdown of OpenTelemetry providers.
/// Drop this guard to flush and shutdown all telemetry.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown meter provider: {:?}", e);
        }
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown tracer provider: {:?}", e);
        }
    }
}

/// Initialize logging and, when enabled, OpenTelemetry.
///
/// Returns a guard that should be kept alive for the duration of the program.
pub fn init_telemetry(settings: &TelemetrySettings) -> anyhow::Result<TelemetryGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.log_format.as_str() {
        "json" => fmt::layer().json().boxed(),
        _ => fmt::layer().boxed(),
    };

    if !settings.enabled {
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .try_init()?;

        tracing::info!(
            otel.enabled = false,
            "Telemetry initialized (tracing only, OpenTelemetry exporters disabled)"
        );

        return Ok(TelemetryGuard {
            tracer_provider: None,
            meter_provider: None,
        });
    }

    global::set_text_map_propagator(MessagePropagator::new());

    let resource = Resource::builder()
        .with_service_name(settings.service_name.clone())
        .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new(
            DEPLOYMENT_ENVIRONMENT,
            settings.environment.clone(),
        ))
        .build();

    let (tracer_provider, meter_provider) = match settings.exporter {
        ExporterKind::Stdout => stdout_providers(resource),
        ExporterKind::Otlp => otlp_providers(resource, settings.otlp_endpoint.as_deref())?,
    };

    let tracer = tracer_provider.tracer("courier-server");
    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter)
        .try_init()?;

    tracing::info!(
        service.name = %settings.service_name,
        otel.enabled = true,
        exporter = ?settings.exporter,
        "Telemetry initialized with OpenTelemetry exporters"
    );

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
        meter_provider: Some(meter_provider),
    })
}

fn stdout_providers(resource: Resource) -> (SdkTracerProvider, SdkMeterProvider) {
    let trace_exporter = opentelemetry_stdout::SpanExporter::default();
    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_simple_exporter(trace_exporter)
        .build();

    let metrics_exporter = opentelemetry_stdout::MetricExporter::default();
    let reader = PeriodicReader::builder(metrics_exporter).build();
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    (tracer_provider, meter_provider)
}

fn otlp_providers(
    resource: Resource,
    endpoint: Option<&str>,
) -> anyhow::Result<(SdkTracerProvider, SdkMeterProvider)> {
    let mut span_exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic();
    let mut metric_exporter = opentelemetry_otlp::MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint);
        metric_exporter = metric_exporter.with_endpoint(endpoint);
    }

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter.build()?)
        .build();

    let reader = PeriodicReader::builder(metric_exporter.build()?).build();
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    Ok((tracer_provider, meter_provider))
}
