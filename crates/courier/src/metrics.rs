//! Windowed processing metrics.
//!
//! Every completed message appends a [`MetricEvent`] to the queue of its
//! event type. The per-second rate is the number of events inside the
//! trailing window divided by the window length. A background sweep owned by
//! the recorder trims events that fell out of the window, so the queues stay
//! bounded even when nobody reads the rate.
//!
//! Each event type is exported through OpenTelemetry as:
//!
//! - `<namespace>.<event_type>_processing_time`: histogram, milliseconds
//! - `<namespace>.<event_type>_per_second`: observable gauge
//! - `<namespace>.<event_type>_failed`: counter
//!
//! Time is read from tokio's clock so a paused runtime drives the window.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Histogram, Meter, ObservableGauge};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// One completed unit of work.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub event_type: Arc<str>,
    pub occurred_at: Instant,
    pub duration: Duration,
}

type Samples = Arc<Mutex<VecDeque<MetricEvent>>>;

struct Series {
    name: Arc<str>,
    samples: Samples,
    processing_time: Histogram<f64>,
    failed: Counter<u64>,
    _per_second: ObservableGauge<f64>,
}

struct RecorderInner {
    meter: Meter,
    namespace: String,
    window: Duration,
    series: DashMap<String, Arc<Series>>,
    sweeper: Mutex<Option<Sweeper>>,
}

struct Sweeper {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Thread-safe windowed recorder. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MetricsRecorder {
    inner: Arc<RecorderInner>,
}

impl MetricsRecorder {
    pub fn new(meter: Meter, namespace: impl Into<String>, window: Duration) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                meter,
                namespace: namespace.into(),
                window,
                series: DashMap::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Record one completed event and its processing time.
    pub fn record(&self, event_type: &str, duration: Duration) {
        let series = self.series(event_type);
        series
            .processing_time
            .record(duration.as_secs_f64() * 1000.0, &[]);
        series.samples.lock().push_back(MetricEvent {
            event_type: series.name.clone(),
            occurred_at: Instant::now(),
            duration,
        });
    }

    pub fn record_failure(&self, event_type: &str) {
        self.series(event_type).failed.add(1, &[]);
    }

    /// Events per second over the trailing window.
    pub fn rate(&self, event_type: &str) -> f64 {
        self.count(event_type) as f64 / self.inner.window.as_secs_f64()
    }

    /// Number of events inside the trailing window.
    pub fn count(&self, event_type: &str) -> usize {
        self.inner
            .series
            .get(event_type)
            .map(|series| count_within(&series.samples.lock(), Instant::now(), self.inner.window))
            .unwrap_or(0)
    }

    /// Event types seen so far, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .series
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    /// Drop events older than the window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_series(&self.inner, Instant::now())
    }

    /// Start the background sweep. Calling it again while running is a no-op.
    pub fn start(&self, interval: Duration) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            Arc::downgrade(&self.inner),
            interval,
            shutdown.clone(),
        ));

        info!(
            namespace = %self.inner.namespace,
            window_secs = self.inner.window.as_secs(),
            interval_ms = interval.as_millis() as u64,
            "Metrics sweep started"
        );
        *sweeper = Some(Sweeper { shutdown, handle });
    }

    /// Stop the background sweep and wait for it to exit.
    pub async fn shutdown(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        let Some(sweeper) = sweeper else {
            return;
        };

        sweeper.shutdown.cancel();
        if let Err(e) = sweeper.handle.await {
            warn!(error = %e, "Metrics sweep task failed");
        }
    }

    fn series(&self, event_type: &str) -> Arc<Series> {
        if let Some(series) = self.inner.series.get(event_type) {
            return series.clone();
        }

        self.inner
            .series
            .entry(event_type.to_string())
            .or_insert_with(|| Arc::new(self.create_series(event_type)))
            .clone()
    }

    fn create_series(&self, event_type: &str) -> Series {
        let prefix = format!("{}.{}", self.inner.namespace, event_type);
        let samples: Samples = Arc::default();
        let window = self.inner.window;

        let processing_time = self
            .inner
            .meter
            .f64_histogram(format!("{prefix}_processing_time"))
            .with_unit("ms")
            .with_description("Time spent processing a message")
            .build();

        let failed = self
            .inner
            .meter
            .u64_counter(format!("{prefix}_failed"))
            .with_description("Messages that exhausted their processing attempts")
            .build();

        let observed = samples.clone();
        let per_second = self
            .inner
            .meter
            .f64_observable_gauge(format!("{prefix}_per_second"))
            .with_description("Messages processed per second over the trailing window")
            .with_callback(move |observer| {
                let count = count_within(&observed.lock(), Instant::now(), window);
                observer.observe(count as f64 / window.as_secs_f64(), &[]);
            })
            .build();

        debug!(event_type, "Registered metric series");

        Series {
            name: Arc::from(event_type),
            samples,
            processing_time,
            failed,
            _per_second: per_second,
        }
    }
}

fn count_within(samples: &VecDeque<MetricEvent>, now: Instant, window: Duration) -> usize {
    match now.checked_sub(window) {
        // Events are appended in time order, so counting stops at the first
        // one outside the window.
        Some(cutoff) => samples
            .iter()
            .rev()
            .take_while(|event| event.occurred_at >= cutoff)
            .count(),
        None => samples.len(),
    }
}

fn sweep_series(inner: &RecorderInner, now: Instant) -> usize {
    let Some(cutoff) = now.checked_sub(inner.window) else {
        return 0;
    };

    let mut removed = 0;
    for entry in inner.series.iter() {
        let mut samples = entry.value().samples.lock();
        while samples.front().is_some_and(|event| event.occurred_at < cutoff) {
            samples.pop_front();
            removed += 1;
        }
    }
    removed
}

async fn run_sweeper(inner: Weak<RecorderInner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Metrics sweep shutting down");
                break;
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let removed = sweep_series(&inner, Instant::now());
                if removed > 0 {
                    debug!(removed, "Swept expired metric events");
                }
            }
        }
    }
}
