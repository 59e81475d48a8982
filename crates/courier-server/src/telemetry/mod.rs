//! Telemetry bootstrap for the Courier service.
//!
//! Sets up `tracing` logging plus, when enabled, OpenTelemetry trace and
//! metric providers exporting to stdout or OTLP. Trace context travels in
//! message properties (`trace-id`/`trace-state`), so the message propagator
//! is installed as the global text-map propagator.

mod init;

pub use init::{TelemetryGuard, init_telemetry};
