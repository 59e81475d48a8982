pub mod config;
pub mod service;
pub mod telemetry;
pub mod weather;

pub use config::Settings;
pub use service::Service;
