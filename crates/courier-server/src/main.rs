use courier_broker::MemoryBroker;
use courier_server::telemetry::init_telemetry;
use courier_server::{Service, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new()?;
    let _telemetry = init_telemetry(&settings.telemetry)?;

    let service = Service::start(settings, MemoryBroker::new())?;
    service.publish_demo().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.shutdown().await
}
