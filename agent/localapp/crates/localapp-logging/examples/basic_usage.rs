//! Basic usage example for localapp logging

use localapp_config::Config;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::development();

    localapp_logging::init_logging(&config.logging, "example-service")?;

    info!("Service starting");
    info!(host = "example.org", pid = 4242, "helper already running");
    error!(host = "example.org", "helper failed to start");

    Ok(())
}
