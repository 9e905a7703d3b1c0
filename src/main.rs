//! Dice Scale Server
//!
//! Brings up the weight sensor, then serves game clients over WebSocket
//! until Ctrl-C. The sensor is released on the way out.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "linux")]
use dice_scale::sensor::gpio;
use dice_scale::{
    sensor::{CalibrationStore, SensorDriver, SimulatedBus},
    ScaleServer, ServerConfig, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env();
    info!("Dice Scale Server v{}", VERSION);
    info!("Calibration file: {}", config.calibration_file.display());

    let sensor = Arc::new(open_sensor(&config)?);
    let server = ScaleServer::new(config, sensor.clone());

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown.send(());
    });

    let result = server.run().await;
    sensor.cleanup_logged().await;
    result.context("server stopped with an error")?;

    info!("Goodbye");
    Ok(())
}

fn open_sensor(config: &ServerConfig) -> anyhow::Result<SensorDriver> {
    let store = config.calibration_store();

    if config.simulate {
        info!("Using simulated load cell");
        return SensorDriver::new(SimulatedBus::default(), store, config.sensor.clone())
            .context("failed to start simulated sensor");
    }

    open_hx711(config, store)
}

#[cfg(target_os = "linux")]
fn open_hx711(config: &ServerConfig, store: CalibrationStore) -> anyhow::Result<SensorDriver> {
    info!(
        "Using HX711 on {} line {} (data) / {} (clock)",
        config.gpio_chip.display(),
        config.data_pin,
        config.clock_pin
    );
    let bus = gpio::open_hx711(&config.gpio_chip, config.data_pin, config.clock_pin).with_context(|| {
        format!(
            "failed to open {} lines {}/{}",
            config.gpio_chip.display(),
            config.data_pin,
            config.clock_pin
        )
    })?;
    SensorDriver::new(bus, store, config.sensor.clone()).context("failed to start HX711")
}

#[cfg(not(target_os = "linux"))]
fn open_hx711(_config: &ServerConfig, _store: CalibrationStore) -> anyhow::Result<SensorDriver> {
    anyhow::bail!("GPIO access needs Linux; set DICE_SCALE_SIMULATE=1 to use the software load cell")
}
