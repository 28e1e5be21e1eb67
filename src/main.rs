//! Mi Scale Measurement Tool
//!
//! Connects to a BLE body composition scale, waits for a stabilized weight
//! reading and appends it to a JSON measurement store.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use futures::{FutureExt, StreamExt};
use log::{info, warn};
use miscale::api::storage::MeasurementStore;
use miscale::components::controller::SessionController;
use miscale::components::storage::JsonFileStore;
use miscale::core::config::AppConfig;
use miscale::core::constants::DATE_TIME_STRING_FORMAT;
use miscale::model::session::SessionState;
use std::process::ExitCode;
use time::format_description;

#[cfg(not(feature = "mock"))]
use miscale::components::bluetooth::BluetoothTransport;
#[cfg(feature = "mock")]
use btleplug::api::BDAddr;
#[cfg(feature = "mock")]
use miscale::components::simulated::{SimulatedScale, SimulatedTransport};

async fn list_measurements(store: &JsonFileStore, limit: usize) -> Result<()> {
    let format = format_description::parse(DATE_TIME_STRING_FORMAT)?;
    for record in store.recent(Some(limit)).await? {
        print!("{}  {}", record.recorded_at.format(&format)?, record.reading);
        if let Some(composition) = record.composition {
            print!(
                "  BMI {:.1}, BMR {:.0} kcal, body fat {:.1} %",
                composition.bmi, composition.bmr, composition.body_fat_percentage
            );
        }
        println!();
    }
    Ok(())
}

/// Main entry point of the application.
///
/// Initializes logging, runs a single measurement session and prints its
/// events. Ctrl-C cancels the session.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(
        Env::default()
            .filter_or("SCALE_LOG_LEVEL", "info")
            .write_style_or("SCALE_LOG_STYLE", "always"),
    )
    .init();

    let config = AppConfig::parse();
    let profile = config.profile()?;
    let store = JsonFileStore::open(&config.store)
        .await
        .with_context(|| format!("opening measurement store {}", config.store.display()))?;

    if let Some(limit) = config.list {
        list_measurements(&store, limit).await?;
        return Ok(ExitCode::SUCCESS);
    }

    #[cfg(feature = "mock")]
    let transport = {
        let address = match config.address.as_deref() {
            Some(address) => address.parse()?,
            None => BDAddr::from([0xD0, 0x3E, 0x7D, 0x76, 0xAF, 0xC6]),
        };
        SimulatedTransport::new(SimulatedScale::stepping_on(address, 72.4))
    };
    #[cfg(not(feature = "mock"))]
    let transport = BluetoothTransport::first_adapter().await?;

    let controller = SessionController::new(transport, store, profile);
    let mut events = controller.subscribe();
    let ticket = controller.start(config.address.as_deref(), config.session_config())?;
    info!("Step on the scale.");

    let mut finished = std::pin::pin!(ticket.finished());
    let snapshot = loop {
        tokio::select! {
            snapshot = &mut finished => break snapshot,
            Some(event) = events.next() => println!("{}", event),
            Ok(()) = tokio::signal::ctrl_c() => {
                if let Err(e) = controller.stop() {
                    warn!("{}", e);
                }
            }
        }
    };
    while let Some(Some(event)) = events.next().now_or_never() {
        println!("{}", event);
    }

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if snapshot.state == SessionState::Completed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
