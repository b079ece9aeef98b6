use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, Level};

use gatt_adaptor_lib::commands;
use gatt_adaptor_lib::config::catalog::load_catalog;
use gatt_adaptor_lib::config::{AdaptorConfig, CONFIG_FILE_NAME};
use gatt_adaptor_lib::core::bluetooth::{
    format_mac, parse_uuid, CapabilityCatalog, CharacteristicProperties, DataSink, Notification, ServiceRequirements,
};
use gatt_adaptor_lib::logging::EventLogger;
use gatt_adaptor_lib::state::AppState;

#[derive(Parser)]
#[command(name = "gatt-adaptor", version, about = "Scan for BLE peripherals and talk GATT to them")]
struct Cli {
    /// Adaptor config file
    #[arg(long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Where the catalog for a connection comes from
#[derive(clap::Args)]
struct Target {
    /// Peripheral address, e.g. AA:BB:CC:DD:EE:FF
    address: String,

    /// Service owning the characteristic
    #[arg(long)]
    service: Option<String>,

    /// Characteristic UUID, full or 16-bit short form
    characteristic: String,

    /// Capability catalog file; by default only the target characteristic is validated
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan and list nearby peripherals
    Scan {
        /// Only report devices advertising this service
        #[arg(long)]
        service: Option<String>,
        /// Only report devices with this manufacturer id
        #[arg(long, default_value_t = 0)]
        manufacturer: u16,
    },
    /// Read a characteristic once
    Read {
        #[command(flatten)]
        target: Target,
    },
    /// Write a hex payload to a characteristic
    Write {
        #[command(flatten)]
        target: Target,
        /// Payload as hex, e.g. 01ff
        payload: String,
    },
    /// Print notifications until interrupted
    Notify {
        #[command(flatten)]
        target: Target,
    },
}

impl Target {
    async fn catalog(&self, required: CharacteristicProperties) -> Result<CapabilityCatalog> {
        if let Some(path) = &self.catalog {
            return load_catalog(path).await;
        }
        let service = self
            .service
            .as_deref()
            .ok_or_else(|| anyhow!("Either --service or --catalog is required"))?;
        let service = parse_uuid(service)?;
        let characteristic = parse_uuid(&self.characteristic)?;
        Ok(CapabilityCatalog::new()
            .with_service(ServiceRequirements::new(service).with_characteristic(characteristic, required)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::Debug } else { Level::Info };

    if EventLogger::init(level).is_err() {
        // Only fall back to env_logger when the event logger could not be installed
        env_logger::builder()
            .filter_level(level.to_level_filter())
            .init();
    }

    let config = AdaptorConfig::load_config(&cli.config).await?;
    let app_state = AppState::with_system_adapter(config).await?;

    match cli.command {
        Command::Scan { service, manufacturer } => {
            let devices = commands::scan_devices(&app_state, service.as_deref(), manufacturer).await?;
            for device in devices {
                println!(
                    "{}  {:>4} dBm  {}",
                    format_mac(&device.identity.mac(), true),
                    device.rssi,
                    if device.name.is_empty() { "(unnamed)" } else { &device.name }
                );
            }
        }
        Command::Read { target } => {
            let catalog = target.catalog(CharacteristicProperties::READ).await?;
            commands::connect_to_device(&app_state, &target.address, catalog).await?;
            let completion = commands::read_characteristic(&app_state, &target.characteristic).await;
            commands::disconnect(&app_state).await?;
            println!("{}", hex::encode(&completion?.data));
        }
        Command::Write { target, payload } => {
            let payload = commands::parse_hex(&payload)?;
            let catalog = target.catalog(CharacteristicProperties::WRITE).await?;
            commands::connect_to_device(&app_state, &target.address, catalog).await?;
            let completion = commands::write_characteristic(&app_state, &target.characteristic, payload).await;
            commands::disconnect(&app_state).await?;
            info!("Wrote {} bytes", completion?.bytes_written);
        }
        Command::Notify { target } => {
            let catalog = target.catalog(CharacteristicProperties::NOTIFY).await?;
            commands::connect_to_device(&app_state, &target.address, catalog).await?;
            let sink: DataSink =
                Arc::new(|notification: Notification| println!("{}", hex::encode(&notification.data)));
            commands::enable_notifications(&app_state, &target.characteristic, sink).await?;
            tokio::signal::ctrl_c().await?;
            commands::disconnect(&app_state).await?;
        }
    }

    app_state.adaptor.remove_adaptor();
    Ok(())
}
