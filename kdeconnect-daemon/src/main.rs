mod config;

use anyhow::{Context, Result};
use kdeconnect_protocol::plugins::battery::BatteryPluginFactory;
use kdeconnect_protocol::plugins::clipboard::ClipboardPluginFactory;
use kdeconnect_protocol::plugins::ping::PingPluginFactory;
use kdeconnect_protocol::plugins::presenter::PresenterPluginFactory;
use kdeconnect_protocol::service::lan::LanPorts;
use kdeconnect_protocol::{DeviceManager, DeviceType, PluginRegistry};
use std::sync::Arc;
use tracing::info;

use config::Config;

fn build_registry(config: &Config) -> PluginRegistry {
    let mut registry = PluginRegistry::new();

    if config.plugins.enable_ping {
        info!("registering ping plugin");
        registry.register(Arc::new(PingPluginFactory));
    }
    if config.plugins.enable_battery {
        info!("registering battery plugin");
        registry.register(Arc::new(BatteryPluginFactory));
    }
    if config.plugins.enable_clipboard {
        info!("registering clipboard plugin");
        registry.register(Arc::new(ClipboardPluginFactory));
    }
    if config.plugins.enable_presenter {
        info!("registering presenter plugin");
        registry.register(Arc::new(PresenterPluginFactory));
    }

    registry
}

fn device_type(name: &str) -> DeviceType {
    match name {
        "laptop" => DeviceType::Laptop,
        "phone" => DeviceType::Phone,
        "tablet" => DeviceType::Tablet,
        "tv" => DeviceType::Tv,
        _ => DeviceType::Desktop,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting kdeconnect daemon");

    let config = Config::load().context("failed to load configuration")?;
    config
        .ensure_directories()
        .context("failed to create daemon directories")?;

    info!("device name: {}", config.device.name);
    info!("device type: {}", config.device.device_type);
    info!("discovery port: {}", config.network.discovery_port);

    let registry = Arc::new(build_registry(&config));
    info!(
        "incoming capabilities: {:?}",
        registry.all_incoming_capabilities()
    );
    info!(
        "outgoing capabilities: {:?}",
        registry.all_outgoing_capabilities()
    );

    let lan_ports = LanPorts {
        discovery_port: config.network.discovery_port,
        port_range_start: config.network.transfer_port_start,
        port_range_end: config.network.transfer_port_end,
    };

    let manager = DeviceManager::init(
        config.paths.state_dir.clone(),
        config.device.name.clone(),
        device_type(&config.device.device_type),
        lan_ports,
        registry,
    )
    .await
    .context("failed to initialize device manager")?;

    info!("local device id: {}", manager.device_id());

    manager
        .start()
        .await
        .context("failed to start channel services")?;

    info!("daemon running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("received shutdown signal");
    manager.stop().await;
    info!("daemon shutdown complete");

    Ok(())
}
