//! Marstek Poller - battery status bridge from UDP to MQTT

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use marstek_poller::mqtt::MqttConnection;
use marstek_poller::poll::report_line;
use marstek_poller::{DeviceRegistry, Poller, PollerConfig, Scheduler, SchedulerSettings, StopFlag};

const MQTT_CONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "marstek-poller", version, about = "Polls Marstek batteries and publishes their state to MQTT")]
struct Cli {
    /// Path to the YAML configuration
    #[arg(short, long, env = "MARSTEK_POLLER_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides logging.level from the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Poll every battery once, print the results and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = PollerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let directive = cli.log_level.clone().unwrap_or_else(|| config.logging.filter_directive());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
        .init();

    info!("Starting Marstek poller with {} batteries", config.batteries.len());
    for battery in &config.batteries {
        info!("  - {} at {}", battery.name, battery.ip);
    }

    let registry = DeviceRegistry::from_config(&config.batteries, config.api.port);
    let poller = Poller::new(config.polling.exchange_policy(), config.polling.device_spacing());

    if cli.once {
        return poll_once(&config, poller, registry).await;
    }

    let mut mqtt = MqttConnection::start(&config.mqtt, registry.devices().to_vec());
    let connect_timeout = Duration::from_secs(config.mqtt.connect_timeout_secs);
    mqtt.wait_connected(connect_timeout)
        .await
        .with_context(|| format!("MQTT broker {}:{} unreachable", config.mqtt.host, config.mqtt.port))?;

    let mut scheduler = Scheduler::new(SchedulerSettings::from_config(&config), registry, poller, mqtt.publisher());
    if let Err(e) = scheduler.start().await {
        mqtt.shutdown(MQTT_CONNECT_GRACE).await;
        return Err(e).context("Cannot bind the battery API port");
    }

    let stop = StopFlag::new();
    tokio::spawn(wait_for_signal(stop.clone()));

    scheduler.run(&stop).await;

    mqtt.shutdown(MQTT_CONNECT_GRACE).await;
    info!("Marstek poller stopped");
    Ok(())
}

/// Single cycle without MQTT, for checking connectivity
async fn poll_once(config: &PollerConfig, poller: Poller, mut registry: DeviceRegistry) -> Result<()> {
    let results = poller
        .poll_standalone(config.api.bind_addr(), config.api.bind_retry(), &mut registry)
        .await
        .context("Cannot bind the battery API port")?;

    for (device, result) in &results {
        println!("{}", report_line(device, result));
    }
    Ok(())
}

async fn wait_for_signal(stop: StopFlag) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Signal handling failed: {}", e);
                    return;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Signal handling failed: {}", e);
            return;
        }
        info!("Received Ctrl-C");
    }
    stop.request_stop();
}
