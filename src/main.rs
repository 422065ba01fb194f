use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

mod config;
mod error;
mod manager;
mod messages;
mod mqtt;
mod tracker;
mod unifi;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Reports whether configured wireless clients are connected to a UniFi controller.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let config = config::AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    info!("Devices: {:?}", config.devices());

    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let (tx, rx) = mpsc::channel(10);

    // Handle incoming MQTT messages (operator commands)
    let events_client = mqtt_client.clone();
    let events = tokio::task::spawn(async move {
        events_client.event_loop(&mut eventloop, tx).await;
    });

    let mut core = manager::Manager::new(config, mqtt_client.clone());
    core.run_loop(rx, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl-C: {:?}", err);
            std::future::pending::<()>().await;
        }
    })
    .await;

    info!("Exiting manager event loop");
    mqtt_client.disconnect().await?;
    if tokio::time::timeout(SHUTDOWN_GRACE, events).await.is_err() {
        error!("MQTT event loop did not finish, exiting anyway");
    }

    Ok(())
}
