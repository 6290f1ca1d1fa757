//! MQTT connection lifecycle
//!
//! The rumqttc event loop runs on its own task. It reports connection state
//! on a watch channel and re-announces discovery after every (re)connect so
//! Home Assistant picks the batteries up again after a broker restart.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, Outgoing};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::discovery::TopicScheme;
use crate::publisher::{MqttPublisher, Publisher};
use crate::registry::Device;

pub struct MqttConnection {
    client: AsyncClient,
    publisher: MqttPublisher<AsyncClient>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl MqttConnection {
    /// Starts the client; `devices` are announced on every ConnAck
    pub fn start(config: &MqttConfig, devices: Vec<Device>) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.queue_capacity.max(1));
        let publisher = MqttPublisher::new(
            client.clone(),
            TopicScheme::new(&config.discovery_prefix, &config.state_topic_prefix),
        );
        let (connected_tx, connected) = watch::channel(false);
        let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);

        info!("Connecting to MQTT broker at {}:{}", config.host, config.port);

        let announcer = publisher.clone();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("Connected to MQTT broker");
                            connected_tx.send_replace(true);
                            for device in &devices {
                                announcer.publish_discovery_metadata(device);
                            }
                        } else {
                            error!("MQTT connection refused: {:?}", ack.code);
                            connected_tx.send_replace(false);
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent");
                        connected_tx.send_replace(false);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected_tx.send_replace(false) {
                            warn!("Disconnected from MQTT broker: {}", e);
                        } else {
                            debug!("MQTT connection error: {}", e);
                        }
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Self { client, publisher, connected, task }
    }

    pub fn publisher(&self) -> MqttPublisher<AsyncClient> {
        self.publisher.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Waits for the first successful ConnAck
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.connected.wait_for(|up| *up))
            .await
            .context("MQTT connection timeout")?
            .context("MQTT event loop stopped")?;
        Ok(())
    }

    /// Queues a disconnect behind pending publications and waits for the loop to drain
    pub async fn shutdown(self, grace: Duration) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect not queued: {}", e);
            self.task.abort();
            return;
        }
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("MQTT event loop did not drain within {:?}", grace);
            task.abort();
        }
    }
}
