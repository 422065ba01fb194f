use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{LastWill, MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config;
use crate::error::Error;
use crate::messages::{Command, DeviceCommand, DeviceState, Report, ReportSink, Request, sanitize_name};
use crate::unifi::format_mac;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage<'a> {
    name: &'a str,
    #[serde(rename = "id")]
    mac_address: String,
    state: &'static str,
    present: bool,
    hostname: Option<&'a str>,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"unifi-presence".to_string())
            .to_string();
        let topic_path = config
            .topic_path
            .clone()
            .unwrap_or("presence".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        mqttoptions.set_last_will(LastWill::new(
            status_topic(&topic_path, &publisher_id),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 64);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path,
            },
            eventloop,
        )
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}/{}", self.topic_path, self.publisher_id, leaf)
    }

    fn topic_prefix(&self) -> String {
        self.topic("")
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        let prefix = self.topic_prefix();
        let mut filters: Vec<SubscribeFilter> = Command::ALL
            .into_iter()
            .map(|command| {
                SubscribeFilter::new(format!("{prefix}command/{}", command.name()), QoS::AtMostOnce)
            })
            .collect();
        filters.push(SubscribeFilter::new(
            format!("{prefix}+/command/+"),
            QoS::AtMostOnce,
        ));
        self.client.subscribe_many(filters).await?;

        Ok(())
    }

    /// Drives the MQTT connection and forwards operator commands until the
    /// client disconnects or the receiving side goes away.
    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop, tx: mpsc::Sender<Request>) {
        let prefix = self.topic_prefix();
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(request) = p
                            .topic
                            .strip_prefix(&prefix)
                            .and_then(Request::from_topic)
                        else {
                            warn!("Ignoring unknown command topic {}", p.topic);
                            continue;
                        };

                        if tx.send(request).await.is_err() {
                            debug!("Command receiver closed");
                            break;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("Disconnect sent");
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn announce_device(&self, state: &DeviceState) -> Result<(), Error> {
        info!(
            "Announcing device {} ({}) on MQTT",
            state.name,
            state.presence.as_str()
        );
        let message = DeviceMqttMessage {
            name: &state.name,
            mac_address: format_mac(state.mac_address),
            state: state.presence.as_str(),
            present: state.presence.is_present(),
            hostname: state.hostname.as_deref(),
            retained: true,
        };
        let payload = serde_json::to_vec(&message).map_err(Error::Encode)?;
        self.client
            .publish(self.topic(&sanitize_name(&state.name)), QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl ReportSink for MqttClient {
    async fn report(&self, report: Report) -> Result<(), Error> {
        match report {
            Report::StateChanged(state) | Report::Snapshot(state) => {
                self.announce_device(&state).await
            }
            Report::Liveness(value) => {
                debug!("Heartbeat {}", value);
                let payload = if value { "DON" } else { "DOF" };
                self.client
                    .publish(self.topic("heartbeat"), QoS::AtMostOnce, false, payload)
                    .await?;
                Ok(())
            }
            Report::ControllerStatus(online) => {
                let payload = if online { "online" } else { "offline" };
                self.client
                    .publish(
                        status_topic(&self.topic_path, &self.publisher_id),
                        QoS::AtLeastOnce,
                        true,
                        payload,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn publish_notices(&self, notices: &[String]) -> Result<(), Error> {
        let payload = serde_json::to_vec(notices).map_err(Error::Encode)?;
        self.client
            .publish(self.topic("notices"), QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    async fn install_profile(&self) -> Result<(), Error> {
        info!("Installing device profile");
        let payload = serde_json::to_vec(&device_profile()).map_err(Error::Encode)?;
        self.client
            .publish(self.topic("profile"), QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }
}

fn status_topic(topic_path: &str, publisher_id: &str) -> String {
    format!("{topic_path}/{publisher_id}/status")
}

/// Describes the presence node type to consumers of the device topics.
fn device_profile() -> serde_json::Value {
    json!({
        "id": "unifi_node",
        "payload": {
            "state": ["on_network", "off_network"],
            "present": "boolean",
            "hostname": "string or null",
        },
        "heartbeat": ["DON", "DOF"],
        "status": ["online", "offline"],
        "commands": Command::ALL.iter().map(|command| command.name()).collect::<Vec<_>>(),
        "device_commands": DeviceCommand::ALL.iter().map(|command| command.name()).collect::<Vec<_>>(),
    })
}
