use std::time::Duration;

use flume::Receiver;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

use crate::error::{BridgeError, Result};

/// Broker connection parameters, folded from the `[mqtt]` config section.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            host: "localhost".into(),
            port: 1883,
            client_id: "modbridge".into(),
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
        }
    }
}

/// Broker events forwarded to the main thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Thin wrapper around the rumqttc sync client: a forwarder thread drains
/// the connection event loop into a flume channel so the main thread can
/// select over it together with the worker channels. rumqttc keeps
/// reconnecting on its own; every successful (re)connect surfaces as
/// `Connected`.
pub struct MqttConnection {
    client: Client,
    pub events: Receiver<MqttEvent>,
}

impl MqttConnection {
    pub fn open(settings: &BrokerSettings) -> Result<MqttConnection> {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keepalive);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut connection) = Client::new(options, 64);
        let (tx, rx) = flume::bounded(256);
        let host = settings.host.clone();
        let port = settings.port;

        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || {
                let mut was_connected = false;
                for event in connection.iter() {
                    let forwarded = match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("mqtt connected to {host}:{port}");
                            was_connected = true;
                            tx.send(MqttEvent::Connected)
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            tx.send(MqttEvent::Message {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            })
                        }
                        Ok(_) => Ok(()),
                        Err(e) => {
                            if was_connected {
                                log::warn!("mqtt connection lost: {e}");
                                was_connected = false;
                            } else {
                                log::debug!("mqtt connect attempt failed: {e}");
                            }
                            let sent = tx.send(MqttEvent::Disconnected);
                            std::thread::sleep(Duration::from_secs(1));
                            sent
                        }
                    };
                    if forwarded.is_err() {
                        break;
                    }
                }
                log::debug!("mqtt forwarder thread ended");
            })
            .map_err(|e| BridgeError::Mqtt(format!("failed to spawn mqtt thread: {e}")))?;

        Ok(MqttConnection { client, events: rx })
    }

    pub fn subscribe(&self, topic: &str) -> Result<()> {
        log::debug!("subscribing to {topic}");
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| BridgeError::Mqtt(format!("subscribe {topic}: {e}")))
    }

    pub fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|e| BridgeError::Mqtt(format!("publish {topic}: {e}")))
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.client.disconnect() {
            log::debug!("mqtt disconnect: {e}");
        }
    }
}
