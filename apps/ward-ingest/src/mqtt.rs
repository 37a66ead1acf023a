use crate::config::Config;
use crate::error::TransportError;
use crate::ingest::{IngestStats, TransportEvent};
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectionError, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const REQUEST_HEADROOM: usize = 16;

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

/// Before the first ConnAck a failure means we never got in; afterwards it is a lost session.
fn classify(config: &Config, connected: bool, reason: String) -> TransportError {
    if connected {
        TransportError::Disconnected(reason)
    } else {
        TransportError::Connect {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            reason,
        }
    }
}

fn describe(err: &ConnectionError) -> String {
    match err {
        ConnectionError::ConnectionRefused(code) => format!("connection refused: {code:?}"),
        other => other.to_string(),
    }
}

async fn subscribe_all(client: &AsyncClient, topics: &[String]) -> Result<(), TransportError> {
    for topic in topics {
        client
            .subscribe(topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|err| TransportError::Subscribe {
                topic: topic.clone(),
                reason: err.to_string(),
            })?;
    }
    Ok(())
}

/// Subscribes to every routed topic and forwards publishes to the ingestion loop in arrival
/// order. There is no reconnect: any connection failure is reported to the loop and returned.
pub async fn run_transport(
    config: Config,
    topics: Vec<String>,
    stats: Arc<IngestStats>,
    tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    // Room for every subscription plus the disconnect and acks issued while running.
    let capacity = topics.len() + REQUEST_HEADROOM;
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), capacity);

    // Requests are queued on the client and flushed once the event loop connects.
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!("MQTT transport stopped before subscribing");
            return Ok(());
        }
        subscribed = subscribe_all(&client, &topics) => subscribed?,
    }

    let mut connected = false;
    let failure = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(err) = client.disconnect().await {
                    tracing::debug!(error = %err, "MQTT disconnect request failed");
                }
                stats.set_mqtt_connected(false);
                tracing::info!("MQTT transport stopped");
                return Ok(());
            }
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    connected = true;
                    stats.set_mqtt_connected(true);
                    tracing::info!(
                        host = %config.mqtt_host,
                        port = config.mqtt_port,
                        session_present = ack.session_present,
                        "connected to MQTT broker"
                    );
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    tracing::debug!(pkid = ack.pkid, "subscription acknowledged");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let event = TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                        received_at: Utc::now(),
                    };
                    if tx.send(event).await.is_err() {
                        // Loop is gone; nothing left to deliver to.
                        stats.set_mqtt_connected(false);
                        return Err(TransportError::ChannelClosed);
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    break classify(&config, connected, "broker sent disconnect".to_string());
                }
                Ok(_) => {}
                Err(err) => break classify(&config, connected, describe(&err)),
            }
        }
    };

    stats.set_mqtt_connected(false);
    tracing::error!(error = %failure, class = failure.class().as_str(), "MQTT transport failed");
    let _ = tx.send(TransportEvent::Disconnected(failure.clone())).await;
    Err(failure)
}
