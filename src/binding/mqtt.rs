//! The canonical MQTT binding, built on `rumqttc`.
//!
//! Runs `rumqttc`'s connection event loop on a dedicated background
//! thread and forwards decoded inbound packets to whoever drains this
//! binding's [`Multicast<BindingEvent>`] -- the same "Binding I/O on its
//! own thread, handed to the Manager via a queue" shape `SPEC_FULL.md` §5
//! calls for.

use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{Client, Event as MqttEvent, MqttOptions, Packet, QoS};
use uuid::Uuid;

use crate::error::{CommError, CommResult};
use crate::event::{EventType, RawPayload};
use crate::observable::Multicast;

use super::{Binding, BindingEvent, BindingState, CommunicationState, EventLike, EventLikeData, JoinOptions};

/// Connection parameters for the default MQTT binding (§6 configuration
/// schema: `brokerUrl`, `mqttClientOptions`, `tlsOptions`).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttBindingOptions {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_keep_alive", with = "keep_alive_secs")]
    pub keep_alive: Duration,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_clean_session() -> bool {
    true
}

mod keep_alive_secs {
    use std::time::Duration;

    use serde::Deserialize;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for MqttBindingOptions {
    fn default() -> Self {
        MqttBindingOptions {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
        }
    }
}

pub struct MqttBinding {
    options: MqttBindingOptions,
    state: BindingState,
    client: Option<Client>,
    events: Multicast<BindingEvent>,
}

impl MqttBinding {
    pub fn new(options: MqttBindingOptions) -> Self {
        MqttBinding {
            options,
            state: BindingState::Initialized,
            client: None,
            events: Multicast::new(),
        }
    }

    fn publish_raw(&mut self, topic: &str, qos: QoS, payload: Vec<u8>) -> CommResult<()> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| CommError::IllegalState("publish before join".into()))?;
        client
            .publish(topic, qos, false, payload)
            .map_err(|e| CommError::Transport(e.to_string()))
    }
}

impl Binding for MqttBinding {
    fn state(&self) -> BindingState {
        self.state
    }

    fn join(&mut self, options: JoinOptions) -> CommResult<()> {
        if !matches!(self.state, BindingState::Initialized | BindingState::Unjoined) {
            return Err(CommError::IllegalState(format!(
                "join is illegal in state {:?}",
                self.state
            )));
        }
        self.state = BindingState::Joining;

        let mut mqtt_options = MqttOptions::new(
            options.agent_id.to_string(),
            self.options.broker_host.clone(),
            self.options.broker_port,
        );
        mqtt_options.set_keep_alive(self.options.keep_alive);
        mqtt_options.set_clean_session(self.options.clean_session);

        let unjoin = options.unjoin_event.clone();
        if let (Some(topic), EventLikeData::Json(value)) = (&unjoin.topic, &unjoin.data) {
            let payload = serde_json::to_vec(value).map_err(|e| CommError::Transport(e.to_string()))?;
            mqtt_options.set_last_will(rumqttc::LastWill::new(topic, payload, QoS::AtMostOnce, false));
        } else {
            warn!("unjoin event has no encoded topic/JSON payload; last-will not registered");
        }

        let (client, mut connection) = Client::new(mqtt_options, 256);
        let sink = self.events.clone();
        thread::Builder::new()
            .name(format!("mqtt-binding-{}", options.agent_id))
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                            match decode_inbound(&publish.topic, &publish.payload) {
                                Ok(event) => sink.emit(BindingEvent::Inbound(event)),
                                Err(e) => {
                                    error!("failed to decode inbound MQTT publish on {:?}: {e}", publish.topic);
                                    sink.emit(BindingEvent::Error(e.to_string()));
                                }
                            }
                        }
                        Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                            debug!("mqtt binding connected");
                            sink.emit(BindingEvent::CommunicationState(CommunicationState::Online));
                        }
                        Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                            sink.emit(BindingEvent::CommunicationState(CommunicationState::Offline));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("mqtt connection error: {e}");
                            sink.emit(BindingEvent::CommunicationState(CommunicationState::Offline));
                            sink.emit(BindingEvent::Error(e.to_string()));
                        }
                    }
                }
                info!("mqtt binding event loop terminated");
            })
            .expect("failed to spawn mqtt binding thread");

        self.client = Some(client);
        self.state = BindingState::Joined;

        for event in &options.join_events {
            self.publish(event)?;
        }
        Ok(())
    }

    fn unjoin(&mut self) -> CommResult<()> {
        if self.state != BindingState::Joined {
            return Err(CommError::IllegalState(format!(
                "unjoin is illegal in state {:?}",
                self.state
            )));
        }
        self.state = BindingState::Unjoining;
        if let Some(client) = self.client.take() {
            client.disconnect().map_err(|e| CommError::Transport(e.to_string()))?;
        }
        self.state = BindingState::Unjoined;
        Ok(())
    }

    fn publish(&mut self, event: &EventLike) -> CommResult<()> {
        let topic = event
            .topic
            .clone()
            .ok_or_else(|| CommError::PublishRejected("event-like record has no encoded topic".into()))?;
        let qos = event
            .options
            .as_ref()
            .and_then(|o| o.get("qos"))
            .and_then(|q| q.as_u64())
            .map(|q| match q {
                1 => QoS::AtLeastOnce,
                2 => QoS::ExactlyOnce,
                _ => QoS::AtMostOnce,
            })
            .unwrap_or(QoS::AtMostOnce);
        let payload = match &event.data {
            EventLikeData::Json(value) => serde_json::to_vec(value).map_err(|e| CommError::Transport(e.to_string()))?,
            EventLikeData::Raw(RawPayload::Text(s)) => s.clone().into_bytes(),
            EventLikeData::Raw(RawPayload::Bytes(b)) => b.clone(),
        };
        self.publish_raw(&topic, qos, payload)
    }

    fn subscribe(&mut self, filter: &str) -> CommResult<()> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| CommError::IllegalState("subscribe before join".into()))?;
        client
            .subscribe(filter, QoS::AtMostOnce)
            .map_err(|e| CommError::Transport(e.to_string()))
    }

    fn unsubscribe(&mut self, filter: &str) -> CommResult<()> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| CommError::IllegalState("unsubscribe before join".into()))?;
        client
            .unsubscribe(filter)
            .map_err(|e| CommError::Transport(e.to_string()))
    }

    fn events(&self) -> Multicast<BindingEvent> {
        self.events.clone()
    }
}

fn decode_inbound(topic: &str, payload: &[u8]) -> CommResult<EventLike> {
    if crate::topic::is_raw_topic(topic) {
        return Ok(EventLike {
            event_type: EventType::Raw,
            event_type_filter: None,
            source_id: None,
            correlation_id: None,
            topic: Some(topic.to_string()),
            is_data_raw: true,
            data: EventLikeData::Raw(RawPayload::Bytes(payload.to_vec())),
            options: None,
        });
    }
    let decoded = crate::topic::Topic::decode(topic)?;
    let source_id = match &decoded.subject {
        crate::topic::Subject::Agent(id) => Some(*id),
        crate::topic::Subject::Route(_) => None,
    };
    let event_type = event_type_for_level(decoded.event_level)?;
    let is_data_raw = matches!(decoded.event_level, crate::topic::EventLevel::Iov) && is_binary_payload(payload);
    let data = if is_data_raw {
        EventLikeData::Raw(RawPayload::Bytes(payload.to_vec()))
    } else {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| CommError::Transport(e.to_string()))?;
        EventLikeData::Json(value)
    };
    Ok(EventLike {
        event_type,
        event_type_filter: decoded.event_type_filter,
        source_id,
        correlation_id: decoded.correlation_id,
        topic: Some(topic.to_string()),
        is_data_raw,
        data,
        options: None,
    })
}

fn is_binary_payload(payload: &[u8]) -> bool {
    std::str::from_utf8(payload).is_err()
}

fn event_type_for_level(level: crate::topic::EventLevel) -> CommResult<EventType> {
    use crate::topic::EventLevel::*;
    Ok(match level {
        Adv => EventType::Advertise,
        Dad => EventType::Deadvertise,
        Chn => EventType::Channel,
        Asc => EventType::Associate,
        Iov => EventType::IoValue,
        Dsc => EventType::Discover,
        Rsv => EventType::Resolve,
        Qry => EventType::Query,
        Rtv => EventType::Retrieve,
        Upd => EventType::Update,
        Cpl => EventType::Complete,
        Cll => EventType::Call,
        Rtn => EventType::Return,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_standard_mqtt_port() {
        let options = MqttBindingOptions::default();
        assert_eq!(options.broker_port, 1883);
    }

    #[test]
    fn decode_inbound_raw_topic() {
        let event = decode_inbound("sensors/outside/temp", b"21.5").unwrap();
        assert_eq!(event.event_type, EventType::Raw);
        assert!(event.is_data_raw);
    }
}
