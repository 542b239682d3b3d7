//! The transport-agnostic Binding contract (`SPEC_FULL.md` §4.3): join,
//! unjoin, publish, subscribe, unsubscribe, plus the diagnostic and
//! inbound-event callbacks. The canonical realization is [`mqtt::MqttBinding`];
//! [`FakeBinding`] is an in-process test double implementing the same
//! contract, used by the crate's own registry/manager/io-routing tests so
//! they do not require a live broker.

#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use crate::error::{CommError, CommResult};
use crate::event::RawPayload;
use crate::observable::Multicast;

/// Binding connectivity, derived from transport connectivity (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationState {
    Offline,
    Online,
}

/// Binding lifecycle: `Initialized -> Joining -> Joined <-> Unjoining ->
/// Unjoined`. `join` is legal only in `Initialized` or `Unjoined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Initialized,
    Joining,
    Joined,
    Unjoining,
    Unjoined,
}

/// The serialization-neutral shape the Binding consumes and emits (§3).
#[derive(Debug, Clone)]
pub struct EventLike {
    pub event_type: crate::event::EventType,
    pub event_type_filter: Option<String>,
    pub source_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub topic: Option<String>,
    pub is_data_raw: bool,
    pub data: EventLikeData,
    pub options: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum EventLikeData {
    Json(Value),
    Raw(RawPayload),
}

/// Parameters for [`Binding::join`].
pub struct JoinOptions {
    pub agent_id: Uuid,
    pub namespace: String,
    pub join_events: Vec<EventLike>,
    pub unjoin_event: EventLike,
}

/// Diagnostic and data events a Binding emits. Delivered to the Manager's
/// single dispatcher (§5); bindings that spawn their own I/O thread must
/// funnel everything through one channel so ordering per-binding is
/// preserved.
#[derive(Debug, Clone)]
pub enum BindingEvent {
    Debug(String),
    Info(String),
    Error(String),
    CommunicationState(CommunicationState),
    Inbound(EventLike),
}

/// Transport-agnostic contract every binding must implement (§4.3).
pub trait Binding: Send {
    fn state(&self) -> BindingState;

    fn join(&mut self, options: JoinOptions) -> CommResult<()>;

    /// Publishes the unjoin event, flushes, disconnects.
    fn unjoin(&mut self) -> CommResult<()>;

    fn publish(&mut self, event: &EventLike) -> CommResult<()>;

    fn subscribe(&mut self, filter: &str) -> CommResult<()>;

    fn unsubscribe(&mut self, filter: &str) -> CommResult<()>;

    /// Registers the sink the Manager drains its dispatcher from. Called
    /// once at construction.
    fn events(&self) -> Multicast<BindingEvent>;
}

/// Lets `CommunicationManager` hold a `Box<dyn Binding>` rather than being
/// generic over the binding type, while [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry)
/// still works unmodified since it only requires `B: Binding`.
impl Binding for Box<dyn Binding> {
    fn state(&self) -> BindingState {
        (**self).state()
    }

    fn join(&mut self, options: JoinOptions) -> CommResult<()> {
        (**self).join(options)
    }

    fn unjoin(&mut self) -> CommResult<()> {
        (**self).unjoin()
    }

    fn publish(&mut self, event: &EventLike) -> CommResult<()> {
        (**self).publish(event)
    }

    fn subscribe(&mut self, filter: &str) -> CommResult<()> {
        (**self).subscribe(filter)
    }

    fn unsubscribe(&mut self, filter: &str) -> CommResult<()> {
        (**self).unsubscribe(filter)
    }

    fn events(&self) -> Multicast<BindingEvent> {
        (**self).events()
    }
}

// ---------------------------------------------------------------------
// In-process fake binding for tests
// ---------------------------------------------------------------------

#[cfg(any(test, feature = "test-util"))]
struct FakeBrokerState {
    // filter string -> set of agent ids subscribed to it, used only to
    // decide whether a publish has at least one matching subscriber; the
    // actual fan-out goes through each connected FakeBinding's own
    // `events` multicast, keyed by filter match.
    subscribers: std::collections::HashMap<Uuid, Vec<String>>,
    bindings: std::collections::HashMap<Uuid, Multicast<BindingEvent>>,
}

/// A broker shared in-process by every [`FakeBinding`] connected to it,
/// so publishes from one agent are echoed to every other (and the
/// publisher's own) matching subscription -- mirroring what a real MQTT
/// broker would do, including echo delivery (P5).
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<FakeBrokerState>>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl FakeBroker {
    pub fn new() -> Self {
        FakeBroker {
            state: Arc::new(Mutex::new(FakeBrokerState {
                subscribers: std::collections::HashMap::new(),
                bindings: std::collections::HashMap::new(),
            })),
        }
    }

    fn register(&self, agent_id: Uuid, sink: Multicast<BindingEvent>) {
        self.state.lock().unwrap().bindings.insert(agent_id, sink);
    }

    fn deregister(&self, agent_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.bindings.remove(&agent_id);
        state.subscribers.remove(&agent_id);
    }

    fn subscribe(&self, agent_id: Uuid, filter: &str) {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .entry(agent_id)
            .or_default()
            .push(filter.to_string());
    }

    fn unsubscribe(&self, agent_id: Uuid, filter: &str) {
        if let Some(v) = self.state.lock().unwrap().subscribers.get_mut(&agent_id) {
            v.retain(|f| f != filter);
        }
    }

    fn publish(&self, topic: &str, event: &EventLike) {
        let state = self.state.lock().unwrap();
        for (agent_id, filters) in state.subscribers.iter() {
            if filters.iter().any(|f| topic_matches_filter(topic, f)) {
                if let Some(sink) = state.bindings.get(agent_id) {
                    sink.emit(BindingEvent::Inbound(event.clone()));
                }
            }
        }
    }

    /// Simulates a broker delivering an agent's last-will unjoin event
    /// after it disappears without calling `unjoin` (§5, P9, scenario 6).
    pub fn simulate_crash(&self, agent_id: Uuid, last_will: EventLike) {
        let topic = last_will
            .topic
            .clone()
            .expect("last-will event must carry a pre-encoded topic");
        self.deregister(agent_id);
        self.publish(&topic, &last_will);
    }
}

#[cfg(any(test, feature = "test-util"))]
fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let t: Vec<&str> = topic.split('/').collect();
    let f: Vec<&str> = filter.split('/').collect();
    if f.len() != t.len() {
        return false;
    }
    t.iter().zip(f.iter()).all(|(tl, fl)| *fl == "+" || fl == tl)
}

/// In-process [`Binding`] implementation for tests. Constructed with a
/// shared [`FakeBroker`] so multiple agents can observe each other within
/// one process and one test.
#[cfg(any(test, feature = "test-util"))]
pub struct FakeBinding {
    broker: FakeBroker,
    agent_id: Option<Uuid>,
    state: BindingState,
    events: Multicast<BindingEvent>,
    unjoin_event: Option<EventLike>,
}

#[cfg(any(test, feature = "test-util"))]
impl FakeBinding {
    pub fn new(broker: FakeBroker) -> Self {
        FakeBinding {
            broker,
            agent_id: None,
            state: BindingState::Initialized,
            events: Multicast::new(),
            unjoin_event: None,
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Binding for FakeBinding {
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
        self.agent_id = Some(options.agent_id);
        self.broker.register(options.agent_id, self.events.clone());
        self.unjoin_event = Some(options.unjoin_event);
        self.state = BindingState::Joined;
        self.events.emit(BindingEvent::CommunicationState(CommunicationState::Online));
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
        if let Some(event) = self.unjoin_event.take() {
            self.publish(&event)?;
        }
        if let Some(agent_id) = self.agent_id {
            self.broker.deregister(agent_id);
        }
        self.state = BindingState::Unjoined;
        self.events.emit(BindingEvent::CommunicationState(CommunicationState::Offline));
        Ok(())
    }

    fn publish(&mut self, event: &EventLike) -> CommResult<()> {
        let topic = event
            .topic
            .clone()
            .ok_or_else(|| CommError::PublishRejected("event-like record has no encoded topic".into()))?;
        self.broker.publish(&topic, event);
        Ok(())
    }

    fn subscribe(&mut self, filter: &str) -> CommResult<()> {
        let agent_id = self
            .agent_id
            .ok_or_else(|| CommError::IllegalState("subscribe before join".into()))?;
        self.broker.subscribe(agent_id, filter);
        Ok(())
    }

    fn unsubscribe(&mut self, filter: &str) -> CommResult<()> {
        let agent_id = self
            .agent_id
            .ok_or_else(|| CommError::IllegalState("unsubscribe before join".into()))?;
        self.broker.unsubscribe(agent_id, filter);
        Ok(())
    }

    fn events(&self) -> Multicast<BindingEvent> {
        self.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_matches_filter_with_single_level_wildcard() {
        assert!(topic_matches_filter("coaty/1/-/ADV:Identity/abc", "coaty/1/-/ADV:Identity/+"));
        assert!(!topic_matches_filter("coaty/1/-/ADV:Identity/abc", "coaty/1/-/DAD/+"));
        assert!(!topic_matches_filter("coaty/1/-/ADV:Identity/abc/def", "coaty/1/-/ADV:Identity/+"));
    }
}
