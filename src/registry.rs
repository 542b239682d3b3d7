//! Subscription registry (`SPEC_FULL.md` §4.4): reference-counted
//! multiplexing of inbound request subscriptions, and correlation-id-keyed
//! response subscriptions with lazy publication.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::binding::{Binding, EventLike};
use crate::error::{CommError, CommResult};
use crate::event::EventType;
use crate::observable::{Multicast, Subscription};
use crate::topic::{EventLevel, TopicFilter};

/// Key for the request map: an event type plus its optional filter. For
/// `Raw`, the filter slot holds the raw topic string instead of a `coaty/`
/// event-type filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub event_type: EventType,
    pub filter: Option<String>,
}

struct RequestItem {
    multicast: Multicast<EventLike>,
}

struct ResponseItem {
    multicast: Multicast<EventLike>,
}

/// Owns the request map and response map and drives the Binding's
/// subscribe/unsubscribe calls as reference counts change. Single-threaded:
/// called only from the Manager's dispatcher (§5).
pub struct SubscriptionRegistry<B: Binding + 'static> {
    binding: Arc<Mutex<B>>,
    namespace: String,
    cross_namespace: bool,
    requests: Arc<Mutex<HashMap<RequestKey, Arc<RequestItem>>>>,
    responses: Arc<Mutex<HashMap<Uuid, Arc<Mutex<ResponseItem>>>>>,
    // Correlation ids whose response item was created and later fully torn
    // down (last subscriber detached), kept so a later attempt to attach to
    // the same correlation id can be told apart from one that never existed
    // (§4.4, P4: "any later subscribe attempt ... must surface a resubscribe
    // error").
    closed_responses: Arc<Mutex<HashSet<Uuid>>>,
}

impl<B: Binding + 'static> SubscriptionRegistry<B> {
    pub fn new(binding: Arc<Mutex<B>>, namespace: String, cross_namespace: bool) -> Self {
        SubscriptionRegistry {
            binding,
            namespace,
            cross_namespace,
            requests: Arc::new(Mutex::new(HashMap::new())),
            responses: Arc::new(Mutex::new(HashMap::new())),
            closed_responses: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn request_filter_string(&self, key: &RequestKey) -> String {
        if key.event_type == EventType::Raw {
            return key.filter.clone().unwrap_or_default();
        }
        let level = key
            .event_type
            .event_level()
            .expect("non-Raw request key must map to an event level");
        let namespace = if self.cross_namespace { None } else { Some(self.namespace.as_str()) };
        if level == EventLevel::Iov {
            let route = key.filter.clone().unwrap_or_default();
            return TopicFilter::for_route(&self.namespace, &route);
        }
        TopicFilter::for_request(namespace, level, key.filter.as_deref())
    }

    /// Observe every inbound event matching `key`. Installs a Binding
    /// subscription on first observer, tears it down on last detach
    /// (P2).
    pub fn observe_request(&self, key: RequestKey) -> Subscription<EventLike> {
        let mut requests = self.requests.lock().unwrap();
        let item = requests
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RequestItem {
                    multicast: Multicast::new(),
                })
            })
            .clone();
        drop(requests);

        let binding_for_first = self.binding.clone();
        let filter_for_first = self.request_filter_string(&key);
        let binding_for_last = self.binding.clone();
        let filter_for_last = filter_for_first.clone();
        let requests_for_cleanup = self.requests.clone();
        let key_for_cleanup = key.clone();

        item.multicast.subscribe(
            move || {
                if let Err(e) = binding_for_first.lock().unwrap().subscribe(&filter_for_first) {
                    log::error!("failed to subscribe binding to {filter_for_first}: {e}");
                }
            },
            move || {
                if let Err(e) = binding_for_last.lock().unwrap().unsubscribe(&filter_for_last) {
                    log::error!("failed to unsubscribe binding from {filter_for_last}: {e}");
                }
                requests_for_cleanup.lock().unwrap().remove(&key_for_cleanup);
            },
        )
    }

    /// Dispatch an inbound request/one-way event to all observers of its
    /// `(event_type, filter)` key, in reverse subscription order.
    pub fn dispatch_request(&self, key: &RequestKey, event: EventLike) {
        let requests = self.requests.lock().unwrap();
        if let Some(item) = requests.get(key) {
            item.multicast.emit(event);
        }
    }

    /// Register a fresh correlation id for a two-way request and return a
    /// lazily-publishing response stream plus the id to embed in the
    /// outgoing request event. Publication happens exactly once, when the
    /// first subscriber attaches to the returned stream (P3).
    pub fn observe_response(
        &self,
        request_event: EventLike,
        response_event_level: EventLevel,
    ) -> (Uuid, Subscription<EventLike>) {
        let correlation_id = request_event
            .correlation_id
            .expect("two-way request event must carry a correlation id");
        let item = Arc::new(Mutex::new(ResponseItem {
            multicast: Multicast::new(),
        }));
        self.responses.lock().unwrap().insert(correlation_id, item.clone());

        let filter = TopicFilter::for_response(&self.namespace, response_event_level, correlation_id);
        if let Err(e) = self.binding.lock().unwrap().subscribe(&filter) {
            log::error!("failed to subscribe binding to {filter}: {e}");
        }

        let binding_for_publish = self.binding.clone();
        let namespace = self.namespace.clone();
        let binding_for_unsub = self.binding.clone();
        let responses_for_cleanup = self.responses.clone();
        let closed_for_cleanup = self.closed_responses.clone();

        let multicast = item.lock().unwrap().multicast.clone();
        let sub = multicast.subscribe(
            move || {
                if let Err(e) = binding_for_publish.lock().unwrap().publish(&request_event) {
                    log::error!("failed to publish request for correlation id {correlation_id}: {e}");
                }
            },
            move || {
                let filter = TopicFilter::for_response(&namespace, response_event_level, correlation_id);
                if let Err(e) = binding_for_unsub.lock().unwrap().unsubscribe(&filter) {
                    log::error!("failed to unsubscribe binding from {filter}: {e}");
                }
                responses_for_cleanup.lock().unwrap().remove(&correlation_id);
                closed_for_cleanup.lock().unwrap().insert(correlation_id);
            },
        );

        (correlation_id, sub)
    }

    /// Attaches an additional subscriber to a still-open response
    /// correlation id, fanning the remaining responses out to it as well
    /// (no republication -- the request event was already sent when the
    /// first subscriber attached). Returns [`CommError::LateResubscribe`] if
    /// `correlation_id` was already fully torn down, and
    /// [`CommError::UnknownCorrelation`] if it was never registered (§4.4,
    /// P4).
    pub fn observe_response_again(&self, correlation_id: Uuid, response_event_level: EventLevel) -> CommResult<Subscription<EventLike>> {
        let item = match self.responses.lock().unwrap().get(&correlation_id) {
            Some(item) => item.clone(),
            None => {
                return if self.closed_responses.lock().unwrap().contains(&correlation_id) {
                    Err(CommError::LateResubscribe { correlation_id })
                } else {
                    Err(CommError::UnknownCorrelation { correlation_id })
                };
            }
        };

        let namespace = self.namespace.clone();
        let binding_for_unsub = self.binding.clone();
        let responses_for_cleanup = self.responses.clone();
        let closed_for_cleanup = self.closed_responses.clone();

        let multicast = item.lock().unwrap().multicast.clone();
        Ok(multicast.subscribe(
            || {},
            move || {
                let filter = TopicFilter::for_response(&namespace, response_event_level, correlation_id);
                if let Err(e) = binding_for_unsub.lock().unwrap().unsubscribe(&filter) {
                    log::error!("failed to unsubscribe binding from {filter}: {e}");
                }
                responses_for_cleanup.lock().unwrap().remove(&correlation_id);
                closed_for_cleanup.lock().unwrap().insert(correlation_id);
            },
        ))
    }

    /// Like [`observe_response`](Self::observe_response), but publishes every
    /// event in `request_events` on first subscribe instead of just one --
    /// the dual-filter publication `publishAdvertise`/`publishUpdate` use
    /// when the object's type isn't the core type's canonical one (§4.1).
    /// All events must carry the same correlation id.
    pub fn observe_response_multi(
        &self,
        request_events: Vec<EventLike>,
        response_event_level: EventLevel,
    ) -> (Uuid, Subscription<EventLike>) {
        let correlation_id = request_events
            .first()
            .and_then(|e| e.correlation_id)
            .expect("two-way request event must carry a correlation id");
        let item = Arc::new(Mutex::new(ResponseItem {
            multicast: Multicast::new(),
        }));
        self.responses.lock().unwrap().insert(correlation_id, item.clone());

        let filter = TopicFilter::for_response(&self.namespace, response_event_level, correlation_id);
        if let Err(e) = self.binding.lock().unwrap().subscribe(&filter) {
            log::error!("failed to subscribe binding to {filter}: {e}");
        }

        let binding_for_publish = self.binding.clone();
        let namespace = self.namespace.clone();
        let binding_for_unsub = self.binding.clone();
        let responses_for_cleanup = self.responses.clone();
        let closed_for_cleanup = self.closed_responses.clone();

        let multicast = item.lock().unwrap().multicast.clone();
        let sub = multicast.subscribe(
            move || {
                let mut binding = binding_for_publish.lock().unwrap();
                for request_event in &request_events {
                    if let Err(e) = binding.publish(request_event) {
                        log::error!("failed to publish request for correlation id {correlation_id}: {e}");
                    }
                }
            },
            move || {
                let filter = TopicFilter::for_response(&namespace, response_event_level, correlation_id);
                if let Err(e) = binding_for_unsub.lock().unwrap().unsubscribe(&filter) {
                    log::error!("failed to unsubscribe binding from {filter}: {e}");
                }
                responses_for_cleanup.lock().unwrap().remove(&correlation_id);
                closed_for_cleanup.lock().unwrap().insert(correlation_id);
            },
        );

        (correlation_id, sub)
    }

    /// Dispatch an inbound response by correlation id (P6's enforcement
    /// point is the caller, which validates before calling this).
    pub fn dispatch_response(&self, correlation_id: Uuid, event: EventLike) -> CommResult<()> {
        let responses = self.responses.lock().unwrap();
        match responses.get(&correlation_id) {
            Some(item) => {
                item.lock().unwrap().multicast.emit(event);
                Ok(())
            }
            None => Err(CommError::UnknownCorrelation { correlation_id }),
        }
    }

    pub fn is_response_closed(&self, correlation_id: Uuid) -> bool {
        !self.responses.lock().unwrap().contains_key(&correlation_id)
    }

    /// Tears down every live subscription (§4.5 `stop`).
    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
        self.responses.lock().unwrap().clear();
        self.closed_responses.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{EventLikeData, FakeBinding, FakeBroker, JoinOptions};
    use futures::executor::block_on;
    use futures::StreamExt;

    fn joined_registry() -> (SubscriptionRegistry<FakeBinding>, Uuid) {
        let broker = FakeBroker::new();
        let mut binding = FakeBinding::new(broker);
        let agent_id = Uuid::new_v4();
        binding
            .join(JoinOptions {
                agent_id,
                namespace: "-".to_string(),
                join_events: vec![],
                unjoin_event: EventLike {
                    event_type: EventType::Deadvertise,
                    event_type_filter: None,
                    source_id: Some(agent_id),
                    correlation_id: None,
                    topic: Some(format!("coaty/1/-/DAD/{agent_id}")),
                    is_data_raw: false,
                    data: EventLikeData::Json(serde_json::json!({})),
                    options: None,
                },
            })
            .unwrap();
        let registry = SubscriptionRegistry::new(Arc::new(Mutex::new(binding)), "-".to_string(), false);
        (registry, agent_id)
    }

    #[test]
    fn request_subscription_receives_matching_publish() {
        let (registry, agent_id) = joined_registry();
        let key = RequestKey {
            event_type: EventType::Advertise,
            filter: None,
        };
        let mut sub = registry.observe_request(key.clone());
        let event = EventLike {
            event_type: EventType::Advertise,
            event_type_filter: None,
            source_id: Some(agent_id),
            correlation_id: None,
            topic: Some(format!("coaty/1/-/ADV/{agent_id}")),
            is_data_raw: false,
            data: EventLikeData::Json(serde_json::json!({"foo": "bar"})),
            options: None,
        };
        registry.dispatch_request(&key, event);
        let got = block_on(sub.next());
        assert!(got.is_some());
    }

    #[test]
    fn response_registration_tracks_open_correlation_ids() {
        let (registry, agent_id) = joined_registry();
        let correlation_id = Uuid::new_v4();
        let request = EventLike {
            event_type: EventType::Discover,
            event_type_filter: None,
            source_id: Some(agent_id),
            correlation_id: Some(correlation_id),
            topic: Some(format!("coaty/1/-/DSC/{agent_id}/{correlation_id}")),
            is_data_raw: false,
            data: EventLikeData::Json(serde_json::json!({})),
            options: None,
        };
        let (id, sub) = registry.observe_response(request, EventLevel::Rsv);
        assert_eq!(id, correlation_id);
        assert!(!registry.is_response_closed(correlation_id));
        drop(sub);
        assert!(registry.is_response_closed(correlation_id));
    }

    #[test]
    fn dispatch_response_to_unknown_correlation_id_errors() {
        let (registry, _agent_id) = joined_registry();
        let err = registry.dispatch_response(
            Uuid::new_v4(),
            EventLike {
                event_type: EventType::Resolve,
                event_type_filter: None,
                source_id: None,
                correlation_id: None,
                topic: None,
                is_data_raw: false,
                data: EventLikeData::Json(serde_json::json!({})),
                options: None,
            },
        );
        assert!(matches!(err, Err(CommError::UnknownCorrelation { .. })));
    }

    fn discover_request(agent_id: Uuid, correlation_id: Uuid) -> EventLike {
        EventLike {
            event_type: EventType::Discover,
            event_type_filter: None,
            source_id: Some(agent_id),
            correlation_id: Some(correlation_id),
            topic: Some(format!("coaty/1/-/DSC/{agent_id}/{correlation_id}")),
            is_data_raw: false,
            data: EventLikeData::Json(serde_json::json!({})),
            options: None,
        }
    }

    #[test]
    fn observe_response_again_fans_out_while_still_open() {
        let (registry, agent_id) = joined_registry();
        let correlation_id = Uuid::new_v4();
        let (id, mut first) = registry.observe_response(discover_request(agent_id, correlation_id), EventLevel::Rsv);
        let mut second = registry.observe_response_again(id, EventLevel::Rsv).unwrap();

        registry
            .dispatch_response(
                id,
                EventLike {
                    event_type: EventType::Resolve,
                    event_type_filter: None,
                    source_id: Some(agent_id),
                    correlation_id: Some(id),
                    topic: None,
                    is_data_raw: false,
                    data: EventLikeData::Json(serde_json::json!({})),
                    options: None,
                },
            )
            .unwrap();

        assert!(block_on(first.next()).is_some());
        assert!(block_on(second.next()).is_some());
    }

    #[test]
    fn observe_response_again_after_teardown_is_late_resubscribe() {
        let (registry, agent_id) = joined_registry();
        let correlation_id = Uuid::new_v4();
        let (id, sub) = registry.observe_response(discover_request(agent_id, correlation_id), EventLevel::Rsv);
        drop(sub);
        assert!(registry.is_response_closed(id));

        let err = registry.observe_response_again(id, EventLevel::Rsv);
        assert!(matches!(err, Err(CommError::LateResubscribe { correlation_id: cid }) if cid == id));
    }

    #[test]
    fn observe_response_again_for_never_registered_id_is_unknown_correlation() {
        let (registry, _agent_id) = joined_registry();
        let err = registry.observe_response_again(Uuid::new_v4(), EventLevel::Rsv);
        assert!(matches!(err, Err(CommError::UnknownCorrelation { .. })));
    }
}
