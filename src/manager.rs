//! The Communication Manager (`SPEC_FULL.md` §4.5): the single object an
//! agent talks to. Owns the Binding, the subscription registry and the IO
//! routing table for one joined session, runs the single dispatcher thread
//! that drains the Binding's event multicast, and exposes the public
//! `publish*`/`observe*` surface plus the `start`/`stop`/`restart` lifecycle.
//!
//! Grounded on the reference crate's `DomainParticipant`: a long-lived,
//! `Send`-but-not-`Clone` handle that owns a background I/O thread and hands
//! out typed readers/writers -- here, typed observe streams and responder
//! handles instead.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread;

use futures::executor::block_on;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::binding::mqtt::MqttBinding;
use crate::binding::{Binding, BindingEvent, CommunicationState, EventLike, EventLikeData, JoinOptions};
use crate::config::{BindingDescriptor, CommunicationOptions};
use crate::error::{CommError, CommResult};
use crate::event::{
    check_discover_resolve_consistency, check_update_complete_consistency, object_matches_types, AssociateData,
    CallData, ChannelObjects, CommEvent, CompleteData, DeadvertiseData, DiscoverData, EventData, EventType,
    QueryData, RawPayload, ResolveData, ReturnData, UpdateData,
};
use crate::io_routing::IoRoutingTable;
use crate::object::{CoatyObject, CoreType, Identity, IoNode};
use crate::observable::{BehaviorMulticast, Multicast, Subscription};
use crate::registry::{RequestKey, SubscriptionRegistry};
use crate::topic::{EventLevel, Subject, Topic, TopicFilter};

/// Lifecycle state of the Manager itself, independent of transport
/// connectivity (which is [`CommunicationState`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingState {
    Stopped,
    Started,
}

/// Everything that exists only while the Manager is started: the live
/// Binding, the registry and routing table built against it, and the
/// identity/IoNodes advertised for this session.
struct Started {
    binding: Arc<Mutex<Box<dyn Binding>>>,
    registry: Arc<SubscriptionRegistry<Box<dyn Binding>>>,
    io_routing: Mutex<IoRoutingTable>,
    identity: Identity,
    io_nodes: Vec<IoNode>,
    namespace: String,
    events: Multicast<BindingEvent>,
}

/// The agent-facing entry point into the communication runtime (§4.5).
/// `Send` but not `Clone` -- share it behind an `Arc` the way an agent
/// container would share one `DomainParticipant`.
pub struct CommunicationManager {
    agent_name: String,
    default_options: Mutex<CommunicationOptions>,
    started: Mutex<Option<Arc<Started>>>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    operating_state: BehaviorMulticast<OperatingState>,
    communication_state: Arc<BehaviorMulticast<CommunicationState>>,
}

impl CommunicationManager {
    pub fn new(agent_name: impl Into<String>, options: CommunicationOptions) -> Self {
        let manager = CommunicationManager {
            agent_name: agent_name.into(),
            default_options: Mutex::new(options),
            started: Mutex::new(None),
            dispatcher: Mutex::new(None),
            operating_state: BehaviorMulticast::new(),
            communication_state: Arc::new(BehaviorMulticast::new()),
        };
        manager.operating_state.emit(OperatingState::Stopped);
        manager.communication_state.emit(CommunicationState::Offline);
        manager
    }

    pub fn observe_operating_state(&self) -> Subscription<OperatingState> {
        self.operating_state.subscribe()
    }

    pub fn observe_communication_state(&self) -> Subscription<CommunicationState> {
        self.communication_state.subscribe()
    }

    pub fn identity(&self) -> CommResult<CoatyObject> {
        self.with_started(|s| Ok(s.identity.0.clone()))
    }

    fn with_started<R>(&self, f: impl FnOnce(&Arc<Started>) -> CommResult<R>) -> CommResult<R> {
        let guard = self.started.lock().unwrap();
        match &*guard {
            Some(started) => f(started),
            None => Err(CommError::IllegalState("communication manager is not started".into())),
        }
    }

    /// Starts (or re-starts, with new options) the Manager (§4.5's state
    /// machine). `None` reuses the previously supplied/constructed options
    /// and is a no-op while already started; `Some` always becomes the new
    /// stored configuration, stopping a running session first if necessary.
    pub fn start(&self, options: Option<CommunicationOptions>) -> CommResult<()> {
        self.start_internal(options, None)
    }

    /// Test-only seam: starts the Manager against a pre-built [`Binding`]
    /// (e.g. a [`crate::binding::FakeBinding`] sharing a
    /// [`crate::binding::FakeBroker`] with another Manager in the same
    /// process) instead of constructing one from `options.binding`. The
    /// `BindingDescriptor` in `options` is otherwise ignored.
    #[cfg(any(test, feature = "test-util"))]
    pub fn start_with_binding(&self, binding: Box<dyn Binding>, options: Option<CommunicationOptions>) -> CommResult<()> {
        self.start_internal(options, Some(binding))
    }

    fn start_internal(&self, options: Option<CommunicationOptions>, injected_binding: Option<Box<dyn Binding>>) -> CommResult<()> {
        if options.is_none() && injected_binding.is_none() && self.started.lock().unwrap().is_some() {
            return Ok(());
        }
        if self.started.lock().unwrap().is_some() {
            self.stop()?;
        }

        let effective = match options {
            Some(o) => {
                o.validate()?;
                *self.default_options.lock().unwrap() = o.clone();
                o
            }
            None => self.default_options.lock().unwrap().clone(),
        };

        let mut identity_object = CoatyObject::new("coaty.Identity", CoreType::Identity, self.agent_name.clone())?;
        if let Some(over) = &effective.common.agent_identity {
            if let Some(name) = &over.name {
                identity_object.name = name.clone();
            }
            if let Some(ext) = &over.external_id {
                identity_object.external_id = Some(ext.clone());
            }
        }
        let identity = Identity(identity_object);

        let mut io_nodes = Vec::new();
        for (context_name, node_cfg) in &effective.common.io_context_nodes {
            io_nodes.push(IoNode::new(
                context_name.clone(),
                node_cfg.io_sources.clone(),
                node_cfg.io_actors.clone(),
            )?);
        }

        let mut io_routing = IoRoutingTable::new();
        for node in &io_nodes {
            for source in &node.io_sources {
                io_routing.register_local_source(source.id());
            }
            for actor in &node.io_actors {
                io_routing.register_local_actor(actor.id(), actor.use_raw_io_values);
            }
        }

        let binding: Box<dyn Binding> = match injected_binding {
            Some(binding) => binding,
            None => match &effective.binding {
                BindingDescriptor::Mqtt { options } => Box::new(MqttBinding::new(options.clone())),
            },
        };
        let events = binding.events();
        let binding = Arc::new(Mutex::new(binding));

        let agent_id = identity.object_id();
        let namespace = effective.namespace.clone();

        let mut join_events_comm = vec![CommEvent::advertise(agent_id, identity.0.clone())?];
        for node in &io_nodes {
            join_events_comm.push(CommEvent::advertise(agent_id, node.object.clone())?);
        }
        let mut deadvertise_ids = vec![agent_id];
        deadvertise_ids.extend(io_nodes.iter().map(|n| n.id()));
        let unjoin_event_comm = CommEvent::deadvertise(agent_id, deadvertise_ids)?;

        let join_events = join_events_comm
            .iter()
            .map(|e| event_to_event_like(e, &namespace, None))
            .collect::<CommResult<Vec<_>>>()?;
        let unjoin_event = event_to_event_like(&unjoin_event_comm, &namespace, None)?;

        let registry = Arc::new(SubscriptionRegistry::new(
            binding.clone(),
            namespace.clone(),
            effective.should_enable_cross_namespacing,
        ));

        let started = Arc::new(Started {
            binding: binding.clone(),
            registry,
            io_routing: Mutex::new(io_routing),
            identity,
            io_nodes,
            namespace: namespace.clone(),
            events: events.clone(),
        });

        // Install the dispatcher before `join()` so nothing emitted during
        // connect -- including the `Online` transition -- is lost (§5's
        // single-dispatcher rule; the Binding has no buffering of its own).
        let events_sub = events.subscribe(|| {}, || {});
        let comm_state = self.communication_state.clone();
        let dispatcher_started = started.clone();
        let handle = thread::Builder::new()
            .name(format!("coaty-comm-dispatcher-{agent_id}"))
            .spawn(move || run_dispatcher(dispatcher_started, events_sub, comm_state))
            .map_err(|e| CommError::Transport(e.to_string()))?;
        *self.dispatcher.lock().unwrap() = Some(handle);

        if let Err(e) = binding.lock().unwrap().join(JoinOptions {
            agent_id,
            namespace: namespace.clone(),
            join_events,
            unjoin_event,
        }) {
            started.events.close();
            if let Some(h) = self.dispatcher.lock().unwrap().take() {
                let _ = h.join();
            }
            return Err(e);
        }

        // Always-on system behavior (§4.5): every agent resolves Discover
        // requests naming its own Identity or IoNodes, and every IoNode
        // reacts to Associate events scoped to its context name.
        for node in &started.io_nodes {
            let filter = TopicFilter::for_request(Some(&namespace), EventLevel::Asc, Some(node.context_name()));
            if let Err(e) = started.binding.lock().unwrap().subscribe(&filter) {
                log::error!("failed to subscribe to associate filter for context {:?}: {e}", node.context_name());
            }
        }
        let discover_ns = if effective.should_enable_cross_namespacing {
            None
        } else {
            Some(namespace.as_str())
        };
        let discover_filter = TopicFilter::for_request(discover_ns, EventLevel::Dsc, None);
        if let Err(e) = started.binding.lock().unwrap().subscribe(&discover_filter) {
            log::error!("failed to subscribe to discover filter: {e}");
        }

        *self.started.lock().unwrap() = Some(started);
        self.operating_state.emit(OperatingState::Started);
        Ok(())
    }

    /// Publishes the unjoin event, tears down every live subscription, and
    /// disconnects. A no-op if already stopped.
    pub fn stop(&self) -> CommResult<()> {
        let started = self.started.lock().unwrap().take();
        let Some(started) = started else {
            return Ok(());
        };
        started.registry.clear();
        let unjoin_result = started.binding.lock().unwrap().unjoin();
        started.events.close();
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.communication_state.emit(CommunicationState::Offline);
        self.operating_state.emit(OperatingState::Stopped);
        unjoin_result
    }

    /// Sugar for `stop` followed by `start` with new options -- not part of
    /// the original API surface this crate redesigns, but a natural
    /// addition once `start`/`stop` exist as separate calls.
    pub fn restart(&self, options: CommunicationOptions) -> CommResult<()> {
        self.stop()?;
        self.start(Some(options))
    }

    // -----------------------------------------------------------------
    // One-way publish
    // -----------------------------------------------------------------

    pub fn publish_advertise(&self, event: CommEvent) -> CommResult<()> {
        let EventData::Advertise(data) = &event.data else {
            return Err(CommError::Validation {
                what: "Advertise",
                reason: "not an Advertise event".into(),
            });
        };
        let object = data.object.clone();
        self.with_started(|started| {
            publish_event_like(started, &event, None)?;
            if !is_canonical_object_type(&object.core_type, &object.object_type) {
                publish_event_like(started, &event, Some(format!(":{}", object.object_type)))?;
            }
            Ok(())
        })
    }

    pub fn publish_deadvertise(&self, event: CommEvent) -> CommResult<()> {
        if !matches!(event.data, EventData::Deadvertise(_)) {
            return Err(CommError::Validation {
                what: "Deadvertise",
                reason: "not a Deadvertise event".into(),
            });
        }
        self.with_started(|started| publish_event_like(started, &event, None))
    }

    pub fn publish_channel(&self, event: CommEvent) -> CommResult<()> {
        if !matches!(event.data, EventData::Channel(_)) {
            return Err(CommError::Validation {
                what: "Channel",
                reason: "not a Channel event".into(),
            });
        }
        self.with_started(|started| publish_event_like(started, &event, None))
    }

    pub fn publish_raw(&self, event: CommEvent) -> CommResult<()> {
        let EventData::Raw(raw) = &event.data else {
            return Err(CommError::Validation {
                what: "Raw",
                reason: "not a Raw event".into(),
            });
        };
        if !crate::topic::is_valid_publication_topic(&raw.topic) {
            return Err(CommError::PublishRejected(format!(
                "{:?} is not a valid publication topic",
                raw.topic
            )));
        }
        self.with_started(|started| publish_event_like(started, &event, None))
    }

    /// Publishes a value for `source_id` on its currently associated route.
    /// Dropped silently (§4.6) if the source has no active association.
    pub fn publish_io_value(&self, source_id: Uuid, payload: RawPayload) -> CommResult<()> {
        self.with_started(|started| {
            let route = started.io_routing.lock().unwrap().route_for_source(source_id);
            match route {
                Some(route) => {
                    let event = CommEvent::io_value(source_id, route, payload)?;
                    publish_event_like(started, &event, None)
                }
                None => {
                    log::debug!("dropping IoValue publish for source {source_id}: no active route");
                    Ok(())
                }
            }
        })
    }

    // -----------------------------------------------------------------
    // One-way observe
    // -----------------------------------------------------------------

    pub fn observe_deadvertise(&self) -> CommResult<impl Stream<Item = DeadvertiseData>> {
        self.with_started(|started| {
            let key = RequestKey {
                event_type: EventType::Deadvertise,
                filter: None,
            };
            let inner = started.registry.observe_request(key);
            Ok(RequestStream {
                inner,
                decode: decode_json::<DeadvertiseData>,
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_advertise_by_core_type(&self, core_type: CoreType) -> CommResult<impl Stream<Item = CoatyObject>> {
        self.with_started(|started| {
            let inner = subscribe_typed(started, EventType::Advertise, TypeSelector::CoreType(&core_type));
            Ok(RequestStream {
                inner,
                decode: |el: EventLike| decode_advertise_object(el, None),
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_advertise_by_object_type(&self, object_type: &str) -> CommResult<impl Stream<Item = CoatyObject>> {
        let object_type = object_type.to_string();
        self.with_started(|started| {
            let inner = subscribe_typed(started, EventType::Advertise, TypeSelector::ObjectType(&object_type));
            let guard = canonical_guard(&object_type);
            Ok(RequestStream {
                inner,
                decode: move |el: EventLike| decode_advertise_object(el, guard.clone()),
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_channel(&self, channel_id: &str) -> CommResult<impl Stream<Item = ChannelMessage>> {
        let key = RequestKey {
            event_type: EventType::Channel,
            filter: Some(channel_id.to_string()),
        };
        self.with_started(|started| {
            let inner = started.registry.observe_request(key);
            Ok(RequestStream {
                inner,
                decode: decode_channel,
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_raw(&self, topic_filter: &str) -> CommResult<impl Stream<Item = RawMessage>> {
        let key = RequestKey {
            event_type: EventType::Raw,
            filter: Some(topic_filter.to_string()),
        };
        self.with_started(|started| {
            let inner = started.registry.observe_request(key);
            Ok(RequestStream {
                inner,
                decode: decode_raw,
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_io_value(&self, actor_id: Uuid) -> CommResult<Subscription<RawPayload>> {
        self.with_started(|started| {
            started
                .io_routing
                .lock()
                .unwrap()
                .observe_actor_value(actor_id)
                .ok_or_else(|| CommError::Validation {
                    what: "observeIoValue",
                    reason: format!("{actor_id} is not a registered local IO actor"),
                })
        })
    }

    pub fn observe_io_state_of_source(&self, source_id: Uuid) -> CommResult<Subscription<crate::io_routing::IoState>> {
        self.with_started(|started| {
            started
                .io_routing
                .lock()
                .unwrap()
                .observe_source_state(source_id)
                .ok_or_else(|| CommError::Validation {
                    what: "observeIoState",
                    reason: format!("{source_id} is not a registered local IO source"),
                })
        })
    }

    pub fn observe_io_state_of_actor(&self, actor_id: Uuid) -> CommResult<Subscription<crate::io_routing::IoState>> {
        self.with_started(|started| {
            started
                .io_routing
                .lock()
                .unwrap()
                .observe_actor_state(actor_id)
                .ok_or_else(|| CommError::Validation {
                    what: "observeIoState",
                    reason: format!("{actor_id} is not a registered local IO actor"),
                })
        })
    }

    // -----------------------------------------------------------------
    // Two-way, outbound request / inbound response
    // -----------------------------------------------------------------

    pub fn publish_discover(&self, event: CommEvent) -> CommResult<impl Stream<Item = CommResult<CommEvent>>> {
        let EventData::Discover(discover_data) = event.data.clone() else {
            return Err(CommError::Validation {
                what: "Discover",
                reason: "not a Discover event".into(),
            });
        };
        let correlation_id = event.correlation_id.expect("Discover always carries a correlation id");
        self.with_started(|started| {
            let request_like = event_to_event_like(&event, &started.namespace, None)?;
            let (_, inner) = started.registry.observe_response(request_like, EventLevel::Rsv);
            let decode = move |el: EventLike| -> Option<CommResult<CommEvent>> {
                if el.event_type != EventType::Resolve {
                    return None;
                }
                let EventLikeData::Json(v) = &el.data else { return None };
                let data: ResolveData = match serde_json::from_value(v.clone()) {
                    Ok(d) => d,
                    Err(e) => return Some(Err(CommError::Transport(e.to_string()))),
                };
                if let Err(e) = check_discover_resolve_consistency(&discover_data, &data, correlation_id) {
                    return Some(Err(e));
                }
                let source_id = el.source_id.unwrap_or_else(Uuid::nil);
                Some(CommEvent::resolve(source_id, correlation_id, data))
            };
            Ok(ResponseStream { inner, decode })
        })
    }

    pub fn publish_query(&self, event: CommEvent) -> CommResult<impl Stream<Item = CommResult<CommEvent>>> {
        let EventData::Query(query_data) = event.data.clone() else {
            return Err(CommError::Validation {
                what: "Query",
                reason: "not a Query event".into(),
            });
        };
        let correlation_id = event.correlation_id.expect("Query always carries a correlation id");
        self.with_started(|started| {
            let request_like = event_to_event_like(&event, &started.namespace, None)?;
            let (_, inner) = started.registry.observe_response(request_like, EventLevel::Rtv);
            let decode = move |el: EventLike| -> Option<CommResult<CommEvent>> {
                if el.event_type != EventType::Retrieve {
                    return None;
                }
                let EventLikeData::Json(v) = &el.data else { return None };
                #[derive(serde::Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct RetrieveWire {
                    objects: Vec<CoatyObject>,
                }
                let wire: RetrieveWire = match serde_json::from_value(v.clone()) {
                    Ok(w) => w,
                    Err(e) => return Some(Err(CommError::Transport(e.to_string()))),
                };
                for object in &wire.objects {
                    if !object_matches_types(object, query_data.core_types.as_deref(), query_data.object_types.as_deref()) {
                        return Some(Err(CommError::ResponseMismatch {
                            correlation_id,
                            reason: "Retrieve object does not match Query coreTypes/objectTypes".into(),
                        }));
                    }
                }
                let source_id = el.source_id.unwrap_or_else(Uuid::nil);
                Some(CommEvent::retrieve(source_id, correlation_id, wire.objects))
            };
            Ok(ResponseStream { inner, decode })
        })
    }

    /// Dual-filter publish like [`Self::publish_advertise`]; a single
    /// logical request, published once or twice depending on whether
    /// `object.objectType` is the core type's canonical one, but answered by
    /// exactly one Complete.
    pub fn publish_update(&self, event: CommEvent) -> CommResult<impl Stream<Item = CommResult<CommEvent>>> {
        let EventData::Update(update_data) = event.data.clone() else {
            return Err(CommError::Validation {
                what: "Update",
                reason: "not an Update event".into(),
            });
        };
        let correlation_id = event.correlation_id.expect("Update always carries a correlation id");
        self.with_started(|started| {
            let primary = event_to_event_like(&event, &started.namespace, None)?;
            let mut request_likes = vec![primary];
            if !is_canonical_object_type(&update_data.object.core_type, &update_data.object.object_type) {
                request_likes.push(event_to_event_like(
                    &event,
                    &started.namespace,
                    Some(format!(":{}", update_data.object.object_type)),
                )?);
            }
            let (_, inner) = started.registry.observe_response_multi(request_likes, EventLevel::Cpl);
            let decode = move |el: EventLike| -> Option<CommResult<CommEvent>> {
                if el.event_type != EventType::Complete {
                    return None;
                }
                let EventLikeData::Json(v) = &el.data else { return None };
                #[derive(serde::Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct CompleteWire {
                    object: CoatyObject,
                }
                let wire: CompleteWire = match serde_json::from_value(v.clone()) {
                    Ok(w) => w,
                    Err(e) => return Some(Err(CommError::Transport(e.to_string()))),
                };
                let complete_data = CompleteData {
                    object: wire.object,
                    private_data: None,
                };
                if let Err(e) = check_update_complete_consistency(&update_data, &complete_data, correlation_id) {
                    return Some(Err(e));
                }
                let source_id = el.source_id.unwrap_or_else(Uuid::nil);
                Some(CommEvent::complete(source_id, correlation_id, complete_data.object))
            };
            Ok(ResponseStream { inner, decode })
        })
    }

    pub fn publish_call(&self, event: CommEvent) -> CommResult<impl Stream<Item = CommResult<CommEvent>>> {
        if !matches!(event.data, EventData::Call(_)) {
            return Err(CommError::Validation {
                what: "Call",
                reason: "not a Call event".into(),
            });
        }
        let correlation_id = event.correlation_id.expect("Call always carries a correlation id");
        self.with_started(|started| {
            let request_like = event_to_event_like(&event, &started.namespace, None)?;
            let (_, inner) = started.registry.observe_response(request_like, EventLevel::Rtn);
            let decode = move |el: EventLike| -> Option<CommResult<CommEvent>> {
                if el.event_type != EventType::Return {
                    return None;
                }
                let EventLikeData::Json(v) = &el.data else { return None };
                let data: ReturnData = match serde_json::from_value(v.clone()) {
                    Ok(d) => d,
                    Err(e) => return Some(Err(CommError::Transport(e.to_string()))),
                };
                if let Err(e) = data.validate() {
                    return Some(Err(e));
                }
                let source_id = el.source_id.unwrap_or_else(Uuid::nil);
                Some(CommEvent::ret(source_id, correlation_id, data))
            };
            Ok(ResponseStream { inner, decode })
        })
    }

    // -----------------------------------------------------------------
    // Two-way, inbound request / outbound response
    // -----------------------------------------------------------------

    pub fn observe_discover(&self) -> CommResult<impl Stream<Item = DiscoverRequest>> {
        self.with_started(|started| {
            let key = RequestKey {
                event_type: EventType::Discover,
                filter: None,
            };
            let inner = started.registry.observe_request(key);
            let state = started.clone();
            Ok(RequestStream {
                inner,
                decode: move |el: EventLike| decode_discover_request(&state, el),
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_query(&self) -> CommResult<impl Stream<Item = QueryRequest>> {
        self.with_started(|started| {
            let key = RequestKey {
                event_type: EventType::Query,
                filter: None,
            };
            let inner = started.registry.observe_request(key);
            let state = started.clone();
            Ok(RequestStream {
                inner,
                decode: move |el: EventLike| decode_query_request(&state, el),
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_update_by_core_type(&self, core_type: CoreType) -> CommResult<impl Stream<Item = UpdateRequest>> {
        self.with_started(|started| {
            let inner = subscribe_typed(started, EventType::Update, TypeSelector::CoreType(&core_type));
            let state = started.clone();
            Ok(RequestStream {
                inner,
                decode: move |el: EventLike| decode_update_request(&state, el, None),
                _marker: PhantomData,
            })
        })
    }

    pub fn observe_update_by_object_type(&self, object_type: &str) -> CommResult<impl Stream<Item = UpdateRequest>> {
        let object_type = object_type.to_string();
        self.with_started(|started| {
            let inner = subscribe_typed(started, EventType::Update, TypeSelector::ObjectType(&object_type));
            let guard = canonical_guard(&object_type);
            let state = started.clone();
            Ok(RequestStream {
                inner,
                decode: move |el: EventLike| decode_update_request(&state, el, guard.clone()),
                _marker: PhantomData,
            })
        })
    }

    /// Evaluates `context` against each inbound Call's context filter
    /// (§4.1 scenario 3/4); Calls that fail the filter are never surfaced.
    pub fn observe_call(&self, operation: &str, context: Option<Value>) -> CommResult<impl Stream<Item = CallRequest>> {
        let key = RequestKey {
            event_type: EventType::Call,
            filter: Some(operation.to_string()),
        };
        self.with_started(|started| {
            let inner = started.registry.observe_request(key);
            let state = started.clone();
            Ok(RequestStream {
                inner,
                decode: move |el: EventLike| decode_call_request(&state, el, context.as_ref()),
                _marker: PhantomData,
            })
        })
    }
}

impl Drop for CommunicationManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ---------------------------------------------------------------------
// Inbound request wrapper types (two-way, this agent responds)
// ---------------------------------------------------------------------

/// An inbound Discover request, answered with zero or more Resolve events.
pub struct DiscoverRequest {
    state: Arc<Started>,
    pub source_id: Uuid,
    correlation_id: Uuid,
    pub data: DiscoverData,
}

impl DiscoverRequest {
    pub fn resolve(&self, object: Option<CoatyObject>, related_objects: Option<Vec<CoatyObject>>) -> CommResult<()> {
        let data = ResolveData::new(object, related_objects)?;
        let event = CommEvent::resolve(self.state.identity.object_id(), self.correlation_id, data)?;
        publish_event_like(&self.state, &event, None)
    }
}

/// An inbound Query request, answered with exactly one Retrieve.
pub struct QueryRequest {
    state: Arc<Started>,
    pub source_id: Uuid,
    correlation_id: Uuid,
    pub data: QueryData,
}

impl QueryRequest {
    pub fn retrieve(&self, objects: Vec<CoatyObject>) -> CommResult<()> {
        let event = CommEvent::retrieve(self.state.identity.object_id(), self.correlation_id, objects)?;
        publish_event_like(&self.state, &event, None)
    }
}

/// An inbound Update request, answered with exactly one Complete.
pub struct UpdateRequest {
    state: Arc<Started>,
    pub source_id: Uuid,
    correlation_id: Uuid,
    pub object: CoatyObject,
}

impl UpdateRequest {
    pub fn complete(&self, object: CoatyObject) -> CommResult<()> {
        let event = CommEvent::complete(self.state.identity.object_id(), self.correlation_id, object)?;
        publish_event_like(&self.state, &event, None)
    }
}

/// An inbound Call request that already passed the subscriber's context
/// filter, answered with exactly one Return.
pub struct CallRequest {
    state: Arc<Started>,
    pub source_id: Uuid,
    correlation_id: Uuid,
    pub data: CallData,
}

impl CallRequest {
    pub fn ret(&self, data: ReturnData) -> CommResult<()> {
        let event = CommEvent::ret(self.state.identity.object_id(), self.correlation_id, data)?;
        publish_event_like(&self.state, &event, None)
    }
}

/// An inbound one-way Channel event.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub source_id: Uuid,
    pub channel_id: String,
    pub objects: ChannelObjects,
}

/// An inbound Raw message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: RawPayload,
}

// ---------------------------------------------------------------------
// Decode helpers
// ---------------------------------------------------------------------

fn decode_json<T: for<'de> serde::Deserialize<'de>>(el: EventLike) -> Option<T> {
    let EventLikeData::Json(v) = el.data else { return None };
    serde_json::from_value(v).ok()
}

fn decode_advertise_object(el: EventLike, object_type_guard: Option<String>) -> Option<CoatyObject> {
    let EventLikeData::Json(v) = &el.data else { return None };
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct AdvertiseWire {
        object: CoatyObject,
    }
    let wire: AdvertiseWire = serde_json::from_value(v.clone()).ok()?;
    if let Some(expected) = &object_type_guard {
        if &wire.object.object_type != expected {
            return None;
        }
    }
    Some(wire.object)
}

fn decode_channel(el: EventLike) -> Option<ChannelMessage> {
    let source_id = el.source_id?;
    let filter = el.event_type_filter.clone()?;
    let EventLikeData::Json(v) = &el.data else { return None };
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ChannelWire {
        objects: ChannelObjects,
    }
    let wire: ChannelWire = serde_json::from_value(v.clone()).ok()?;
    Some(ChannelMessage {
        source_id,
        channel_id: filter,
        objects: wire.objects,
    })
}

fn decode_raw(el: EventLike) -> Option<RawMessage> {
    let topic = el.topic.clone()?;
    let payload = match el.data {
        EventLikeData::Raw(p) => p,
        EventLikeData::Json(v) => RawPayload::Text(v.to_string()),
    };
    Some(RawMessage { topic, payload })
}

fn decode_discover_request(state: &Arc<Started>, el: EventLike) -> Option<DiscoverRequest> {
    let source_id = el.source_id?;
    let correlation_id = el.correlation_id?;
    let data: DiscoverData = decode_json(el)?;
    Some(DiscoverRequest {
        state: state.clone(),
        source_id,
        correlation_id,
        data,
    })
}

fn decode_query_request(state: &Arc<Started>, el: EventLike) -> Option<QueryRequest> {
    let source_id = el.source_id?;
    let correlation_id = el.correlation_id?;
    let data: QueryData = decode_json(el)?;
    Some(QueryRequest {
        state: state.clone(),
        source_id,
        correlation_id,
        data,
    })
}

fn decode_update_request(state: &Arc<Started>, el: EventLike, object_type_guard: Option<String>) -> Option<UpdateRequest> {
    let source_id = el.source_id?;
    let correlation_id = el.correlation_id?;
    let data: UpdateData = decode_json(el)?;
    if let Some(expected) = &object_type_guard {
        if &data.object.object_type != expected {
            return None;
        }
    }
    Some(UpdateRequest {
        state: state.clone(),
        source_id,
        correlation_id,
        object: data.object,
    })
}

fn decode_call_request(state: &Arc<Started>, el: EventLike, context: Option<&Value>) -> Option<CallRequest> {
    let source_id = el.source_id?;
    let correlation_id = el.correlation_id?;
    let data: CallData = decode_json(el)?;
    if let Some(filter) = &data.filter {
        let context = context?;
        if !filter.matches(context) {
            return None;
        }
    }
    Some(CallRequest {
        state: state.clone(),
        source_id,
        correlation_id,
        data,
    })
}

// ---------------------------------------------------------------------
// By-core-type / by-object-type subscription helper
// ---------------------------------------------------------------------

enum TypeSelector<'a> {
    CoreType(&'a CoreType),
    ObjectType(&'a str),
}

/// The canonical `objectType` for the core types this crate advertises
/// itself (§4.1's dual-filter rule): `Advertise`/`Update` skip the second,
/// `:objectType`-qualified publish when the object's type already is this.
fn canonical_object_type(core_type: &CoreType) -> Option<&'static str> {
    match core_type {
        CoreType::Identity => Some("coaty.Identity"),
        CoreType::IoNode => Some("coaty.IoNode"),
        CoreType::IoSource => Some("coaty.IoSource"),
        CoreType::IoActor => Some("coaty.IoActor"),
        CoreType::IoContext => Some("coaty.IoContext"),
        CoreType::CoatyObject | CoreType::Custom(_) => None,
    }
}

fn is_canonical_object_type(core_type: &CoreType, object_type: &str) -> bool {
    canonical_object_type(core_type) == Some(object_type)
}

fn known_core_type_for_canonical_object_type(object_type: &str) -> Option<CoreType> {
    match object_type {
        "coaty.Identity" => Some(CoreType::Identity),
        "coaty.IoNode" => Some(CoreType::IoNode),
        "coaty.IoSource" => Some(CoreType::IoSource),
        "coaty.IoActor" => Some(CoreType::IoActor),
        "coaty.IoContext" => Some(CoreType::IoContext),
        _ => None,
    }
}

/// When `object_type` names one of the well-known core types, subscribing
/// by core type and filtering client-side avoids a second Binding
/// subscription (§4.5's observe-by-object-type optimization); the guard is
/// the object type the decode closure must still check for.
fn canonical_guard(object_type: &str) -> Option<String> {
    match known_core_type_for_canonical_object_type(object_type) {
        Some(_) => Some(object_type.to_string()),
        None => None,
    }
}

fn subscribe_typed(started: &Arc<Started>, event_type: EventType, by: TypeSelector<'_>) -> Subscription<EventLike> {
    let filter = match by {
        TypeSelector::CoreType(ct) => ct.as_str().to_string(),
        TypeSelector::ObjectType(ot) => match known_core_type_for_canonical_object_type(ot) {
            Some(ct) => ct.as_str().to_string(),
            None => format!(":{ot}"),
        },
    };
    let key = RequestKey {
        event_type,
        filter: Some(filter),
    };
    started.registry.observe_request(key)
}

// ---------------------------------------------------------------------
// Outbound encoding
// ---------------------------------------------------------------------

fn event_to_event_like(event: &CommEvent, namespace: &str, filter_override: Option<String>) -> CommResult<EventLike> {
    match &event.data {
        EventData::Raw(raw) => {
            return Ok(EventLike {
                event_type: EventType::Raw,
                event_type_filter: None,
                source_id: Some(event.source_id),
                correlation_id: None,
                topic: Some(raw.topic.clone()),
                is_data_raw: true,
                data: EventLikeData::Raw(raw.payload.clone()),
                options: raw.options.clone(),
            });
        }
        EventData::IoValue(iov) => {
            let topic = Topic::new(namespace, EventLevel::Iov, None, Subject::Route(iov.route.clone()), None)?.encode();
            return Ok(EventLike {
                event_type: EventType::IoValue,
                event_type_filter: None,
                source_id: Some(event.source_id),
                correlation_id: None,
                topic: Some(topic),
                is_data_raw: matches!(iov.payload, RawPayload::Bytes(_)),
                data: EventLikeData::Raw(iov.payload.clone()),
                options: None,
            });
        }
        _ => {}
    }
    let event_type = event.event_type();
    let level = event_type
        .event_level()
        .expect("non-Raw/IoValue events always map to an event level");
    let filter = filter_override.or_else(|| event.event_type_filter());
    let topic = Topic::new(namespace, level, filter.clone(), Subject::Agent(event.source_id), event.correlation_id)?.encode();
    let value = event_data_to_json(&event.data)?;
    Ok(EventLike {
        event_type,
        event_type_filter: filter,
        source_id: Some(event.source_id),
        correlation_id: event.correlation_id,
        topic: Some(topic),
        is_data_raw: false,
        data: EventLikeData::Json(value),
        options: None,
    })
}

fn event_data_to_json(data: &EventData) -> CommResult<Value> {
    let result = match data {
        EventData::Advertise(d) => serde_json::to_value(d),
        EventData::Deadvertise(d) => serde_json::to_value(d),
        EventData::Channel(d) => serde_json::to_value(d),
        EventData::Associate(d) => serde_json::to_value(d),
        EventData::Discover(d) => serde_json::to_value(d),
        EventData::Resolve(d) => serde_json::to_value(d),
        EventData::Query(d) => serde_json::to_value(d),
        EventData::Retrieve(d) => serde_json::to_value(d),
        EventData::Update(d) => serde_json::to_value(d),
        EventData::Complete(d) => serde_json::to_value(d),
        EventData::Call(d) => serde_json::to_value(d),
        EventData::Return(d) => serde_json::to_value(d),
        EventData::Raw(_) | EventData::IoValue(_) => unreachable!("handled by the caller before reaching here"),
    };
    result.map_err(|e| CommError::Transport(e.to_string()))
}

fn publish_event_like(started: &Arc<Started>, event: &CommEvent, filter_override: Option<String>) -> CommResult<()> {
    let event_like = event_to_event_like(event, &started.namespace, filter_override)?;
    started.binding.lock().unwrap().publish(&event_like)
}

// ---------------------------------------------------------------------
// Stream adapters
// ---------------------------------------------------------------------

/// Filters and decodes a raw [`Subscription<EventLike>`] into application
/// items, silently dropping anything the closure rejects (a protocol
/// mismatch, or -- for Call -- a context filter miss).
struct RequestStream<T, F> {
    inner: Subscription<EventLike>,
    decode: F,
    _marker: PhantomData<T>,
}

// `PhantomData<T>` never actually stores a `T`, so pinning this struct never
// needs to pin-project into one; manual impl sidesteps the auto-trait rule
// that would otherwise require `T: Unpin`.
impl<T, F> Unpin for RequestStream<T, F> {}

impl<T, F> Stream for RequestStream<T, F>
where
    F: FnMut(EventLike) -> Option<T> + Unpin,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if let Some(value) = (this.decode)(item) {
                        return Poll::Ready(Some(value));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Like [`RequestStream`], but for two-way responses: a decode failure that
/// means "wrong event kind, keep waiting" yields `None` and the loop
/// continues, while a decode failure that means "this is the response but
/// it's invalid" surfaces as `Some(Err(..))` to the caller (§4.1, §7).
struct ResponseStream<F> {
    inner: Subscription<EventLike>,
    decode: F,
}

impl<F> Unpin for ResponseStream<F> {}

impl<F> Stream for ResponseStream<F>
where
    F: FnMut(EventLike) -> Option<CommResult<CommEvent>> + Unpin,
{
    type Item = CommResult<CommEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if let Some(result) = (this.decode)(item) {
                        return Poll::Ready(Some(result));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ---------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------

fn run_dispatcher(
    started: Arc<Started>,
    mut events_sub: Subscription<BindingEvent>,
    comm_state: Arc<BehaviorMulticast<CommunicationState>>,
) {
    let mut last_state: Option<CommunicationState> = None;
    loop {
        match block_on(events_sub.next()) {
            Some(BindingEvent::CommunicationState(state)) => {
                if last_state != Some(state) {
                    last_state = Some(state);
                    comm_state.emit(state);
                }
            }
            Some(BindingEvent::Inbound(event_like)) => dispatch_inbound_event(&started, event_like),
            Some(BindingEvent::Debug(msg)) => log::debug!("{msg}"),
            Some(BindingEvent::Info(msg)) => log::info!("{msg}"),
            Some(BindingEvent::Error(msg)) => log::error!("binding error: {msg}"),
            None => break,
        }
    }
}

fn dispatch_inbound_event(started: &Arc<Started>, event_like: EventLike) {
    match event_like.event_type {
        EventType::Raw => {
            if let Some(topic) = event_like.topic.clone() {
                let key = RequestKey {
                    event_type: EventType::Raw,
                    filter: Some(topic),
                };
                started.registry.dispatch_request(&key, event_like);
            }
        }
        EventType::IoValue => {
            if let Some(topic) = &event_like.topic {
                if let Ok(decoded) = Topic::decode(topic) {
                    if let Subject::Route(route) = decoded.subject {
                        let payload = match event_like.data {
                            EventLikeData::Raw(p) => p,
                            EventLikeData::Json(v) => RawPayload::Text(v.to_string()),
                        };
                        started.io_routing.lock().unwrap().deliver(&route, payload);
                    }
                }
            }
        }
        EventType::Associate => {
            if let EventLikeData::Json(v) = &event_like.data {
                if let Ok(data) = serde_json::from_value::<AssociateData>(v.clone()) {
                    let effect = started.io_routing.lock().unwrap().apply_associate(&data);
                    if let Some(effect) = effect {
                        if let Some((route, change)) = effect.route_change {
                            apply_route_subscription_change(started, &route, change);
                        }
                    }
                }
            }
            if let Some(filter) = event_like.event_type_filter.clone() {
                let key = RequestKey {
                    event_type: EventType::Associate,
                    filter: Some(filter),
                };
                started.registry.dispatch_request(&key, event_like);
            }
        }
        EventType::Discover => {
            if let EventLikeData::Json(v) = &event_like.data {
                if let Ok(data) = serde_json::from_value::<DiscoverData>(v.clone()) {
                    handle_system_discover(started, &event_like, &data);
                }
            }
            let key = RequestKey {
                event_type: EventType::Discover,
                filter: None,
            };
            started.registry.dispatch_request(&key, event_like);
        }
        EventType::Query => {
            let key = RequestKey {
                event_type: EventType::Query,
                filter: None,
            };
            started.registry.dispatch_request(&key, event_like);
        }
        EventType::Advertise | EventType::Deadvertise | EventType::Channel | EventType::Update | EventType::Call => {
            let key = RequestKey {
                event_type: event_like.event_type,
                filter: event_like.event_type_filter.clone(),
            };
            started.registry.dispatch_request(&key, event_like);
        }
        EventType::Resolve | EventType::Retrieve | EventType::Complete | EventType::Return => {
            if let Some(correlation_id) = event_like.correlation_id {
                if let Err(e) = started.registry.dispatch_response(correlation_id, event_like) {
                    log::debug!("{e}");
                }
            }
        }
    }
}

fn apply_route_subscription_change(started: &Arc<Started>, route: &str, change: crate::io_routing::RouteSubscriptionChange) {
    use crate::io_routing::RouteSubscriptionChange::*;
    let filter = TopicFilter::for_route(&started.namespace, route);
    let mut binding = started.binding.lock().unwrap();
    let result = match change {
        Subscribe => binding.subscribe(&filter),
        Unsubscribe => binding.unsubscribe(&filter),
    };
    if let Err(e) = result {
        log::error!("failed to apply route subscription change for {route:?}: {e}");
    }
}

fn handle_system_discover(started: &Arc<Started>, event_like: &EventLike, data: &DiscoverData) {
    let Some(correlation_id) = event_like.correlation_id else {
        return;
    };
    let Ok(mode) = data.mode() else {
        return;
    };
    let identity = &started.identity.0;
    let matches_identity = match mode {
        crate::event::DiscoverMode::ById => data.object_id == Some(identity.object_id),
        crate::event::DiscoverMode::ByExternalId => {
            identity.external_id.is_some() && data.external_id == identity.external_id
        }
        crate::event::DiscoverMode::ByBoth => {
            data.object_id == Some(identity.object_id)
                && identity.external_id.is_some()
                && data.external_id == identity.external_id
        }
        crate::event::DiscoverMode::ByType => core_types_contain(data, "Identity"),
    };
    if matches_identity {
        respond_resolve(started, correlation_id, identity.clone());
    }

    if mode == crate::event::DiscoverMode::ByType && core_types_contain(data, "IoNode") {
        for node in &started.io_nodes {
            respond_resolve(started, correlation_id, node.object.clone());
        }
    }
}

fn core_types_contain(data: &DiscoverData, name: &str) -> bool {
    data.core_types.as_deref().map(|cts| cts.iter().any(|ct| ct == name)).unwrap_or(false)
}

fn respond_resolve(started: &Arc<Started>, correlation_id: Uuid, object: CoatyObject) {
    match ResolveData::new(Some(object), None).and_then(|data| CommEvent::resolve(started.identity.object_id(), correlation_id, data)) {
        Ok(event) => {
            if let Err(e) = publish_event_like(started, &event, None) {
                log::error!("failed to publish system Resolve: {e}");
            }
        }
        Err(e) => log::error!("failed to build system Resolve: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{FakeBinding, FakeBroker};
    use crate::config::{CommonOptions, IoContextNodeConfig};
    use crate::event::{CallParameters, ChannelObjects, ContextFilter};
    use crate::io_routing::IoState;
    use crate::object::{IoActor, IoSource};
    use futures::FutureExt;

    fn manager_with_binding(agent_name: &str, broker: &FakeBroker, options: CommunicationOptions) -> CommunicationManager {
        let manager = CommunicationManager::new(agent_name, CommunicationOptions::default());
        let binding: Box<dyn Binding> = Box::new(FakeBinding::new(broker.clone()));
        manager.start_with_binding(binding, Some(options)).unwrap();
        manager
    }

    // Scenario 1 (SPEC_FULL §8): Agent B observes Advertise by object type,
    // Agent A advertises, B receives exactly one matching event.
    #[test]
    fn scenario_advertise_observe_by_object_type() {
        let broker = FakeBroker::new();
        let a = manager_with_binding("agent-a", &broker, CommunicationOptions::new());
        let b = manager_with_binding("agent-b", &broker, CommunicationOptions::new());

        let mut sub = b.observe_advertise_by_object_type("user.Sensor").unwrap();

        let object = CoatyObject::new("user.Sensor", CoreType::CoatyObject, "sensor-1").unwrap();
        let object_id = object.object_id;
        let source_id = a.identity().unwrap().object_id;
        a.publish_advertise(CommEvent::advertise(source_id, object).unwrap()).unwrap();

        let received = block_on(sub.next()).unwrap();
        assert_eq!(received.object_id, object_id);
    }

    // Scenario 2: Discover by id round trip -- A discovers B's Identity by
    // objectId, B's always-on system Discover observer resolves it, A's
    // stream yields exactly that Resolve.
    #[test]
    fn scenario_discover_by_id_round_trip() {
        let broker = FakeBroker::new();
        let a = manager_with_binding("agent-a", &broker, CommunicationOptions::new());
        let b = manager_with_binding("agent-b", &broker, CommunicationOptions::new());

        let b_identity_id = b.identity().unwrap().object_id;
        let a_identity_id = a.identity().unwrap().object_id;

        let discover = CommEvent::discover(a_identity_id, DiscoverData::by_id(b_identity_id)).unwrap();
        let mut stream = a.publish_discover(discover).unwrap();

        let resolved = block_on(stream.next()).unwrap().unwrap();
        let EventData::Resolve(data) = resolved.data else {
            panic!("expected a Resolve event");
        };
        assert_eq!(data.object.unwrap().object_id, b_identity_id);
    }

    // Scenario 3: Call with a matching context filter is delivered and
    // answered.
    #[test]
    fn scenario_call_with_matching_context_filter_is_delivered() {
        let broker = FakeBroker::new();
        let caller = manager_with_binding("caller", &broker, CommunicationOptions::new());
        let callee = manager_with_binding("callee", &broker, CommunicationOptions::new());

        let context = serde_json::json!({"floor": 7});
        let mut calls = callee.observe_call("climate.setTemperature", Some(context)).unwrap();

        let mut call_data = CallData::new("climate.setTemperature", CallParameters::None).unwrap();
        call_data.filter = Some(ContextFilter::Eq("floor".into(), serde_json::json!(7)));
        let caller_id = caller.identity().unwrap().object_id;
        let mut responses = caller.publish_call(CommEvent::call(caller_id, call_data).unwrap()).unwrap();

        let request = block_on(calls.next()).unwrap();
        request.ret(ReturnData::result(serde_json::json!({"ok": true}))).unwrap();

        let ret = block_on(responses.next()).unwrap().unwrap();
        let EventData::Return(data) = ret.data else {
            panic!("expected a Return event");
        };
        assert_eq!(data.result, Some(serde_json::json!({"ok": true})));
    }

    // Scenario 4: same Call, but the observer's context fails the filter --
    // it must never see the request, and the caller's stream stays empty.
    #[test]
    fn scenario_call_with_non_matching_context_filter_is_not_delivered() {
        let broker = FakeBroker::new();
        let caller = manager_with_binding("caller", &broker, CommunicationOptions::new());
        let callee = manager_with_binding("callee", &broker, CommunicationOptions::new());

        let context = serde_json::json!({"floor": 3});
        let mut calls = callee.observe_call("climate.setTemperature", Some(context)).unwrap();
        let mut sync = callee.observe_channel("sync").unwrap();

        let mut call_data = CallData::new("climate.setTemperature", CallParameters::None).unwrap();
        call_data.filter = Some(ContextFilter::Eq("floor".into(), serde_json::json!(7)));
        let caller_id = caller.identity().unwrap().object_id;
        let mut responses = caller.publish_call(CommEvent::call(caller_id, call_data).unwrap()).unwrap();

        let marker = CoatyObject::new("user.Marker", CoreType::CoatyObject, "marker").unwrap();
        caller
            .publish_channel(CommEvent::channel(caller_id, "sync", ChannelObjects::One(marker)).unwrap())
            .unwrap();
        block_on(sync.next()).unwrap();

        assert!(calls.next().now_or_never().is_none());
        assert!(responses.next().now_or_never().is_none());
    }

    // Scenario 5: a local IoNode holds source S, a remote IoNode holds actor
    // A; a router publishes Associate(S, A, route, updateRate); both agents'
    // IO-state observers move to Associated and the value reaches the actor.
    #[test]
    fn scenario_io_association_local_source_remote_actor() {
        let broker = FakeBroker::new();

        let source_object = CoatyObject::new("user.Sensor", CoreType::IoSource, "sensor-1").unwrap();
        let source_id = source_object.object_id;
        let io_source = IoSource {
            object: source_object,
            value_type: "temperature".into(),
            external_route: None,
        };
        let mut source_node = IoContextNodeConfig::default();
        source_node.io_sources = vec![io_source];
        let mut a_common = CommonOptions::default();
        a_common.io_context_nodes.insert("ctx1".into(), source_node);
        let mut a_options = CommunicationOptions::new();
        a_options.common = a_common;
        let a = manager_with_binding("agent-a", &broker, a_options);

        let actor_object = CoatyObject::new("user.Display", CoreType::IoActor, "display-1").unwrap();
        let actor_id = actor_object.object_id;
        let io_actor = IoActor {
            object: actor_object,
            value_type: "temperature".into(),
            use_raw_io_values: false,
        };
        let mut actor_node = IoContextNodeConfig::default();
        actor_node.io_actors = vec![io_actor];
        let mut b_common = CommonOptions::default();
        b_common.io_context_nodes.insert("ctx1".into(), actor_node);
        let mut b_options = CommunicationOptions::new();
        b_options.common = b_common;
        let b = manager_with_binding("agent-b", &broker, b_options);

        let mut source_state = a.observe_io_state_of_source(source_id).unwrap();
        let mut actor_state = b.observe_io_state_of_actor(actor_id).unwrap();
        let mut values = b.observe_io_value(actor_id).unwrap();

        assert!(matches!(block_on(source_state.next()).unwrap(), IoState::Disassociated));
        assert!(matches!(block_on(actor_state.next()).unwrap(), IoState::Disassociated));

        let router_id = Uuid::new_v4();
        let associate = AssociateData {
            io_source_id: source_id,
            io_actor_id: actor_id,
            associating_route: Some("r1".into()),
            update_rate: Some(100),
            is_external_route: false,
        };
        let topic = Topic::new("-", EventLevel::Asc, Some("ctx1".to_string()), Subject::Agent(router_id), None)
            .unwrap()
            .encode();
        let associate_event = EventLike {
            event_type: EventType::Associate,
            event_type_filter: Some("ctx1".to_string()),
            source_id: Some(router_id),
            correlation_id: None,
            topic: Some(topic),
            is_data_raw: false,
            data: EventLikeData::Json(serde_json::to_value(&associate).unwrap()),
            options: None,
        };
        let mut router = FakeBinding::new(broker.clone());
        router.publish(&associate_event).unwrap();

        match block_on(source_state.next()).unwrap() {
            IoState::Associated { update_rate } => assert_eq!(update_rate, Some(100)),
            IoState::Disassociated => panic!("expected the source to become associated"),
        }
        assert!(matches!(block_on(actor_state.next()).unwrap(), IoState::Associated { .. }));

        a.publish_io_value(source_id, RawPayload::Text("21.5".into())).unwrap();
        let delivered = block_on(values.next()).unwrap();
        assert_eq!(delivered, RawPayload::Text("21.5".into()));
    }

    // Scenario 6: Agent A disappears without calling `unjoin`; the broker
    // delivers its last-will Deadvertise, which Agent B observes.
    #[test]
    fn scenario_last_will_triggers_deadvertise_on_crash() {
        let broker = FakeBroker::new();
        let a = manager_with_binding("agent-a", &broker, CommunicationOptions::new());
        let b = manager_with_binding("agent-b", &broker, CommunicationOptions::new());

        let a_identity_id = a.identity().unwrap().object_id;
        let mut deadvertised = b.observe_deadvertise().unwrap();

        let last_will_comm = CommEvent::deadvertise(a_identity_id, vec![a_identity_id]).unwrap();
        let last_will_like = event_to_event_like(&last_will_comm, "-", None).unwrap();
        broker.simulate_crash(a_identity_id, last_will_like);

        let data = block_on(deadvertised.next()).unwrap();
        assert_eq!(data.object_ids, vec![a_identity_id]);
    }
}
