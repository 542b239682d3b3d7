//! IO routing core (`SPEC_FULL.md` §4.6): the source table, the actor
//! table, Associate classification, and IO-state behavior-subject
//! notifications.
//!
//! An IO source (e.g. a sensor) publishes values without knowing who
//! consumes them; an IO actor (e.g. a dashboard) observes values without
//! knowing who produces them. A router external to this crate pairs a
//! source and an actor on a shared route and tells each side about the
//! pairing via an Associate event. This module keeps the two sides of that
//! pairing consistent for the local agent and turns Associate events into
//! local subscription/publication state changes.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::event::{AssociateData, RawPayload};
use crate::observable::{BehaviorMulticast, Multicast, Subscription};

/// A local IO source's current routing, as seen by this agent: which route
/// (if any) it publishes on, which locally-known actors are currently fed
/// by it, and its last-announced update rate.
#[derive(Debug, Clone, Default)]
struct SourceRow {
    route: Option<String>,
    actors: HashSet<Uuid>,
    update_rate: Option<u32>,
}

/// Whether a local source or actor currently has at least one active
/// association (§3 IO-state, §4.6, P8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Associated { update_rate: Option<u32> },
    Disassociated,
}

/// A routing change the caller (the Manager) must apply to the Binding:
/// subscribe to or unsubscribe from an IoValue route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSubscriptionChange {
    Subscribe,
    Unsubscribe,
}

/// The outcome of classifying one Associate event against this agent's
/// local IO source/actor tables (§4.6).
#[derive(Debug, Clone, Default)]
pub struct AssociateEffect {
    pub was_local_source: bool,
    pub was_local_actor: bool,
    pub route_change: Option<(String, RouteSubscriptionChange)>,
}

impl AssociateEffect {
    fn is_local(&self) -> bool {
        self.was_local_source || self.was_local_actor
    }
}

/// Tracks this agent's IO sources and actors and reacts to inbound
/// Associate events. Owned by the Manager; one instance per joined
/// session (§4.6).
pub struct IoRoutingTable {
    local_sources: HashSet<Uuid>,
    local_actors: HashMap<Uuid, bool>, // actor id -> useRawIoValues
    sources: HashMap<Uuid, SourceRow>,
    // route -> actor id -> set of source ids feeding the actor on that route
    actor_table: HashMap<String, HashMap<Uuid, HashSet<Uuid>>>,
    source_states: HashMap<Uuid, BehaviorMulticast<IoState>>,
    actor_states: HashMap<Uuid, BehaviorMulticast<IoState>>,
    value_sinks: HashMap<Uuid, Multicast<RawPayload>>,
}

impl Default for IoRoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IoRoutingTable {
    pub fn new() -> Self {
        IoRoutingTable {
            local_sources: HashSet::new(),
            local_actors: HashMap::new(),
            sources: HashMap::new(),
            actor_table: HashMap::new(),
            source_states: HashMap::new(),
            actor_states: HashMap::new(),
            value_sinks: HashMap::new(),
        }
    }

    /// Registers a local IO source (from the agent's own IoNodes) so this
    /// table will react to Associate events naming it.
    pub fn register_local_source(&mut self, source_id: Uuid) {
        self.local_sources.insert(source_id);
        self.source_states.entry(source_id).or_insert_with(BehaviorMulticast::new);
        self.emit_source_state(source_id);
    }

    pub fn register_local_actor(&mut self, actor_id: Uuid, use_raw_io_values: bool) {
        self.local_actors.insert(actor_id, use_raw_io_values);
        self.actor_states.entry(actor_id).or_insert_with(BehaviorMulticast::new);
        self.value_sinks.entry(actor_id).or_insert_with(Multicast::new);
        self.emit_actor_state(actor_id);
    }

    /// Fans `payload` out to every local actor currently fed by `route`
    /// (§4.6's IoValue dispatch). Actors with no subscriber simply drop it,
    /// the same as an unobserved `Multicast` would.
    pub fn deliver(&self, route: &str, payload: RawPayload) {
        for actor_id in self.actors_for_route(route) {
            if let Some(sink) = self.value_sinks.get(&actor_id) {
                sink.emit(payload.clone());
            }
        }
    }

    /// Observes the values delivered to a local IO actor over its currently
    /// (and future) associated routes.
    pub fn observe_actor_value(&self, actor_id: Uuid) -> Option<Subscription<RawPayload>> {
        self.value_sinks.get(&actor_id).map(|m| m.subscribe(|| {}, || {}))
    }

    pub fn is_local_source(&self, source_id: Uuid) -> bool {
        self.local_sources.contains(&source_id)
    }

    pub fn is_local_actor(&self, actor_id: Uuid) -> bool {
        self.local_actors.contains_key(&actor_id)
    }

    pub fn uses_raw_io_values(&self, actor_id: Uuid) -> bool {
        self.local_actors.get(&actor_id).copied().unwrap_or(false)
    }

    /// The route this source should currently publish `IoValue`s on, or
    /// `None` if unassociated.
    pub fn route_for_source(&self, source_id: Uuid) -> Option<String> {
        self.sources.get(&source_id).and_then(|row| row.route.clone())
    }

    /// All actor ids fed by route `route`, for IoValue dispatch.
    pub fn actors_for_route(&self, route: &str) -> Vec<Uuid> {
        self.actor_table
            .get(route)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn observe_source_state(&mut self, source_id: Uuid) -> Option<crate::observable::Subscription<IoState>> {
        self.source_states.get(&source_id).map(|bm| bm.subscribe())
    }

    pub fn observe_actor_state(&mut self, actor_id: Uuid) -> Option<crate::observable::Subscription<IoState>> {
        self.actor_states.get(&actor_id).map(|bm| bm.subscribe())
    }

    /// Classifies and applies an inbound Associate event (§4.6). Returns
    /// `None` if neither endpoint is local, otherwise the routing changes
    /// the caller must apply to the Binding.
    pub fn apply_associate(&mut self, data: &AssociateData) -> Option<AssociateEffect> {
        let is_local_source = self.local_sources.contains(&data.io_source_id);
        let is_local_actor = self.local_actors.contains_key(&data.io_actor_id);
        if !is_local_source && !is_local_actor {
            return None;
        }

        let mut effect = AssociateEffect {
            was_local_source: is_local_source,
            was_local_actor: is_local_actor,
            route_change: None,
        };

        if is_local_source {
            self.apply_local_source_update(data);
        }
        if is_local_actor {
            effect.route_change = self.apply_local_actor_update(data);
        }

        if effect.is_local() {
            if is_local_source {
                self.emit_source_state(data.io_source_id);
            }
            if is_local_actor {
                self.emit_actor_state(data.io_actor_id);
            }
        }
        Some(effect)
    }

    fn apply_local_source_update(&mut self, data: &AssociateData) {
        let source_id = data.io_source_id;
        let row = self.sources.entry(source_id).or_default();
        match &data.associating_route {
            Some(new_route) => {
                if let Some(old_route) = row.route.clone() {
                    if old_route != *new_route {
                        self.disassociate_actors_of_source(source_id, &old_route);
                        self.sources.entry(source_id).or_default().actors.clear();
                    }
                }
                let row = self.sources.entry(source_id).or_default();
                row.route = Some(new_route.clone());
                row.update_rate = data.update_rate;
                row.actors.insert(data.io_actor_id);
            }
            None => {
                let row = self.sources.entry(source_id).or_default();
                row.actors.remove(&data.io_actor_id);
                if row.actors.is_empty() {
                    self.sources.remove(&source_id);
                }
            }
        }
    }

    fn disassociate_actors_of_source(&mut self, source_id: Uuid, route: &str) {
        if let Some(actor_map) = self.actor_table.get_mut(route) {
            actor_map.retain(|_, sources| {
                sources.remove(&source_id);
                !sources.is_empty()
            });
            if actor_map.is_empty() {
                self.actor_table.remove(route);
            }
        }
    }

    fn apply_local_actor_update(&mut self, data: &AssociateData) -> Option<(String, RouteSubscriptionChange)> {
        let actor_id = data.io_actor_id;
        let source_id = data.io_source_id;
        match &data.associating_route {
            Some(route) => {
                let entry = self.actor_table.entry(route.clone()).or_default();
                let route_was_empty = entry.is_empty();
                entry.entry(actor_id).or_default().insert(source_id);
                if let Some(source_row) = self.sources.get_mut(&source_id) {
                    source_row.actors.insert(actor_id);
                }
                if route_was_empty {
                    Some((route.clone(), RouteSubscriptionChange::Subscribe))
                } else {
                    None
                }
            }
            None => {
                let mut emptied_route = None;
                for (route, actor_map) in self.actor_table.iter_mut() {
                    if let Some(sources) = actor_map.get_mut(&actor_id) {
                        sources.remove(&source_id);
                        if sources.is_empty() {
                            actor_map.remove(&actor_id);
                        }
                        if actor_map.is_empty() {
                            emptied_route = Some(route.clone());
                        }
                        break;
                    }
                }
                if let Some(route) = &emptied_route {
                    self.actor_table.remove(route);
                }
                if let Some(source_row) = self.sources.get_mut(&source_id) {
                    source_row.actors.remove(&actor_id);
                }
                emptied_route.map(|route| (route, RouteSubscriptionChange::Unsubscribe))
            }
        }
    }

    fn emit_source_state(&self, source_id: Uuid) {
        if let Some(bm) = self.source_states.get(&source_id) {
            let state = match self.sources.get(&source_id) {
                Some(row) if !row.actors.is_empty() => IoState::Associated {
                    update_rate: row.update_rate,
                },
                _ => IoState::Disassociated,
            };
            bm.emit(state);
        }
    }

    fn emit_actor_state(&self, actor_id: Uuid) {
        if let Some(bm) = self.actor_states.get(&actor_id) {
            let has_sources = self
                .actor_table
                .values()
                .any(|actor_map| actor_map.get(&actor_id).is_some_and(|sources| !sources.is_empty()));
            let state = if has_sources {
                IoState::Associated { update_rate: None }
            } else {
                IoState::Disassociated
            };
            bm.emit(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn associate(source_id: Uuid, actor_id: Uuid, route: Option<&str>) -> AssociateData {
        AssociateData {
            io_source_id: source_id,
            io_actor_id: actor_id,
            associating_route: route.map(|s| s.to_string()),
            update_rate: None,
            is_external_route: false,
        }
    }

    #[test]
    fn associate_for_unregistered_ids_is_ignored() {
        let mut table = IoRoutingTable::new();
        let effect = table.apply_associate(&associate(Uuid::new_v4(), Uuid::new_v4(), Some("x")));
        assert!(effect.is_none());
    }

    #[test]
    fn first_actor_on_a_route_triggers_subscribe() {
        let mut table = IoRoutingTable::new();
        let source_id = Uuid::new_v4();
        let actor_id = Uuid::new_v4();
        table.register_local_source(source_id);
        table.register_local_actor(actor_id, false);
        let effect = table
            .apply_associate(&associate(source_id, actor_id, Some("sensors/temp")))
            .unwrap();
        assert_eq!(table.route_for_source(source_id), Some("sensors/temp".to_string()));
        assert_eq!(
            effect.route_change,
            Some(("sensors/temp".to_string(), RouteSubscriptionChange::Subscribe))
        );
        assert_eq!(table.actors_for_route("sensors/temp"), vec![actor_id]);
    }

    #[test]
    fn second_actor_on_same_route_does_not_resubscribe() {
        let mut table = IoRoutingTable::new();
        let source_id = Uuid::new_v4();
        let actor_a = Uuid::new_v4();
        let actor_b = Uuid::new_v4();
        table.register_local_source(source_id);
        table.register_local_actor(actor_a, false);
        table.register_local_actor(actor_b, false);
        table.apply_associate(&associate(source_id, actor_a, Some("sensors/temp")));
        let effect = table
            .apply_associate(&associate(source_id, actor_b, Some("sensors/temp")))
            .unwrap();
        assert_eq!(effect.route_change, None);
        let mut actors = table.actors_for_route("sensors/temp");
        actors.sort();
        let mut expected = vec![actor_a, actor_b];
        expected.sort();
        assert_eq!(actors, expected);
    }

    #[test]
    fn route_change_disassociates_previous_actors() {
        let mut table = IoRoutingTable::new();
        let source_id = Uuid::new_v4();
        let actor_id = Uuid::new_v4();
        table.register_local_source(source_id);
        table.register_local_actor(actor_id, false);
        table.apply_associate(&associate(source_id, actor_id, Some("old/route")));
        assert_eq!(table.actors_for_route("old/route"), vec![actor_id]);
        table.apply_associate(&associate(source_id, Uuid::new_v4(), Some("new/route")));
        assert!(table.actors_for_route("old/route").is_empty());
        assert_eq!(table.route_for_source(source_id), Some("new/route".to_string()));
    }

    #[test]
    fn last_actor_leaving_route_triggers_unsubscribe() {
        let mut table = IoRoutingTable::new();
        let source_id = Uuid::new_v4();
        let actor_id = Uuid::new_v4();
        table.register_local_source(source_id);
        table.register_local_actor(actor_id, false);
        table.apply_associate(&associate(source_id, actor_id, Some("sensors/temp")));
        let effect = table
            .apply_associate(&associate(source_id, actor_id, None))
            .unwrap();
        assert_eq!(
            effect.route_change,
            Some(("sensors/temp".to_string(), RouteSubscriptionChange::Unsubscribe))
        );
        assert!(table.actors_for_route("sensors/temp").is_empty());
    }
}
