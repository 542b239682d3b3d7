//! A decentralized, broker-mediated communication runtime for agent-style
//! IoT containers (`SPEC_FULL.md`): a typed, topic-agnostic event model
//! (§3, §4.1) carried over a `coaty/` MQTT topic grammar (§4.2) through a
//! swappable [`binding::Binding`] (§4.3), multiplexed by a
//! reference-counted [`registry::SubscriptionRegistry`] (§4.4) and exposed
//! through one [`manager::CommunicationManager`] per joined session (§4.5).
//!
//! Grounded on the reference DDS crate's layering: a wire-level codec
//! module, a participant-owned background I/O thread, and a single
//! high-level facade type agents actually construct and hold.

pub mod binding;
pub mod config;
pub mod error;
pub mod event;
pub mod io_routing;
pub mod manager;
pub mod object;
pub mod observable;
pub mod registry;
pub mod topic;

pub use binding::{Binding, BindingEvent, BindingState, CommunicationState, EventLike, EventLikeData, JoinOptions};
pub use config::{BindingDescriptor, CommunicationOptions};
pub use error::{CommError, CommResult};
pub use event::{CommEvent, EventData, EventType};
pub use manager::{
    CallRequest, ChannelMessage, CommunicationManager, DiscoverRequest, OperatingState, QueryRequest, RawMessage,
    UpdateRequest,
};
pub use object::{CoatyObject, CoreType, Identity, IoActor, IoNode, IoSource};
