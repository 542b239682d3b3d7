//! The 11 event variants and their self-validating data records
//! (`SPEC_FULL.md` §4.1).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CommError, CommResult};
use crate::object::{CoatyObject, CoreType};
use crate::topic::{is_valid_event_filter, EventLevel};

/// Tag identifying which of the 11 patterns an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Advertise,
    Deadvertise,
    Channel,
    Associate,
    IoValue,
    Raw,
    Discover,
    Resolve,
    Query,
    Retrieve,
    Update,
    Complete,
    Call,
    Return,
}

impl EventType {
    pub fn is_one_way(self) -> bool {
        !matches!(
            self,
            EventType::Discover
                | EventType::Resolve
                | EventType::Query
                | EventType::Retrieve
                | EventType::Update
                | EventType::Complete
                | EventType::Call
                | EventType::Return
        )
    }

    /// The wire-level event level this type maps to, for every type except
    /// `Raw`, which never uses the `coaty/` topic grammar.
    pub fn event_level(self) -> Option<EventLevel> {
        Some(match self {
            EventType::Advertise => EventLevel::Adv,
            EventType::Deadvertise => EventLevel::Dad,
            EventType::Channel => EventLevel::Chn,
            EventType::Associate => EventLevel::Asc,
            EventType::IoValue => EventLevel::Iov,
            EventType::Raw => return None,
            EventType::Discover => EventLevel::Dsc,
            EventType::Resolve => EventLevel::Rsv,
            EventType::Query => EventLevel::Qry,
            EventType::Retrieve => EventLevel::Rtv,
            EventType::Update => EventLevel::Upd,
            EventType::Complete => EventLevel::Cpl,
            EventType::Call => EventLevel::Cll,
            EventType::Return => EventLevel::Rtn,
        })
    }

    /// The response type expected for a two-way request type.
    pub fn response_type(self) -> Option<EventType> {
        Some(match self {
            EventType::Discover => EventType::Resolve,
            EventType::Query => EventType::Retrieve,
            EventType::Update => EventType::Complete,
            EventType::Call => EventType::Return,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------
// Per-variant data records
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseData {
    pub object: CoatyObject,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private_data: Option<BTreeMap<String, Value>>,
}

impl AdvertiseData {
    pub fn new(object: CoatyObject) -> CommResult<Self> {
        object.validate()?;
        Ok(AdvertiseData {
            object,
            private_data: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadvertiseData {
    pub object_ids: Vec<Uuid>,
}

impl DeadvertiseData {
    pub fn new(object_ids: Vec<Uuid>) -> CommResult<Self> {
        if object_ids.is_empty() {
            return Err(CommError::Validation {
                what: "Deadvertise.objectIds",
                reason: "must not be empty".into(),
            });
        }
        Ok(DeadvertiseData { object_ids })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelObjects {
    One(CoatyObject),
    Many(Vec<CoatyObject>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelData {
    pub channel_id: String,
    pub objects: ChannelObjects,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private_data: Option<BTreeMap<String, Value>>,
}

impl ChannelData {
    pub fn new(channel_id: impl Into<String>, objects: ChannelObjects) -> CommResult<Self> {
        let channel_id = channel_id.into();
        if !is_valid_event_filter(&channel_id) {
            return Err(CommError::Validation {
                what: "Channel.channelId",
                reason: format!("{channel_id:?} is not a valid event filter"),
            });
        }
        Ok(ChannelData {
            channel_id,
            objects,
            private_data: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociateData {
    pub io_source_id: Uuid,
    pub io_actor_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub associating_route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_rate: Option<u32>,
    #[serde(default)]
    pub is_external_route: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct RawData {
    pub topic: String,
    pub payload: RawPayload,
    pub options: Option<Value>,
}

impl RawData {
    pub fn new(topic: impl Into<String>, payload: RawPayload) -> CommResult<Self> {
        let topic = topic.into();
        if !crate::topic::is_valid_publication_topic(&topic) {
            return Err(CommError::Validation {
                what: "Raw.topic",
                reason: format!("{topic:?} is not a valid publication topic"),
            });
        }
        Ok(RawData {
            topic,
            payload,
            options: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IoValueData {
    pub route: String,
    pub payload: RawPayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub object_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub core_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub object_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverMode {
    ById,
    ByExternalId,
    ByBoth,
    ByType,
}

impl DiscoverData {
    pub fn by_id(object_id: Uuid) -> Self {
        DiscoverData {
            object_id: Some(object_id),
            ..Default::default()
        }
    }

    pub fn by_external_id(external_id: impl Into<String>) -> Self {
        DiscoverData {
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }

    pub fn by_type(core_types: Option<Vec<String>>, object_types: Option<Vec<String>>) -> Self {
        DiscoverData {
            core_types,
            object_types,
            ..Default::default()
        }
    }

    /// Implements the Discover validity table in `spec.md` §4.1.
    pub fn mode(&self) -> CommResult<DiscoverMode> {
        match (
            self.object_id.is_some(),
            self.external_id.is_some(),
            self.core_types.is_some(),
            self.object_types.is_some(),
        ) {
            (true, false, false, false) => Ok(DiscoverMode::ById),
            (false, true, _, _) => Ok(DiscoverMode::ByExternalId),
            (true, true, false, false) => Ok(DiscoverMode::ByBoth),
            (false, false, ct, ot) if !(ct && ot) => Ok(DiscoverMode::ByType),
            _ => Err(CommError::Validation {
                what: "Discover",
                reason: "objectId/externalId/coreTypes/objectTypes combination is not one of the four valid modes".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub object: Option<CoatyObject>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub related_objects: Option<Vec<CoatyObject>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private_data: Option<BTreeMap<String, Value>>,
}

impl ResolveData {
    pub fn new(object: Option<CoatyObject>, related_objects: Option<Vec<CoatyObject>>) -> CommResult<Self> {
        if object.is_none() && related_objects.is_none() {
            return Err(CommError::Validation {
                what: "Resolve",
                reason: "at least one of object or relatedObjects must be set".into(),
            });
        }
        Ok(ResolveData {
            object,
            related_objects,
            private_data: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFilter {
    pub conditions: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCondition {
    pub as_property: String,
    pub is_local: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub object_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub core_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub object_filter: Option<ObjectFilter>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub object_join_conditions: Option<Vec<JoinCondition>>,
}

impl QueryData {
    pub fn new(object_types: Option<Vec<String>>, core_types: Option<Vec<String>>) -> CommResult<Self> {
        if object_types.is_some() == core_types.is_some() {
            return Err(CommError::Validation {
                what: "Query",
                reason: "exactly one of objectTypes or coreTypes must be set".into(),
            });
        }
        Ok(QueryData {
            object_types,
            core_types,
            object_filter: None,
            object_join_conditions: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveData {
    pub objects: Vec<CoatyObject>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private_data: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateData {
    pub object: CoatyObject,
}

impl UpdateData {
    pub fn new(object: CoatyObject) -> CommResult<Self> {
        if !is_valid_event_filter(&object.object_type) {
            return Err(CommError::Validation {
                what: "Update.object.objectType",
                reason: format!("{:?} is not a valid event filter", object.object_type),
            });
        }
        Ok(UpdateData { object })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteData {
    pub object: CoatyObject,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private_data: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallParameters {
    None,
    Positional(Vec<Value>),
    ByName(BTreeMap<String, Value>),
}

/// A structured predicate over a context object, used by Call to select
/// executors (`SPEC_FULL.md` §4.1, scenario 3/4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextFilter {
    Eq(String, Value),
    Between(String, Value, Value),
    And(Vec<ContextFilter>),
    Or(Vec<ContextFilter>),
}

impl ContextFilter {
    pub fn matches(&self, context: &Value) -> bool {
        match self {
            ContextFilter::Eq(prop, expected) => context.get(prop) == Some(expected),
            ContextFilter::Between(prop, lo, hi) => match context.get(prop).and_then(Value::as_f64) {
                Some(v) => {
                    let lo = lo.as_f64().unwrap_or(f64::NEG_INFINITY);
                    let hi = hi.as_f64().unwrap_or(f64::INFINITY);
                    v >= lo && v <= hi
                }
                None => false,
            },
            ContextFilter::And(fs) => fs.iter().all(|f| f.matches(context)),
            ContextFilter::Or(fs) => fs.iter().any(|f| f.matches(context)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallData {
    pub operation: String,
    #[serde(default = "default_call_parameters")]
    pub parameters: CallParameters,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filter: Option<ContextFilter>,
}

fn default_call_parameters() -> CallParameters {
    CallParameters::None
}

impl CallData {
    pub fn new(operation: impl Into<String>, parameters: CallParameters) -> CommResult<Self> {
        let operation = operation.into();
        if !is_valid_event_filter(&operation) {
            return Err(CommError::Validation {
                what: "Call.operation",
                reason: format!("{operation:?} is not a valid event filter"),
            });
        }
        Ok(CallData {
            operation,
            parameters,
            filter: None,
        })
    }
}

pub const RESERVED_ERROR_CODE_LOW: i32 = -32768;
pub const RESERVED_ERROR_CODE_HIGH: i32 = -32000;
pub const ERROR_INVALID_PARAMETERS: i32 = -32602;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ReturnError>,
}

impl ReturnData {
    pub fn result(value: Value) -> Self {
        ReturnData {
            result: Some(value),
            error: None,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        ReturnData {
            result: None,
            error: Some(ReturnError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn validate(&self) -> CommResult<()> {
        if self.result.is_some() == self.error.is_some() {
            return Err(CommError::Validation {
                what: "Return",
                reason: "exactly one of result or error must be set".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// The event envelope
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum EventData {
    Advertise(AdvertiseData),
    Deadvertise(DeadvertiseData),
    Channel(ChannelData),
    Associate(AssociateData),
    IoValue(IoValueData),
    Raw(RawData),
    Discover(DiscoverData),
    Resolve(ResolveData),
    Query(QueryData),
    Retrieve(RetrieveData),
    Update(UpdateData),
    Complete(CompleteData),
    Call(CallData),
    Return(ReturnData),
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::Advertise(_) => EventType::Advertise,
            EventData::Deadvertise(_) => EventType::Deadvertise,
            EventData::Channel(_) => EventType::Channel,
            EventData::Associate(_) => EventType::Associate,
            EventData::IoValue(_) => EventType::IoValue,
            EventData::Raw(_) => EventType::Raw,
            EventData::Discover(_) => EventType::Discover,
            EventData::Resolve(_) => EventType::Resolve,
            EventData::Query(_) => EventType::Query,
            EventData::Retrieve(_) => EventType::Retrieve,
            EventData::Update(_) => EventType::Update,
            EventData::Complete(_) => EventType::Complete,
            EventData::Call(_) => EventType::Call,
            EventData::Return(_) => EventType::Return,
        }
    }
}

/// An immutable, self-validated event of one of the 11 patterns.
#[derive(Debug, Clone)]
pub struct CommEvent {
    pub source_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub data: EventData,
}

impl CommEvent {
    fn new(source_id: Uuid, correlation_id: Option<Uuid>, data: EventData) -> CommResult<Self> {
        let event_type = data.event_type();
        if event_type.is_one_way() != correlation_id.is_none() {
            return Err(CommError::Validation {
                what: "Event.correlationId",
                reason: format!(
                    "{:?} {} a correlation id",
                    event_type,
                    if event_type.is_one_way() {
                        "must not carry"
                    } else {
                        "must carry"
                    }
                ),
            });
        }
        Ok(CommEvent {
            source_id,
            correlation_id,
            data,
        })
    }

    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }

    pub fn advertise(source_id: Uuid, object: CoatyObject) -> CommResult<Self> {
        Self::new(source_id, None, EventData::Advertise(AdvertiseData::new(object)?))
    }

    pub fn deadvertise(source_id: Uuid, object_ids: Vec<Uuid>) -> CommResult<Self> {
        Self::new(
            source_id,
            None,
            EventData::Deadvertise(DeadvertiseData::new(object_ids)?),
        )
    }

    pub fn channel(source_id: Uuid, channel_id: impl Into<String>, objects: ChannelObjects) -> CommResult<Self> {
        Self::new(
            source_id,
            None,
            EventData::Channel(ChannelData::new(channel_id, objects)?),
        )
    }

    pub fn associate(source_id: Uuid, data: AssociateData) -> CommResult<Self> {
        Self::new(source_id, None, EventData::Associate(data))
    }

    pub fn raw(source_id: Uuid, topic: impl Into<String>, payload: RawPayload) -> CommResult<Self> {
        Self::new(source_id, None, EventData::Raw(RawData::new(topic, payload)?))
    }

    pub fn io_value(source_id: Uuid, route: impl Into<String>, payload: RawPayload) -> CommResult<Self> {
        Self::new(
            source_id,
            None,
            EventData::IoValue(IoValueData {
                route: route.into(),
                payload,
            }),
        )
    }

    pub fn discover(source_id: Uuid, data: DiscoverData) -> CommResult<Self> {
        data.mode()?;
        Self::new(source_id, Some(Uuid::new_v4()), EventData::Discover(data))
    }

    pub fn resolve(source_id: Uuid, correlation_id: Uuid, data: ResolveData) -> CommResult<Self> {
        Self::new(source_id, Some(correlation_id), EventData::Resolve(data))
    }

    pub fn query(source_id: Uuid, data: QueryData) -> CommResult<Self> {
        Self::new(source_id, Some(Uuid::new_v4()), EventData::Query(data))
    }

    pub fn retrieve(source_id: Uuid, correlation_id: Uuid, objects: Vec<CoatyObject>) -> CommResult<Self> {
        Self::new(
            source_id,
            Some(correlation_id),
            EventData::Retrieve(RetrieveData {
                objects,
                private_data: None,
            }),
        )
    }

    pub fn update(source_id: Uuid, object: CoatyObject) -> CommResult<Self> {
        Self::new(
            source_id,
            Some(Uuid::new_v4()),
            EventData::Update(UpdateData::new(object)?),
        )
    }

    pub fn complete(source_id: Uuid, correlation_id: Uuid, object: CoatyObject) -> CommResult<Self> {
        Self::new(
            source_id,
            Some(correlation_id),
            EventData::Complete(CompleteData {
                object,
                private_data: None,
            }),
        )
    }

    pub fn call(source_id: Uuid, data: CallData) -> CommResult<Self> {
        Self::new(source_id, Some(Uuid::new_v4()), EventData::Call(data))
    }

    pub fn ret(source_id: Uuid, correlation_id: Uuid, data: ReturnData) -> CommResult<Self> {
        data.validate()?;
        Self::new(source_id, Some(correlation_id), EventData::Return(data))
    }

    /// The `<eventTypeFilter>` segment this event publishes under, for the
    /// five event types that carry one.
    pub fn event_type_filter(&self) -> Option<String> {
        match &self.data {
            EventData::Advertise(a) => Some(a.object.core_type.as_str().to_string()),
            EventData::Channel(c) => Some(c.channel_id.clone()),
            EventData::Associate(_) => None, // filled in by the caller (context name)
            EventData::Update(u) => Some(u.object.core_type.as_str().to_string()),
            EventData::Call(c) => Some(c.operation.clone()),
            _ => None,
        }
    }
}

/// Checks whether `coreTypes`/`objectTypes` membership constraints from a
/// Discover/Query request are satisfied by a candidate object
/// (`SPEC_FULL.md` §4.1 response consistency rule).
pub fn object_matches_types(
    object: &CoatyObject,
    core_types: Option<&[String]>,
    object_types: Option<&[String]>,
) -> bool {
    let core_ok = core_types
        .map(|cts| cts.iter().any(|ct| ct.as_str() == object.core_type.as_str()))
        .unwrap_or(true);
    let type_ok = object_types
        .map(|ots| ots.iter().any(|ot| ot.as_str() == object.object_type.as_str()))
        .unwrap_or(true);
    core_ok && type_ok
}

/// Verifies a Resolve against the Discover request that triggered it.
pub fn check_discover_resolve_consistency(
    discover: &DiscoverData,
    resolve: &ResolveData,
    correlation_id: Uuid,
) -> CommResult<()> {
    let objects: Vec<&CoatyObject> = resolve
        .object
        .iter()
        .chain(resolve.related_objects.iter().flatten())
        .collect();
    for object in objects {
        if let Some(expected) = discover.object_id {
            if object.object_id != expected {
                return Err(mismatch(correlation_id, "objectId does not match Discover request"));
            }
        }
        if let Some(expected) = &discover.external_id {
            if object.external_id.as_deref() != Some(expected.as_str()) {
                return Err(mismatch(correlation_id, "externalId does not match Discover request"));
            }
        }
        if !object_matches_types(
            object,
            discover.core_types.as_deref(),
            discover.object_types.as_deref(),
        ) {
            return Err(mismatch(correlation_id, "coreType/objectType does not match Discover request"));
        }
    }
    Ok(())
}

/// Verifies a Complete against the Update request that triggered it.
pub fn check_update_complete_consistency(
    update: &UpdateData,
    complete: &CompleteData,
    correlation_id: Uuid,
) -> CommResult<()> {
    if update.object.object_id != complete.object.object_id {
        return Err(mismatch(
            correlation_id,
            "Complete.object.objectId does not match Update.object.objectId",
        ));
    }
    Ok(())
}

fn mismatch(correlation_id: Uuid, reason: &str) -> CommError {
    CommError::ResponseMismatch {
        correlation_id,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn discover_modes_classify_correctly() {
        assert_eq!(DiscoverData::by_id(Uuid::new_v4()).mode().unwrap(), DiscoverMode::ById);
        assert_eq!(
            DiscoverData::by_external_id("ext-1").mode().unwrap(),
            DiscoverMode::ByExternalId
        );
        assert_eq!(
            DiscoverData::by_type(Some(vec!["Identity".into()]), None).mode().unwrap(),
            DiscoverMode::ByType
        );
        let both = DiscoverData {
            object_id: Some(Uuid::new_v4()),
            external_id: Some("x".into()),
            ..Default::default()
        };
        assert_eq!(both.mode().unwrap(), DiscoverMode::ByBoth);
    }

    #[test]
    fn discover_rejects_objectid_with_types() {
        let bad = DiscoverData {
            object_id: Some(Uuid::new_v4()),
            core_types: Some(vec!["Identity".into()]),
            ..Default::default()
        };
        assert!(bad.mode().is_err());
    }

    #[test]
    fn discover_rejects_both_core_and_object_types_in_by_type_mode() {
        let bad = DiscoverData {
            core_types: Some(vec!["Identity".into()]),
            object_types: Some(vec!["coaty.test.Mock".into()]),
            ..Default::default()
        };
        assert!(bad.mode().is_err());
    }

    #[test]
    fn query_requires_exactly_one_type_filter() {
        assert!(QueryData::new(None, None).is_err());
        assert!(QueryData::new(Some(vec!["a".into()]), Some(vec!["b".into()])).is_err());
        assert!(QueryData::new(Some(vec!["a".into()]), None).is_ok());
    }

    #[test]
    fn return_requires_exactly_one_of_result_or_error() {
        assert!(ReturnData::result(Value::Null).validate().is_ok());
        assert!(ReturnData::error(ERROR_INVALID_PARAMETERS, "bad").validate().is_ok());
        assert!(ReturnData {
            result: None,
            error: None
        }
        .validate()
        .is_err());
    }

    #[test]
    fn call_context_filter_between() {
        let filter = ContextFilter::Between("floor".into(), Value::from(6), Value::from(8));
        assert!(filter.matches(&serde_json::json!({"floor": 7})));
        assert!(!filter.matches(&serde_json::json!({"floor": 10})));
    }

    #[test]
    fn deadvertise_rejects_empty_ids() {
        assert!(DeadvertiseData::new(vec![]).is_err());
    }

    #[test]
    fn one_way_event_forbids_correlation_id() {
        let obj = CoatyObject::new("coaty.test.Mock", CoreType::CoatyObject, "m").unwrap();
        let event = CommEvent::advertise(Uuid::new_v4(), obj).unwrap();
        assert!(event.correlation_id.is_none());
    }
}
