//! CoatyObject and the core-type hierarchy: Identity, IoNode, IoSource,
//! IoActor (`SPEC_FULL.md` §3).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CommError, CommResult};
use crate::topic::is_valid_event_filter;

/// Tag from the fixed set of well-known core types, with an escape hatch
/// for application-defined types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CoreType {
    CoatyObject,
    Identity,
    IoNode,
    IoSource,
    IoActor,
    IoContext,
    Custom(String),
}

impl CoreType {
    pub fn as_str(&self) -> &str {
        match self {
            CoreType::CoatyObject => "CoatyObject",
            CoreType::Identity => "Identity",
            CoreType::IoNode => "IoNode",
            CoreType::IoSource => "IoSource",
            CoreType::IoActor => "IoActor",
            CoreType::IoContext => "IoContext",
            CoreType::Custom(s) => s.as_str(),
        }
    }
}

impl From<&str> for CoreType {
    fn from(s: &str) -> Self {
        match s {
            "CoatyObject" => CoreType::CoatyObject,
            "Identity" => CoreType::Identity,
            "IoNode" => CoreType::IoNode,
            "IoSource" => CoreType::IoSource,
            "IoActor" => CoreType::IoActor,
            "IoContext" => CoreType::IoContext,
            other => CoreType::Custom(other.to_string()),
        }
    }
}

impl Serialize for CoreType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CoreType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(CoreType::from(s.as_str()))
    }
}

/// Every domain payload carried by an event. Required: `object_id`,
/// `object_type`, `core_type`, `name`. Optional: `parent_object_id`,
/// `external_id`, `is_deactivated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoatyObject {
    pub object_id: Uuid,
    pub object_type: String,
    pub core_type: CoreType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_object_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_deactivated: Option<bool>,
}

impl CoatyObject {
    pub fn new(
        object_type: impl Into<String>,
        core_type: CoreType,
        name: impl Into<String>,
    ) -> CommResult<Self> {
        let object = CoatyObject {
            object_id: Uuid::new_v4(),
            object_type: object_type.into(),
            core_type,
            name: name.into(),
            parent_object_id: None,
            external_id: None,
            is_deactivated: None,
        };
        object.validate()?;
        Ok(object)
    }

    /// `objectType` must pass event-filter (topic-level) validation since
    /// it is embedded verbatim in publication topics.
    pub fn validate(&self) -> CommResult<()> {
        if !is_valid_event_filter(&self.object_type) {
            return Err(CommError::Validation {
                what: "CoatyObject.objectType",
                reason: format!("{:?} is not a valid event filter", self.object_type),
            });
        }
        if self.name.is_empty() {
            return Err(CommError::Validation {
                what: "CoatyObject.name",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// A CoatyObject with `coreType = Identity`, naming a running agent
/// container. Exactly one per container, constant for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub CoatyObject);

impl Identity {
    pub fn new(name: impl Into<String>) -> CommResult<Self> {
        Ok(Identity(CoatyObject::new(
            "coaty.Identity",
            CoreType::Identity,
            name,
        )?))
    }

    pub fn object_id(&self) -> Uuid {
        self.0.object_id
    }
}

/// An IoSource CoatyObject: declares the value type it produces and may
/// override the router-assigned route with an `externalRoute` hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoSource {
    #[serde(flatten)]
    pub object: CoatyObject,
    pub value_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_route: Option<String>,
}

impl IoSource {
    pub fn id(&self) -> Uuid {
        self.object.object_id
    }
}

/// An IoActor CoatyObject: declares the value type it consumes and whether
/// it wants raw bytes instead of JSON-decoded IoValue payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoActor {
    #[serde(flatten)]
    pub object: CoatyObject,
    pub value_type: String,
    pub use_raw_io_values: bool,
}

impl IoActor {
    pub fn id(&self) -> Uuid {
        self.object.object_id
    }
}

/// Groups a set of IoSources/IoActors under a context name. `name` is the
/// context name and must pass topic-level validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoNode {
    #[serde(flatten)]
    pub object: CoatyObject,
    #[serde(default)]
    pub io_sources: Vec<IoSource>,
    #[serde(default)]
    pub io_actors: Vec<IoActor>,
}

impl IoNode {
    pub fn new(
        context_name: impl Into<String>,
        io_sources: Vec<IoSource>,
        io_actors: Vec<IoActor>,
    ) -> CommResult<Self> {
        let name = context_name.into();
        if !is_valid_event_filter(&name) {
            return Err(CommError::Validation {
                what: "IoNode.name",
                reason: format!("{name:?} is not a valid context name"),
            });
        }
        let object = CoatyObject::new("coaty.IoNode", CoreType::IoNode, name)?;
        Ok(IoNode {
            object,
            io_sources,
            io_actors,
        })
    }

    pub fn context_name(&self) -> &str {
        &self.object.name
    }

    pub fn id(&self) -> Uuid {
        self.object.object_id
    }

    pub fn owns_source(&self, source_id: Uuid) -> bool {
        self.io_sources.iter().any(|s| s.id() == source_id)
    }

    pub fn owns_actor(&self, actor_id: Uuid) -> bool {
        self.io_actors.iter().any(|a| a.id() == actor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_has_identity_core_type() {
        let id = Identity::new("agent-a").unwrap();
        assert_eq!(id.0.core_type, CoreType::Identity);
    }

    #[test]
    fn object_rejects_invalid_object_type() {
        let err = CoatyObject::new("bad/type", CoreType::CoatyObject, "x");
        assert!(err.is_err());
    }

    #[test]
    fn io_node_rejects_invalid_context_name() {
        assert!(IoNode::new("bad+name", vec![], vec![]).is_err());
    }
}
