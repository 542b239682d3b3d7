//! Effective configuration schema (`SPEC_FULL.md` §6): the options a
//! `CommunicationManager` is constructed or restarted with. Deserializable
//! so an agent container can load it from a TOML file, mirroring the
//! reference crate's typed security-config-file pattern rather than
//! inventing a bespoke parser.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::binding::mqtt::MqttBindingOptions;
use crate::object::{IoActor, IoSource};

/// `common.ioContextNodes`: context name -> the IoSources/IoActors
/// declared for it, plus free-form characteristics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoContextNodeConfig {
    #[serde(default)]
    pub io_sources: Vec<IoSource>,
    #[serde(default)]
    pub io_actors: Vec<IoActor>,
    #[serde(default)]
    pub characteristics: BTreeMap<String, serde_json::Value>,
}

/// `common.agentIdentity`: a partial override of the agent's Identity
/// object. `coreType`/`objectType` cannot be overridden (§6) — this type
/// simply has no fields for them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentityOverride {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// The `common` sub-table shared across binding-agnostic concerns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonOptions {
    #[serde(default)]
    pub agent_identity: Option<AgentIdentityOverride>,
    #[serde(default)]
    pub io_context_nodes: BTreeMap<String, IoContextNodeConfig>,
}

/// Which concrete binding to instantiate. The default is the MQTT binding
/// described in §4.3; other bindings (WAMP, libp2p pubsub) are out of
/// scope per `spec.md` §1's Non-goals, but the enum leaves room for the
/// trait to be satisfied by one supplied programmatically instead of
/// through this config (`CommunicationOptions::with_binding`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BindingDescriptor {
    Mqtt {
        #[serde(flatten)]
        options: MqttBindingOptions,
    },
}

impl Default for BindingDescriptor {
    fn default() -> Self {
        BindingDescriptor::Mqtt {
            options: MqttBindingOptions::default(),
        }
    }
}

/// The full effective configuration recognized by the Manager (§6's
/// configuration key table).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationOptions {
    #[serde(default)]
    pub binding: BindingDescriptor,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub should_enable_cross_namespacing: bool,
    #[serde(default)]
    pub should_auto_start: bool,
    #[serde(default)]
    pub common: CommonOptions,
}

fn default_namespace() -> String {
    crate::topic::DEFAULT_NAMESPACE.to_string()
}

impl Default for CommunicationOptions {
    fn default() -> Self {
        CommunicationOptions {
            binding: BindingDescriptor::default(),
            namespace: default_namespace(),
            should_enable_cross_namespacing: false,
            should_auto_start: false,
            common: CommonOptions::default(),
        }
    }
}

impl CommunicationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_cross_namespacing(mut self, enabled: bool) -> Self {
        self.should_enable_cross_namespacing = enabled;
        self
    }

    pub fn with_auto_start(mut self, enabled: bool) -> Self {
        self.should_auto_start = enabled;
        self
    }

    pub fn with_binding(mut self, binding: BindingDescriptor) -> Self {
        self.binding = binding;
        self
    }

    /// Loads a configuration from a TOML document, as an agent container
    /// typically would at startup.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Validates that `namespace` is a legal topic level (§6).
    pub fn validate(&self) -> crate::error::CommResult<()> {
        if !crate::topic::is_valid_topic_level(&self.namespace) {
            return Err(crate::error::CommError::Validation {
                what: "CommunicationOptions.namespace",
                reason: format!("{:?} is not a valid topic level", self.namespace),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_dash_namespace_and_mqtt_binding() {
        let options = CommunicationOptions::default();
        assert_eq!(options.namespace, "-");
        assert!(matches!(options.binding, BindingDescriptor::Mqtt { .. }));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_namespace() {
        let options = CommunicationOptions::new().with_namespace("bad/ns");
        assert!(options.validate().is_err());
    }

    #[test]
    fn loads_from_toml() {
        let toml_src = r#"
            namespace = "factory-a"
            shouldAutoStart = true

            [binding]
            type = "mqtt"
            brokerHost = "broker.local"
            brokerPort = 8883
        "#;
        let options = CommunicationOptions::from_toml_str(toml_src).unwrap();
        assert_eq!(options.namespace, "factory-a");
        assert!(options.should_auto_start);
        match options.binding {
            BindingDescriptor::Mqtt { options } => {
                assert_eq!(options.broker_host, "broker.local");
                assert_eq!(options.broker_port, 8883);
            }
        }
    }
}
