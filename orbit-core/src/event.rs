//! Events exchanged between agent components and over the message bus.
//!
//! On the wire an event is `{"Ts": ..., "Type": ..., "Event": ...}` where
//! `Type` is the variant name and doubles as the bus routing key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::model::{EndpointInfo, MachineConfiguration, RuntimeConfiguration};

pub const NOOP_EVENT: &str = "NoopEvent";
pub const DEPLOYMENT_EVENT: &str = "DeploymentEvent";
pub const SERVICE_STATE_EVENT: &str = "ServiceStateEvent";
pub const NEW_RUNTIME_CONFIGURATION_EVENT: &str = "NewRuntimeConfigurationEvent";
pub const CONVERGE_CONTAINERS_EVENT: &str = "ConvergeContainersEvent";

#[derive(Clone, Debug, PartialEq)]
pub struct OrbitEvent {
    pub ts: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Noop,
    Deployment(DeploymentEvent),
    ServiceState(ServiceStateEvent),
    NewRuntimeConfiguration(Box<NewRuntimeConfigurationEvent>),
    ConvergeContainers(Box<ConvergeContainersEvent>),
    /// A type this agent does not know; the body is dropped
    Unknown { type_name: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentAction {
    #[default]
    Deploy,
    Restart,
    AutomaticRelaunch,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub action: DeploymentAction,
    pub service: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub revision: String,
    /// Empty targets every machine running the service
    #[serde(default)]
    pub machine_address: String,
    /// Upper bound, in seconds, of the random delay before acting
    #[serde(default)]
    pub jitter: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceStateEvent {
    pub service: String,
    /// `host:port`
    pub endpoint: String,
    pub is_up: bool,
    #[serde(default)]
    pub state_changed: bool,
    pub same_state_since: DateTime<Utc>,
    #[serde(default)]
    pub endpoint_info: EndpointInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRuntimeConfigurationEvent {
    pub new: RuntimeConfiguration,
    pub old: RuntimeConfiguration,
    /// False on the first poll, when `old` is a placeholder
    pub old_valid: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergeContainersEvent {
    pub machine_configuration: MachineConfiguration,
}

impl EventPayload {
    pub fn type_name(&self) -> &str {
        match self {
            EventPayload::Noop => NOOP_EVENT,
            EventPayload::Deployment(_) => DEPLOYMENT_EVENT,
            EventPayload::ServiceState(_) => SERVICE_STATE_EVENT,
            EventPayload::NewRuntimeConfiguration(_) => NEW_RUNTIME_CONFIGURATION_EVENT,
            EventPayload::ConvergeContainers(_) => CONVERGE_CONTAINERS_EVENT,
            EventPayload::Unknown { type_name } => type_name,
        }
    }

    /// The variant body as JSON; `null` for bodiless variants.
    pub fn body(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventPayload::Noop | EventPayload::Unknown { .. } => Ok(Value::Null),
            EventPayload::Deployment(e) => serde_json::to_value(e),
            EventPayload::ServiceState(e) => serde_json::to_value(e),
            EventPayload::NewRuntimeConfiguration(e) => serde_json::to_value(e),
            EventPayload::ConvergeContainers(e) => serde_json::to_value(e),
        }
    }

    fn from_parts(type_name: String, body: Value) -> Result<Self, serde_json::Error> {
        Ok(match type_name.as_str() {
            NOOP_EVENT => EventPayload::Noop,
            DEPLOYMENT_EVENT => EventPayload::Deployment(serde_json::from_value(body)?),
            SERVICE_STATE_EVENT => EventPayload::ServiceState(serde_json::from_value(body)?),
            NEW_RUNTIME_CONFIGURATION_EVENT => {
                EventPayload::NewRuntimeConfiguration(Box::new(serde_json::from_value(body)?))
            }
            CONVERGE_CONTAINERS_EVENT => {
                EventPayload::ConvergeContainers(Box::new(serde_json::from_value(body)?))
            }
            _ => EventPayload::Unknown { type_name },
        })
    }
}

impl OrbitEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            ts: Utc::now(),
            payload,
        }
    }

    pub fn noop() -> Self {
        Self::new(EventPayload::Noop)
    }

    pub fn deployment(event: DeploymentEvent) -> Self {
        Self::new(EventPayload::Deployment(event))
    }

    pub fn service_state(event: ServiceStateEvent) -> Self {
        Self::new(EventPayload::ServiceState(event))
    }

    pub fn new_runtime_configuration(event: NewRuntimeConfigurationEvent) -> Self {
        Self::new(EventPayload::NewRuntimeConfiguration(Box::new(event)))
    }

    pub fn converge_containers(machine_configuration: MachineConfiguration) -> Self {
        Self::new(EventPayload::ConvergeContainers(Box::new(
            ConvergeContainersEvent {
                machine_configuration,
            },
        )))
    }

    pub fn type_name(&self) -> &str {
        self.payload.type_name()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "Ts")]
    ts: DateTime<Utc>,
    #[serde(rename = "Type")]
    type_name: String,
    #[serde(rename = "Event", default)]
    event: Value,
}

impl Serialize for OrbitEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let event = self.payload.body().map_err(serde::ser::Error::custom)?;
        WireEnvelope {
            ts: self.ts,
            type_name: self.type_name().to_string(),
            event,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OrbitEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        let payload = EventPayload::from_parts(wire.type_name, wire.event)
            .map_err(serde::de::Error::custom)?;
        Ok(OrbitEvent {
            ts: wire.ts,
            payload,
        })
    }
}
