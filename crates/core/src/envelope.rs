//! Wire envelope shared by every broadcast: `{ "type": TAG, "payload": ... }`.

use serde::{Deserialize, Serialize};

use crate::{CoreError, EventType, WatchKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventTag {
    PodCreated,
    PodUpdated,
    PodDeleted,
    ServiceCreated,
    ServiceUpdated,
    ServiceDeleted,
    DeploymentCreated,
    DeploymentUpdated,
    DeploymentDeleted,
    IngressCreated,
    IngressUpdated,
    IngressDeleted,
    EventCreated,
    EventUpdated,
    EventDeleted,
    FluxStateReceived,
    ServicesReceived,
    StateReceived,
    Stats,
}

impl EventTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::PodCreated => "POD_CREATED",
            EventTag::PodUpdated => "POD_UPDATED",
            EventTag::PodDeleted => "POD_DELETED",
            EventTag::ServiceCreated => "SERVICE_CREATED",
            EventTag::ServiceUpdated => "SERVICE_UPDATED",
            EventTag::ServiceDeleted => "SERVICE_DELETED",
            EventTag::DeploymentCreated => "DEPLOYMENT_CREATED",
            EventTag::DeploymentUpdated => "DEPLOYMENT_UPDATED",
            EventTag::DeploymentDeleted => "DEPLOYMENT_DELETED",
            EventTag::IngressCreated => "INGRESS_CREATED",
            EventTag::IngressUpdated => "INGRESS_UPDATED",
            EventTag::IngressDeleted => "INGRESS_DELETED",
            EventTag::EventCreated => "EVENT_CREATED",
            EventTag::EventUpdated => "EVENT_UPDATED",
            EventTag::EventDeleted => "EVENT_DELETED",
            EventTag::FluxStateReceived => "FLUX_STATE_RECEIVED",
            EventTag::ServicesReceived => "SERVICES_RECEIVED",
            EventTag::StateReceived => "STATE_RECEIVED",
            EventTag::Stats => "STATS",
        }
    }

    /// Created/updated tags carry a single object and are eligible for field projection.
    pub fn carries_object(&self) -> bool {
        matches!(
            self,
            EventTag::PodCreated
                | EventTag::PodUpdated
                | EventTag::ServiceCreated
                | EventTag::ServiceUpdated
                | EventTag::DeploymentCreated
                | EventTag::DeploymentUpdated
                | EventTag::IngressCreated
                | EventTag::IngressUpdated
                | EventTag::EventCreated
                | EventTag::EventUpdated
        )
    }
}

/// Created/updated/deleted tags for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTags {
    pub created: EventTag,
    pub updated: EventTag,
    pub deleted: EventTag,
}

impl ResourceTags {
    pub const POD: ResourceTags = ResourceTags { created: EventTag::PodCreated, updated: EventTag::PodUpdated, deleted: EventTag::PodDeleted };
    pub const SERVICE: ResourceTags = ResourceTags { created: EventTag::ServiceCreated, updated: EventTag::ServiceUpdated, deleted: EventTag::ServiceDeleted };
    pub const DEPLOYMENT: ResourceTags = ResourceTags { created: EventTag::DeploymentCreated, updated: EventTag::DeploymentUpdated, deleted: EventTag::DeploymentDeleted };
    pub const INGRESS: ResourceTags = ResourceTags { created: EventTag::IngressCreated, updated: EventTag::IngressUpdated, deleted: EventTag::IngressDeleted };
    pub const EVENT: ResourceTags = ResourceTags { created: EventTag::EventCreated, updated: EventTag::EventUpdated, deleted: EventTag::EventDeleted };

    pub fn for_event(&self, event_type: EventType) -> EventTag {
        match event_type {
            EventType::Create => self.created,
            EventType::Update => self.updated,
            EventType::Delete => self.deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub tag: EventTag,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize + ?Sized>(tag: EventTag, payload: &T) -> Result<Self, CoreError> {
        Ok(Self { tag, payload: serde_json::to_value(payload)? })
    }

    pub fn from_value(tag: EventTag, payload: serde_json::Value) -> Self { Self { tag, payload } }

    /// Deleted objects no longer exist, so the payload is only the key string.
    pub fn deleted(tag: EventTag, key: &WatchKey) -> Self {
        Self { tag, payload: serde_json::Value::String(key.to_string()) }
    }

    pub fn to_json(&self) -> Result<String, CoreError> { Ok(serde_json::to_string(self)?) }
}

/// Destination for envelopes produced by controllers (the broadcast hub in production).
pub trait EnvelopeSink: Send + Sync {
    fn publish(&self, envelope: Envelope);
}
