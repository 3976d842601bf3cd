use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Stable identity of a watched object: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct WatchKey {
    namespace: Option<String>,
    name: String,
}

impl WatchKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    pub fn cluster(name: &str) -> Self { Self::new(None, name) }

    /// Key for an object from its metadata. Objects without a name cannot be keyed.
    pub fn from_meta(meta: &ObjectMeta) -> Result<Self, CoreError> {
        let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(CoreError::MissingName)?;
        Ok(Self::new(meta.namespace.as_deref(), name))
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(ns, name)),
            _ => Err(CoreError::InvalidKey(s.to_string())),
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for WatchKey {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl From<WatchKey> for String {
    fn from(k: WatchKey) -> Self { k.to_string() }
}

impl TryFrom<String> for WatchKey {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Self::parse(&s) }
}
