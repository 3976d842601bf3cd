//! Event shaping: strip `managedFields` and optionally project objects down to a
//! requested set of dot paths plus the identity fields a client needs to address them.

use serde_json::{Map, Value};
use smallvec::SmallVec;

/// Always kept when projecting, so projected objects stay addressable.
pub const IDENTITY_PATHS: &[&str] = &[
    "apiVersion",
    "kind",
    "metadata.name",
    "metadata.namespace",
    "metadata.labels",
    "metadata.creationTimestamp",
    "metadata.deletionTimestamp",
    "metadata.resourceVersion",
];

pub fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Accept only plain dot paths like `status.phase`; no wildcards, filters or indexes.
fn normalize_path(raw: &str) -> Option<String> {
    let s = raw.trim();
    let s = s.strip_prefix('.').unwrap_or(s);
    if s.is_empty() { return None; }
    for seg in s.split('.') {
        if seg.is_empty() { return None; }
        if !seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') { return None; }
    }
    if s == "metadata.managedFields" || s.starts_with("metadata.managedFields.") { return None; }
    Some(s.to_string())
}

/// Requested projection, parsed from a `fields` query parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelection {
    paths: SmallVec<[String; 8]>,
}

impl FieldSelection {
    /// Parse a JSON array (`["status.phase"]`) or a comma-separated list. Invalid
    /// entries are dropped.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let items: Vec<String> = if raw.starts_with('[') {
            serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
        } else {
            raw.split(',').map(str::to_string).collect()
        };
        let mut paths: SmallVec<[String; 8]> = SmallVec::new();
        for p in items.iter().filter_map(|i| normalize_path(i)) {
            if !paths.contains(&p) { paths.push(p); }
        }
        Self { paths }
    }

    pub fn is_empty(&self) -> bool { self.paths.is_empty() }
    pub fn paths(&self) -> &[String] { &self.paths }

    /// Shape one object for the wire.
    pub fn shape(&self, obj: &Value) -> Value {
        if self.is_empty() {
            let mut out = obj.clone();
            strip_managed_fields(&mut out);
            return out;
        }
        let mut out = Value::Object(Map::new());
        for path in IDENTITY_PATHS.iter().copied().chain(self.paths.iter().map(String::as_str)) {
            copy_path(obj, &mut out, path);
        }
        out
    }
}

fn copy_path(src: &Value, dst: &mut Value, path: &str) {
    let segs: SmallVec<[&str; 8]> = path.split('.').collect();
    let Some((last, parents)) = segs.split_last() else { return };
    let mut cur = src;
    for seg in segs.iter() {
        match cur.get(*seg) {
            Some(v) => cur = v,
            None => return,
        }
    }
    let mut slot = dst;
    for seg in parents {
        let map = match slot {
            Value::Object(m) => m,
            _ => return,
        };
        slot = map.entry(seg.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
    if let Value::Object(map) = slot {
        map.insert(last.to_string(), cur.clone());
    }
}
