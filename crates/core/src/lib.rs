//! Beacon core types: watch keys, informer events, wire envelopes, label selectors
//! and field projection. Everything here is pure and cluster-agnostic.

#![forbid(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod event;
pub mod key;
pub mod projection;
pub mod selector;

pub use envelope::{Envelope, EnvelopeSink, EventTag, ResourceTags};
pub use error::CoreError;
pub use event::{EventType, InformerEvent};
pub use key::WatchKey;
pub use projection::{strip_managed_fields, FieldSelection, IDENTITY_PATHS};
pub use selector::{labels_match_selectors, selectors_match};
