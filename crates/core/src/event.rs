use serde::{Deserialize, Serialize};

use crate::WatchKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    /// Coalesce a pending event with a later one for the same key.
    ///
    /// A create stays a create until the object is deleted; a delete followed by a
    /// re-create surfaces as an update of the key.
    pub fn merge(self, later: EventType) -> EventType {
        use EventType::*;
        match (self, later) {
            (_, Delete) => Delete,
            (Create, _) => Create,
            (Delete, _) => Update,
            (Update, Create) | (Update, Update) => Update,
        }
    }
}

/// A notification produced by an informer. The queue keeps only the key; the object is
/// read back from the indexer when the key is processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InformerEvent {
    pub key: WatchKey,
    pub event_type: EventType,
}

impl InformerEvent {
    pub fn new(key: WatchKey, event_type: EventType) -> Self { Self { key, event_type } }
}

#[cfg(test)]
mod tests {
    use super::EventType::*;

    #[test]
    fn merge_table() {
        assert_eq!(Create.merge(Update), Create);
        assert_eq!(Create.merge(Delete), Delete);
        assert_eq!(Update.merge(Update), Update);
        assert_eq!(Update.merge(Delete), Delete);
        assert_eq!(Delete.merge(Create), Update);
        assert_eq!(Delete.merge(Update), Update);
        assert_eq!(Delete.merge(Delete), Delete);
    }

    #[test]
    fn merge_is_last_delete_wins_over_long_bursts() {
        let burst = [Create, Update, Update, Delete, Create, Update];
        let merged = burst[1..].iter().fold(burst[0], |acc, e| acc.merge(*e));
        assert_eq!(merged, Update);
    }
}
