use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Last published value of a derived view. Lets aggregate controllers skip
/// re-broadcasting a recomputation that produced the same state.
pub struct Published<T> {
    slot: ArcSwapOption<T>,
}

impl<T> Default for Published<T> {
    fn default() -> Self { Self { slot: ArcSwapOption::empty() } }
}

impl<T: PartialEq> Published<T> {
    pub fn new() -> Self { Self::default() }

    pub fn current(&self) -> Option<Arc<T>> { self.slot.load_full() }

    /// Store `next`; returns false when it equals what was already published.
    pub fn publish_if_changed(&self, next: T) -> bool {
        if self.slot.load().as_deref() == Some(&next) { return false; }
        self.slot.store(Some(Arc::new(next)));
        true
    }
}
