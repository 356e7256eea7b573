//! Per-binding registry of reference subscriptions.

use crate::source::SubscriptionId;
use crate::types::{DocumentId, FieldPath};
use std::collections::HashMap;

/// One live subscription spawned because a field's value was a reference.
#[derive(Debug)]
pub struct RefSubscription {
    /// The document the reference points to.
    pub target: DocumentId,

    /// Source handle, filled in once the subscribe call returns. A subscribe
    /// can still be in flight when the path is superseded; the executor
    /// releases the handle itself in that case.
    pub handle: Option<SubscriptionId>,

    /// Generation token at this path when the subscription was created.
    pub generation: u64,

    /// Whether the first snapshot has arrived. Drives settle counting.
    pub received: bool,
}

/// Tracks the active reference subscription at each field path, plus a
/// per-path generation counter.
///
/// A path holds at most one subscription at a time. Generations only ever
/// increase for a given path, so a callback created under an older generation
/// can be recognized as superseded no matter how late it arrives.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subs: HashMap<FieldPath, RefSubscription>,
    generations: HashMap<FieldPath, u64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&RefSubscription> {
        self.subs.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.subs.keys()
    }

    /// Start a new subscription at `path`, bumping its generation. Any
    /// previous subscription at the path must already have been released.
    pub fn begin(&mut self, path: &FieldPath, target: DocumentId) -> u64 {
        let generation = {
            let g = self.generations.entry(path.clone()).or_insert(0);
            *g += 1;
            *g
        };
        self.subs.insert(
            path.clone(),
            RefSubscription {
                target,
                handle: None,
                generation,
                received: false,
            },
        );
        generation
    }

    /// Store the source handle for the subscription created under
    /// `generation`. Returns false when that subscription has been superseded
    /// or released in the meantime.
    pub fn set_handle(
        &mut self,
        path: &FieldPath,
        generation: u64,
        handle: SubscriptionId,
    ) -> bool {
        match self.subs.get_mut(path) {
            Some(sub) if sub.generation == generation => {
                sub.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// True when `generation` is still the active generation at `path`.
    pub fn is_current(&self, path: &FieldPath, generation: u64) -> bool {
        self.subs
            .get(path)
            .is_some_and(|sub| sub.generation == generation)
    }

    /// Record the first snapshot delivery; true only the first time.
    pub fn mark_received(&mut self, path: &FieldPath) -> bool {
        match self.subs.get_mut(path) {
            Some(sub) if !sub.received => {
                sub.received = true;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, path: &FieldPath) -> Option<RefSubscription> {
        self.subs.remove(path)
    }

    /// Remove every subscription at or under `base`. With `include_base`
    /// false, a subscription at exactly `base` is left alone (it is owned by
    /// the parent payload, not the subtree).
    pub fn release_subtree(
        &mut self,
        base: &FieldPath,
        include_base: bool,
    ) -> Vec<(FieldPath, RefSubscription)> {
        let paths: Vec<FieldPath> = self
            .subs
            .keys()
            .filter(|p| p.starts_with(base) && (include_base || **p != *base))
            .cloned()
            .collect();
        paths
            .into_iter()
            .filter_map(|p| self.subs.remove(&p).map(|sub| (p, sub)))
            .collect()
    }

    /// Remove everything; used when the whole binding goes away.
    pub fn drain(&mut self) -> Vec<(FieldPath, RefSubscription)> {
        self.subs.drain().collect()
    }
}
