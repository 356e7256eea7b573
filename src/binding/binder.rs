//! Bind/unbind orchestration.
//!
//! One [`Binder`] owns a set of root bindings keyed by name. Each root
//! binding holds its root subscription, a [`SubscriptionRegistry`] of every
//! reference subscription spawned beneath it, and the resolved value tree.
//!
//! Snapshot callbacks lock the binder, check their generation, apply the
//! snapshot, and collect subscribe/unsubscribe side effects that run only
//! after the lock is released, so sources are free to deliver initial
//! snapshots synchronously from inside `subscribe_*`.

use crate::binding::registry::SubscriptionRegistry;
use crate::binding::resolve::{self, SideEffect};
use crate::error::{BindError, Result};
use crate::source::{
    CollectionCallback, CollectionEvent, DocumentCallback, DocumentEvent, SnapshotSource,
    SubscriptionId,
};
use crate::types::{BindSource, DocumentId, FieldPath, PathSegment};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Resolved value of one root binding.
enum RootValue {
    Document(Value),
    /// Members in source order, keyed by identity for path navigation.
    Collection(Vec<(DocumentId, Value)>),
}

struct RootBinding {
    /// Distinguishes rebinds of the same key; callbacks from an earlier
    /// binding of the key carry an older epoch and are discarded.
    epoch: u64,
    root_handle: Option<SubscriptionId>,
    registry: SubscriptionRegistry,
    value: RootValue,
    root_received: bool,
    /// Reference subscriptions still awaiting their first snapshot.
    pending: usize,
    /// Consumed when the binding settles or fails before settling.
    settle: Option<Sender<Result<Value>>>,
}

impl RootBinding {
    fn resolved_value(&self) -> Value {
        match &self.value {
            RootValue::Document(value) => value.clone(),
            RootValue::Collection(members) => {
                Value::Array(members.iter().map(|(_, value)| value.clone()).collect())
            }
        }
    }

    /// Release everything this binding owns; returns the handles to
    /// unsubscribe. Dropping the binding afterwards also drops the settle
    /// sender, which fails any bind call still waiting.
    fn release_all(&mut self) -> Vec<SubscriptionId> {
        let mut handles: Vec<SubscriptionId> = self
            .registry
            .drain()
            .into_iter()
            .filter_map(|(_, sub)| sub.handle)
            .collect();
        if let Some(handle) = self.root_handle.take() {
            handles.push(handle);
        }
        handles
    }
}

struct Shared {
    source: Arc<dyn SnapshotSource>,
    bindings: Mutex<HashMap<String, RootBinding>>,
    next_epoch: AtomicU64,
}

/// Binds keys to live documents or collections and mirrors their resolved
/// values, with cross-document references expanded inline.
pub struct Binder {
    shared: Arc<Shared>,
}

impl Binder {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                bindings: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Bind `key` to a document or collection.
    ///
    /// Blocks until the binding settles: the root snapshot has arrived and
    /// every reference subscription it transitively spawned has delivered at
    /// least one snapshot. Returns the resolved value at that point; the
    /// value keeps updating live afterwards, readable via [`resolved`].
    ///
    /// Rebinding a key that is already bound unbinds it first.
    ///
    /// [`resolved`]: Binder::resolved
    pub fn bind(&self, key: &str, target: impl Into<BindSource>) -> Result<Value> {
        let target = target.into();
        self.unbind(key);

        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst);
        let (settle_tx, settle_rx) = bounded(1);
        let value = match &target {
            BindSource::Document(_) => RootValue::Document(Value::Null),
            BindSource::Collection(_) => RootValue::Collection(Vec::new()),
        };
        debug!(key, %target, epoch, "bind");
        self.shared.bindings.lock().insert(
            key.to_string(),
            RootBinding {
                epoch,
                root_handle: None,
                registry: SubscriptionRegistry::new(),
                value,
                root_received: false,
                pending: 0,
                settle: Some(settle_tx),
            },
        );

        // The initial snapshot may arrive synchronously in here.
        let handle = match &target {
            BindSource::Document(id) => self
                .shared
                .source
                .subscribe_document(id, root_document_callback(&self.shared, key, epoch)),
            BindSource::Collection(id) => self
                .shared
                .source
                .subscribe_collection(id, root_collection_callback(&self.shared, key, epoch)),
        };

        let keep = {
            let mut bindings = self.shared.bindings.lock();
            match bindings.get_mut(key) {
                Some(binding) if binding.epoch == epoch => {
                    binding.root_handle = Some(handle);
                    true
                }
                _ => false,
            }
        };
        if !keep {
            // Unbound (or rebound) while the subscribe was in flight.
            self.shared.source.unsubscribe(handle);
            return Err(BindError::Unbound);
        }

        match settle_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(BindError::Unbound),
        }
    }

    /// Parse `path` and bind it; fails with `InvalidSource` on malformed
    /// paths without touching the source.
    pub fn bind_path(&self, key: &str, path: &str) -> Result<Value> {
        self.bind(key, BindSource::parse(path)?)
    }

    /// Release the binding at `key`: its root subscription and every
    /// reference subscription spawned beneath it, each exactly once. No-op
    /// for unknown keys.
    pub fn unbind(&self, key: &str) {
        let Some(mut binding) = self.shared.bindings.lock().remove(key) else {
            return;
        };
        let handles = binding.release_all();
        debug!(key, released = handles.len(), "unbind");
        for handle in handles {
            self.shared.source.unsubscribe(handle);
        }
    }

    /// Current resolved value at `key`, or None when unbound.
    pub fn resolved(&self, key: &str) -> Option<Value> {
        self.shared
            .bindings
            .lock()
            .get(key)
            .map(RootBinding::resolved_value)
    }

    pub fn is_bound(&self, key: &str) -> bool {
        self.shared.bindings.lock().contains_key(key)
    }

    pub fn binding_count(&self) -> usize {
        self.shared.bindings.lock().len()
    }
}

impl Drop for Binder {
    fn drop(&mut self) {
        let keys: Vec<String> = self.shared.bindings.lock().keys().cloned().collect();
        for key in keys {
            self.unbind(&key);
        }
    }
}

fn root_document_callback(shared: &Arc<Shared>, key: &str, epoch: u64) -> DocumentCallback {
    let weak = Arc::downgrade(shared);
    let key = key.to_string();
    Box::new(move |event| {
        if let Some(shared) = weak.upgrade() {
            on_root_document(&shared, &key, epoch, event);
        }
    })
}

fn root_collection_callback(shared: &Arc<Shared>, key: &str, epoch: u64) -> CollectionCallback {
    let weak = Arc::downgrade(shared);
    let key = key.to_string();
    Box::new(move |event| {
        if let Some(shared) = weak.upgrade() {
            on_root_collection(&shared, &key, epoch, event);
        }
    })
}

fn reference_callback(
    shared: &Arc<Shared>,
    key: &str,
    epoch: u64,
    path: &FieldPath,
    generation: u64,
) -> DocumentCallback {
    let weak = Arc::downgrade(shared);
    let key = key.to_string();
    let path = path.clone();
    Box::new(move |event| {
        if let Some(shared) = weak.upgrade() {
            on_reference(&shared, &key, epoch, &path, generation, event);
        }
    })
}

fn on_root_document(shared: &Arc<Shared>, key: &str, epoch: u64, event: DocumentEvent) {
    let snapshot = match event {
        DocumentEvent::Snapshot(snapshot) => snapshot,
        DocumentEvent::Failed(message) => {
            on_source_failure(shared, key, epoch, message);
            return;
        }
    };

    let effects = {
        let mut bindings = shared.bindings.lock();
        let Some(binding) = bindings.get_mut(key) else {
            return;
        };
        if binding.epoch != epoch {
            return;
        }

        let RootBinding {
            registry,
            value,
            pending,
            root_received,
            ..
        } = &mut *binding;
        let applied = {
            let old = match &*value {
                RootValue::Document(old) => Some(old),
                RootValue::Collection(_) => None,
            };
            resolve::apply_document(registry, &FieldPath::root(), &snapshot, old)
        };
        *value = RootValue::Document(applied.value);
        *pending += applied.pending_added;
        *pending -= applied.pending_removed;
        *root_received = true;

        maybe_settle(key, binding);
        applied.effects
    };
    execute_effects(shared, key, epoch, effects);
}

fn on_root_collection(shared: &Arc<Shared>, key: &str, epoch: u64, event: CollectionEvent) {
    let snapshot = match event {
        CollectionEvent::Snapshot(snapshot) => snapshot,
        CollectionEvent::Failed(message) => {
            on_source_failure(shared, key, epoch, message);
            return;
        }
    };

    let effects = {
        let mut bindings = shared.bindings.lock();
        let Some(binding) = bindings.get_mut(key) else {
            return;
        };
        if binding.epoch != epoch {
            return;
        }

        let RootBinding {
            registry,
            value,
            pending,
            root_received,
            ..
        } = &mut *binding;
        let RootValue::Collection(members) = value else {
            return;
        };
        let applied = resolve::apply_collection(registry, &snapshot, members);
        *members = applied.members;
        *pending += applied.pending_added;
        *pending -= applied.pending_removed;
        *root_received = true;

        maybe_settle(key, binding);
        applied.effects
    };
    execute_effects(shared, key, epoch, effects);
}

fn on_reference(
    shared: &Arc<Shared>,
    key: &str,
    epoch: u64,
    path: &FieldPath,
    generation: u64,
    event: DocumentEvent,
) {
    let snapshot = match event {
        DocumentEvent::Snapshot(snapshot) => snapshot,
        DocumentEvent::Failed(message) => {
            let current = shared
                .bindings
                .lock()
                .get(key)
                .is_some_and(|b| b.epoch == epoch && b.registry.is_current(path, generation));
            if current {
                on_source_failure(shared, key, epoch, message);
            }
            return;
        }
    };

    let effects = {
        let mut bindings = shared.bindings.lock();
        let Some(binding) = bindings.get_mut(key) else {
            return;
        };
        if binding.epoch != epoch {
            return;
        }
        if !binding.registry.is_current(path, generation) {
            trace!(key, %path, generation, "discarding superseded snapshot");
            return;
        }

        let RootBinding {
            registry,
            value,
            pending,
            ..
        } = &mut *binding;
        if registry.mark_received(path) {
            *pending -= 1;
        }
        let applied = {
            let old = value_at(value, path);
            resolve::apply_document(registry, path, &snapshot, old)
        };
        *pending += applied.pending_added;
        *pending -= applied.pending_removed;
        if !set_value_at(value, path, applied.value) {
            trace!(key, %path, "bound path vanished before snapshot applied");
        }

        maybe_settle(key, binding);
        applied.effects
    };
    execute_effects(shared, key, epoch, effects);
}

/// Pre-settle source failures reject the waiting bind and tear the binding
/// down; post-settle failures are the source's own problem.
fn on_source_failure(shared: &Arc<Shared>, key: &str, epoch: u64, message: String) {
    let binding = {
        let mut bindings = shared.bindings.lock();
        let settled = match bindings.get(key) {
            Some(binding) if binding.epoch == epoch => binding.settle.is_none(),
            _ => return,
        };
        if settled {
            warn!(key, %message, "snapshot source failure after settle; ignoring");
            return;
        }
        bindings.remove(key)
    };
    let Some(mut binding) = binding else { return };
    warn!(key, %message, "snapshot source failure before settle; releasing binding");
    if let Some(settle) = binding.settle.take() {
        let _ = settle.send(Err(BindError::SourceFailure(message)));
    }
    for handle in binding.release_all() {
        shared.source.unsubscribe(handle);
    }
}

fn maybe_settle(key: &str, binding: &mut RootBinding) {
    if binding.root_received && binding.pending == 0 {
        if let Some(settle) = binding.settle.take() {
            debug!(key, subscriptions = binding.registry.len(), "binding settled");
            let _ = settle.send(Ok(binding.resolved_value()));
        }
    }
}

/// Run subscribe/unsubscribe effects with no lock held. A subscribe whose
/// path was superseded while in flight is released immediately.
fn execute_effects(shared: &Arc<Shared>, key: &str, epoch: u64, effects: Vec<SideEffect>) {
    for effect in effects {
        match effect {
            SideEffect::Unsubscribe(handle) => shared.source.unsubscribe(handle),
            SideEffect::Subscribe {
                path,
                target,
                generation,
            } => {
                let callback = reference_callback(shared, key, epoch, &path, generation);
                let handle = shared.source.subscribe_document(&target, callback);
                let keep = {
                    let mut bindings = shared.bindings.lock();
                    bindings.get_mut(key).is_some_and(|binding| {
                        binding.epoch == epoch
                            && binding.registry.set_handle(&path, generation, handle)
                    })
                };
                if !keep {
                    shared.source.unsubscribe(handle);
                }
            }
        }
    }
}

fn value_at<'a>(root: &'a RootValue, path: &FieldPath) -> Option<&'a Value> {
    let mut segments = path.segments().iter();
    let mut current: &Value = match root {
        RootValue::Document(value) => value,
        RootValue::Collection(members) => match segments.next()? {
            PathSegment::Doc(id) => members.iter().find(|(m, _)| m == id).map(|(_, v)| v)?,
            _ => return None,
        },
    };
    for segment in segments {
        current = match segment {
            PathSegment::Field(key) => current.get(key.as_str())?,
            PathSegment::Index(i) => current.get(*i)?,
            PathSegment::Doc(_) => return None,
        };
    }
    Some(current)
}

fn set_value_at(root: &mut RootValue, path: &FieldPath, new: Value) -> bool {
    let mut segments = path.segments().iter();
    let mut current: &mut Value = match root {
        RootValue::Document(value) => value,
        RootValue::Collection(members) => match segments.next() {
            Some(PathSegment::Doc(id)) => {
                match members.iter_mut().find(|(m, _)| m == id) {
                    Some((_, value)) => value,
                    None => return false,
                }
            }
            _ => return false,
        },
    };
    for segment in segments {
        let next = match segment {
            PathSegment::Field(key) => current.get_mut(key.as_str()),
            PathSegment::Index(i) => current.get_mut(*i),
            PathSegment::Doc(_) => None,
        };
        match next {
            Some(value) => current = value,
            None => return false,
        }
    }
    *current = new;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::types::{CollectionId, RawFields, RawValue};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> RawFields {
        RawValue::from(value).into_object().expect("object payload")
    }

    #[test]
    fn test_bind_plain_document() {
        let source = Arc::new(MemorySource::new());
        let binder = Binder::new(source.clone());
        let a = DocumentId::new("items", "a");
        source.set(&a, fields(json!({"isA": true})));

        let resolved = binder.bind("a", a).unwrap();
        assert_eq!(resolved, json!({"isA": true}));
        assert_eq!(binder.resolved("a").unwrap(), json!({"isA": true}));
    }

    #[test]
    fn test_bind_invalid_path_does_not_subscribe() {
        let source = Arc::new(MemorySource::new());
        let binder = Binder::new(source.clone());

        let result = binder.bind_path("x", "items//a");
        assert!(matches!(result, Err(BindError::InvalidSource(_))));
        assert!(source.ops().is_empty());
        assert!(!binder.is_bound("x"));
    }

    #[test]
    fn test_unbind_unknown_key_is_noop() {
        let source = Arc::new(MemorySource::new());
        let binder = Binder::new(source.clone());
        binder.unbind("missing");
        assert!(source.ops().is_empty());
    }

    #[test]
    fn test_rebind_replaces_prior_binding() {
        let source = Arc::new(MemorySource::new());
        let binder = Binder::new(source.clone());
        let a = DocumentId::new("items", "a");
        let b = DocumentId::new("items", "b");
        source.set(&a, fields(json!({"isA": true})));
        source.set(&b, fields(json!({"isB": true})));

        binder.bind("item", a.clone()).unwrap();
        binder.bind("item", b).unwrap();

        assert_eq!(binder.resolved("item").unwrap(), json!({"isB": true}));
        assert_eq!(source.unsubscribe_count(&a), 1);
        assert_eq!(binder.binding_count(), 1);
    }

    #[test]
    fn test_drop_releases_bindings() {
        let source = Arc::new(MemorySource::new());
        let a = DocumentId::new("items", "a");
        source.set(&a, fields(json!({"isA": true})));
        {
            let binder = Binder::new(source.clone());
            binder.bind("a", a).unwrap();
            binder
                .bind("all", CollectionId::from("items"))
                .unwrap();
            assert_eq!(source.active_subscriptions(), 2);
        }
        assert_eq!(source.active_subscriptions(), 0);
    }
}
