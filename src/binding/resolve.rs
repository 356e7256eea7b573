//! Field classification and reference-expanding resolution.
//!
//! `apply_document` runs once per snapshot callback: it rebuilds the resolved
//! value for the payload, diffs the payload's reference fields against the
//! registry, and emits the subscribe/unsubscribe side effects the caller
//! executes after releasing the engine lock.

use crate::binding::registry::{RefSubscription, SubscriptionRegistry};
use crate::source::SubscriptionId;
use crate::types::{CollectionSnapshot, DocumentId, DocumentSnapshot, FieldPath, RawFields, RawValue};
use serde_json::Value;
use std::collections::HashSet;
use tracing::trace;

/// Classification of one raw field value, evaluated once per field per
/// snapshot. `Reference` matches only the source's tagged reference type.
pub enum FieldClass<'a> {
    /// Copied into the bound tree as-is.
    Primitive(Value),
    /// Walked recursively, path-qualified by field key.
    Object(&'a RawFields),
    /// Walked recursively, path-qualified by position.
    Array(&'a [RawValue]),
    /// Expanded into the target's live resolved value.
    Reference(&'a DocumentId),
}

/// Classify a raw value. Pure; no side effects.
pub fn classify(value: &RawValue) -> FieldClass<'_> {
    match value {
        RawValue::Reference(id) => FieldClass::Reference(id),
        RawValue::Object(fields) => FieldClass::Object(fields),
        RawValue::Array(items) => FieldClass::Array(items),
        RawValue::Null => FieldClass::Primitive(Value::Null),
        RawValue::Bool(b) => FieldClass::Primitive(Value::Bool(*b)),
        RawValue::Number(n) => FieldClass::Primitive(Value::Number(n.clone())),
        RawValue::Text(s) => FieldClass::Primitive(Value::String(s.clone())),
    }
}

/// Subscription calls produced while applying a snapshot under the engine
/// lock; executed only after the lock is released.
#[derive(Debug)]
pub(crate) enum SideEffect {
    Subscribe {
        path: FieldPath,
        target: DocumentId,
        generation: u64,
    },
    Unsubscribe(SubscriptionId),
}

/// Result of applying one document snapshot.
pub(crate) struct Applied {
    pub value: Value,
    pub effects: Vec<SideEffect>,
    /// Reference subscriptions created, each awaiting a first snapshot.
    pub pending_added: usize,
    /// Subscriptions torn down before their first snapshot arrived.
    pub pending_removed: usize,
}

/// Result of applying one collection snapshot.
pub(crate) struct CollectionApplied {
    pub members: Vec<(DocumentId, Value)>,
    pub effects: Vec<SideEffect>,
    pub pending_added: usize,
    pub pending_removed: usize,
}

/// Apply a document snapshot rooted at `base`.
///
/// `old` is the resolved value previously bound at `base`; unchanged
/// references reuse their slice of it so a re-snapshot of the parent never
/// disturbs a live reference subscription.
pub(crate) fn apply_document(
    registry: &mut SubscriptionRegistry,
    base: &FieldPath,
    snapshot: &DocumentSnapshot,
    old: Option<&Value>,
) -> Applied {
    let mut resolver = Resolver::new(registry);
    let value = if snapshot.exists {
        let resolved = resolver.resolve_fields(base, &snapshot.fields, old);
        resolver.release_stale(base);
        resolved
    } else {
        // The document is gone: everything spawned beneath it goes too. The
        // subscription at `base` itself belongs to the parent payload and
        // stays, so a re-created document resolves again.
        resolver.release_subtree(base, false);
        Value::Null
    };
    Applied {
        value,
        effects: resolver.effects,
        pending_added: resolver.pending_added,
        pending_removed: resolver.pending_removed,
    }
}

/// Apply a collection snapshot, reconciling members by document identity.
pub(crate) fn apply_collection(
    registry: &mut SubscriptionRegistry,
    snapshot: &CollectionSnapshot,
    old_members: &[(DocumentId, Value)],
) -> CollectionApplied {
    let mut resolver = Resolver::new(registry);

    // Removed members first, so their unsubscribes precede any subscribes.
    let new_ids: HashSet<&DocumentId> = snapshot.docs.iter().map(|d| &d.id).collect();
    for (id, _) in old_members.iter().filter(|(id, _)| !new_ids.contains(id)) {
        resolver.release_subtree(&FieldPath::root().doc(id.clone()), true);
    }

    let mut members = Vec::with_capacity(snapshot.docs.len());
    for doc in &snapshot.docs {
        let base = FieldPath::root().doc(doc.id.clone());
        let old = old_members
            .iter()
            .find(|(id, _)| id == &doc.id)
            .map(|(_, value)| value);
        let value = if doc.exists {
            let resolved = resolver.resolve_fields(&base, &doc.fields, old);
            resolver.release_stale(&base);
            resolved
        } else {
            resolver.release_subtree(&base, false);
            Value::Null
        };
        members.push((doc.id.clone(), value));
    }

    CollectionApplied {
        members,
        effects: resolver.effects,
        pending_added: resolver.pending_added,
        pending_removed: resolver.pending_removed,
    }
}

struct Resolver<'a> {
    registry: &'a mut SubscriptionRegistry,
    effects: Vec<SideEffect>,
    /// Reference paths seen in the payload being applied, kept or created.
    touched: HashSet<FieldPath>,
    pending_added: usize,
    pending_removed: usize,
}

impl<'a> Resolver<'a> {
    fn new(registry: &'a mut SubscriptionRegistry) -> Self {
        Self {
            registry,
            effects: Vec::new(),
            touched: HashSet::new(),
            pending_added: 0,
            pending_removed: 0,
        }
    }

    fn resolve_fields(&mut self, base: &FieldPath, fields: &RawFields, old: Option<&Value>) -> Value {
        let map: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(key, raw)| {
                let old_field = old.and_then(|v| v.get(key.as_str()));
                (
                    key.clone(),
                    self.resolve_value(base.field(key), raw, old_field),
                )
            })
            .collect();
        Value::Object(map)
    }

    fn resolve_value(&mut self, path: FieldPath, raw: &RawValue, old: Option<&Value>) -> Value {
        match classify(raw) {
            FieldClass::Primitive(value) => value,
            FieldClass::Object(fields) => self.resolve_fields(&path, fields, old),
            FieldClass::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        let old_item = old.and_then(|v| v.get(i));
                        self.resolve_value(path.index(i), item, old_item)
                    })
                    .collect(),
            ),
            FieldClass::Reference(target) => self.resolve_reference(path, target, old),
        }
    }

    fn resolve_reference(
        &mut self,
        path: FieldPath,
        target: &DocumentId,
        old: Option<&Value>,
    ) -> Value {
        if self
            .registry
            .get(&path)
            .is_some_and(|sub| sub.target == *target)
        {
            // Same identity at the same path: the live subscription keeps
            // feeding this slot, so reuse its current value untouched.
            self.touched.insert(path);
            return old.cloned().unwrap_or(Value::Null);
        }

        // Identity changed or fresh reference: the old subtree goes away
        // first, then the new subscription starts from a null placeholder.
        self.release_subtree(&path, true);

        let generation = self.registry.begin(&path, target.clone());
        self.effects.push(SideEffect::Subscribe {
            path: path.clone(),
            target: target.clone(),
            generation,
        });
        self.pending_added += 1;
        self.touched.insert(path);
        Value::Null
    }

    /// Release subscriptions under `base` whose paths no longer appear in the
    /// payload. Paths under a kept reference belong to that reference's own
    /// resolver and are left alone.
    fn release_stale(&mut self, base: &FieldPath) {
        let stale: Vec<FieldPath> = self
            .registry
            .paths()
            .filter(|p| {
                p.starts_with(base)
                    && **p != *base
                    && !self.touched.iter().any(|t| p.starts_with(t))
            })
            .cloned()
            .collect();
        for path in stale {
            if let Some(sub) = self.registry.release(&path) {
                self.drop_sub(&path, sub);
            }
        }
    }

    fn release_subtree(&mut self, base: &FieldPath, include_base: bool) {
        for (path, sub) in self.registry.release_subtree(base, include_base) {
            self.drop_sub(&path, sub);
        }
    }

    fn drop_sub(&mut self, path: &FieldPath, sub: RefSubscription) {
        trace!(%path, target = %sub.target, "releasing reference subscription");
        if !sub.received {
            self.pending_removed += 1;
        }
        if let Some(handle) = sub.handle {
            self.effects.push(SideEffect::Unsubscribe(handle));
        }
        // A sub without a handle has its subscribe still in flight; the
        // executor sees the bumped generation and releases it on return.
    }
}
