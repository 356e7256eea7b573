//! In-memory document database with live snapshots.
//!
//! Stands in for a real database client: document writes broadcast snapshots
//! to active subscribers, and collection snapshots list members ordered by
//! document id. Per-document subscribe/unsubscribe counters, an operation
//! log, and a hold/release delivery gate make subscription lifecycles and
//! late-callback races observable from tests.

use crate::source::{
    CollectionCallback, CollectionEvent, DocumentCallback, DocumentEvent, SnapshotSource,
    SubscriptionId,
};
use crate::types::{CollectionId, CollectionSnapshot, DocumentId, DocumentSnapshot, RawFields};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// One recorded subscribe/unsubscribe call, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceOp {
    SubscribeDocument(DocumentId),
    UnsubscribeDocument(DocumentId),
    SubscribeCollection(CollectionId),
    UnsubscribeCollection(CollectionId),
}

struct DocSubscriber {
    target: DocumentId,
    callback: Arc<Mutex<DocumentCallback>>,
}

struct CollSubscriber {
    target: CollectionId,
    callback: Arc<Mutex<CollectionCallback>>,
}

enum Delivery {
    Document(Arc<Mutex<DocumentCallback>>, DocumentEvent),
    Collection(Arc<Mutex<CollectionCallback>>, CollectionEvent),
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<DocumentId, RawFields>,
    doc_subs: HashMap<SubscriptionId, DocSubscriber>,
    coll_subs: HashMap<SubscriptionId, CollSubscriber>,
    next_id: u64,
    subscribes: HashMap<DocumentId, usize>,
    unsubscribes: HashMap<DocumentId, usize>,
    ops: Vec<SourceOp>,
    /// Documents whose snapshot deliveries are queued instead of invoked.
    held: HashSet<DocumentId>,
    held_events: Vec<(Arc<Mutex<DocumentCallback>>, DocumentEvent)>,
}

impl Inner {
    fn document_snapshot(&self, id: &DocumentId) -> DocumentSnapshot {
        match self.docs.get(id) {
            Some(fields) => DocumentSnapshot::existing(id.clone(), fields.clone()),
            None => DocumentSnapshot::missing(id.clone()),
        }
    }

    fn collection_snapshot(&self, id: &CollectionId) -> CollectionSnapshot {
        // BTreeMap keys sort by (collection, id), so members come out ordered
        // by document id.
        let docs = self
            .docs
            .iter()
            .filter(|(doc_id, _)| doc_id.collection == *id)
            .map(|(doc_id, fields)| DocumentSnapshot::existing(doc_id.clone(), fields.clone()))
            .collect();
        CollectionSnapshot {
            id: id.clone(),
            docs,
        }
    }

    /// Deliveries caused by a change to `id`, honoring the hold gate.
    fn changed(&mut self, id: &DocumentId) -> Vec<Delivery> {
        let snapshot = self.document_snapshot(id);
        let doc_callbacks: Vec<Arc<Mutex<DocumentCallback>>> = self
            .doc_subs
            .values()
            .filter(|s| s.target == *id)
            .map(|s| Arc::clone(&s.callback))
            .collect();

        let mut out = Vec::new();
        if self.held.contains(id) {
            for callback in doc_callbacks {
                self.held_events
                    .push((callback, DocumentEvent::Snapshot(snapshot.clone())));
            }
        } else {
            for callback in doc_callbacks {
                out.push(Delivery::Document(
                    callback,
                    DocumentEvent::Snapshot(snapshot.clone()),
                ));
            }
        }

        if self.coll_subs.values().any(|s| s.target == id.collection) {
            let coll_snapshot = self.collection_snapshot(&id.collection);
            for sub in self.coll_subs.values().filter(|s| s.target == id.collection) {
                out.push(Delivery::Collection(
                    Arc::clone(&sub.callback),
                    CollectionEvent::Snapshot(coll_snapshot.clone()),
                ));
            }
        }
        out
    }
}

/// In-memory implementation of [`SnapshotSource`].
pub struct MemorySource {
    inner: Mutex<Inner>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Replace a document's fields, creating it if missing.
    pub fn set(&self, id: &DocumentId, fields: RawFields) {
        let deliveries = {
            let mut inner = self.inner.lock();
            inner.docs.insert(id.clone(), fields);
            inner.changed(id)
        };
        deliver(deliveries);
    }

    /// Merge top-level fields into a document, creating it if missing.
    pub fn update(&self, id: &DocumentId, fields: RawFields) {
        let deliveries = {
            let mut inner = self.inner.lock();
            inner.docs.entry(id.clone()).or_default().extend(fields);
            inner.changed(id)
        };
        deliver(deliveries);
    }

    /// Delete a document; subscribers see an `exists: false` snapshot.
    pub fn delete(&self, id: &DocumentId) {
        let deliveries = {
            let mut inner = self.inner.lock();
            inner.docs.remove(id);
            inner.changed(id)
        };
        deliver(deliveries);
    }

    /// Deliver a transport failure to every subscriber of `id`.
    pub fn fail_document(&self, id: &DocumentId, message: &str) {
        let deliveries: Vec<Delivery> = {
            let inner = self.inner.lock();
            inner
                .doc_subs
                .values()
                .filter(|s| s.target == *id)
                .map(|s| {
                    Delivery::Document(
                        Arc::clone(&s.callback),
                        DocumentEvent::Failed(message.to_string()),
                    )
                })
                .collect()
        };
        deliver(deliveries);
    }

    /// Queue snapshot deliveries for `id` until [`release_held`] is called.
    ///
    /// Queued events are delivered even if their subscription has been
    /// released in the meantime, simulating a callback already in flight when
    /// the unsubscribe happened.
    ///
    /// [`release_held`]: MemorySource::release_held
    pub fn hold(&self, id: &DocumentId) {
        self.inner.lock().held.insert(id.clone());
    }

    /// Deliver every queued event and stop holding.
    pub fn release_held(&self) {
        let deliveries: Vec<Delivery> = {
            let mut inner = self.inner.lock();
            inner.held.clear();
            inner
                .held_events
                .drain(..)
                .map(|(callback, event)| Delivery::Document(callback, event))
                .collect()
        };
        deliver(deliveries);
    }

    pub fn subscribe_count(&self, id: &DocumentId) -> usize {
        self.inner.lock().subscribes.get(id).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, id: &DocumentId) -> usize {
        self.inner.lock().unsubscribes.get(id).copied().unwrap_or(0)
    }

    pub fn active_subscriptions(&self) -> usize {
        let inner = self.inner.lock();
        inner.doc_subs.len() + inner.coll_subs.len()
    }

    /// Every subscribe/unsubscribe call so far, in call order.
    pub fn ops(&self) -> Vec<SourceOp> {
        self.inner.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        match delivery {
            Delivery::Document(callback, event) => (*callback.lock())(event),
            Delivery::Collection(callback, event) => (*callback.lock())(event),
        }
    }
}

impl SnapshotSource for MemorySource {
    fn subscribe_document(&self, id: &DocumentId, callback: DocumentCallback) -> SubscriptionId {
        let (sid, initial) = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let sid = SubscriptionId(inner.next_id);
            *inner.subscribes.entry(id.clone()).or_insert(0) += 1;
            inner.ops.push(SourceOp::SubscribeDocument(id.clone()));

            let callback = Arc::new(Mutex::new(callback));
            inner.doc_subs.insert(
                sid,
                DocSubscriber {
                    target: id.clone(),
                    callback: Arc::clone(&callback),
                },
            );

            let event = DocumentEvent::Snapshot(inner.document_snapshot(id));
            if inner.held.contains(id) {
                inner.held_events.push((callback, event));
                (sid, None)
            } else {
                (sid, Some((callback, event)))
            }
        };
        if let Some((callback, event)) = initial {
            (*callback.lock())(event);
        }
        sid
    }

    fn subscribe_collection(
        &self,
        id: &CollectionId,
        callback: CollectionCallback,
    ) -> SubscriptionId {
        let (sid, callback, event) = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let sid = SubscriptionId(inner.next_id);
            inner.ops.push(SourceOp::SubscribeCollection(id.clone()));

            let callback = Arc::new(Mutex::new(callback));
            inner.coll_subs.insert(
                sid,
                CollSubscriber {
                    target: id.clone(),
                    callback: Arc::clone(&callback),
                },
            );

            let event = CollectionEvent::Snapshot(inner.collection_snapshot(id));
            (sid, callback, event)
        };
        (*callback.lock())(event);
        sid
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        if let Some(sub) = inner.doc_subs.remove(&id) {
            *inner.unsubscribes.entry(sub.target.clone()).or_insert(0) += 1;
            inner.ops.push(SourceOp::UnsubscribeDocument(sub.target));
        } else if let Some(sub) = inner.coll_subs.remove(&id) {
            inner.ops.push(SourceOp::UnsubscribeCollection(sub.target));
        }
    }
}
