//! Snapshot source abstraction.
//!
//! The engine consumes exactly three primitives from the database client:
//! subscribe to a document, subscribe to a collection, unsubscribe. Every
//! subscription must deliver an initial snapshot; later snapshots arrive on
//! change. The engine never writes through this interface.

mod memory;

pub use memory::{MemorySource, SourceOp};

use crate::types::{CollectionId, CollectionSnapshot, DocumentId, DocumentSnapshot};
use std::fmt;

/// Unique identifier for one active subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

/// Events delivered to document subscriptions.
#[derive(Clone, Debug)]
pub enum DocumentEvent {
    Snapshot(DocumentSnapshot),

    /// Transport-level failure from the underlying client.
    Failed(String),
}

/// Events delivered to collection subscriptions.
#[derive(Clone, Debug)]
pub enum CollectionEvent {
    Snapshot(CollectionSnapshot),
    Failed(String),
}

pub type DocumentCallback = Box<dyn FnMut(DocumentEvent) + Send>;
pub type CollectionCallback = Box<dyn FnMut(CollectionEvent) + Send>;

/// Read-path primitives the engine needs from the database client.
///
/// Implementations may invoke the callback synchronously from inside
/// `subscribe_*`; the engine never holds its own lock across these calls.
pub trait SnapshotSource: Send + Sync {
    fn subscribe_document(&self, id: &DocumentId, callback: DocumentCallback) -> SubscriptionId;

    fn subscribe_collection(
        &self,
        id: &CollectionId,
        callback: CollectionCallback,
    ) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}
