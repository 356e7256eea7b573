//! # Live Bindings
//!
//! A reactive-binding engine that mirrors live document and collection
//! streams onto plain nested values, resolving cross-document references
//! into inline data and managing the lifecycle of every subscription it
//! spawns.
//!
//! ## Core Concepts
//!
//! - **Snapshot source**: the database client, reduced to subscribe /
//!   callback / unsubscribe read-path primitives
//! - **Reference resolution**: a reference field is replaced by its target's
//!   live resolved value, or `null` while unresolved or when the target does
//!   not exist
//! - **Subscription registry**: per-binding, path-keyed ownership of every
//!   spawned subscription, with generation tokens that silently drop
//!   callbacks from superseded subscriptions
//! - **Bind/unbind**: `bind` blocks until the root snapshot and every
//!   reference it transitively spawned have settled; `unbind` releases the
//!   whole subscription tree exactly once
//!
//! ## Example
//!
//! ```ignore
//! use livebind::{Binder, DocumentId, MemorySource, RawValue};
//! use std::sync::Arc;
//!
//! let source = Arc::new(MemorySource::new());
//! let binder = Binder::new(source.clone());
//!
//! let profile = binder.bind_path("profile", "users/alice")?;
//! // profile mirrors users/alice with reference fields expanded inline
//! binder.unbind("profile");
//! ```

pub mod binding;
pub mod error;
pub mod source;
pub mod types;

// Re-exports
pub use binding::{classify, Binder, FieldClass};
pub use error::{BindError, Result};
pub use source::{
    CollectionCallback, CollectionEvent, DocumentCallback, DocumentEvent, MemorySource,
    SnapshotSource, SourceOp, SubscriptionId,
};
pub use types::{
    BindSource, CollectionId, CollectionSnapshot, DocumentId, DocumentSnapshot, FieldPath,
    PathSegment, RawFields, RawValue,
};
