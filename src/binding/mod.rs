//! Reference-resolving binding engine.
//!
//! This module turns live document/collection streams into plain nested
//! values:
//! - Reference fields are replaced by the live resolved value of their
//!   target document, recursively
//! - A target that does not exist resolves to `null` (a defined state,
//!   distinct from "not yet resolved")
//! - Every spawned subscription is owned by exactly one field path and is
//!   released exactly once, on replacement, removal, or unbind
//!
//! # Example
//!
//! ```ignore
//! let source = Arc::new(MemorySource::new());
//! let binder = Binder::new(source.clone());
//!
//! // Settles once d and the documents its references point at have all
//! // delivered a snapshot.
//! let resolved = binder.bind("d", DocumentId::new("items", "d"))?;
//!
//! // The bound value keeps tracking the source afterwards.
//! let current = binder.resolved("d");
//! binder.unbind("d");
//! ```

mod binder;
mod registry;
mod resolve;

pub use binder::Binder;
pub use resolve::{classify, FieldClass};
