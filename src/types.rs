//! Core types for the binding engine.

use crate::error::{BindError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier for a collection in the snapshot source.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub String);

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionId({})", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        CollectionId(s.to_string())
    }
}

/// Identifier for a document: the collection it lives in plus its id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    pub collection: CollectionId,
    pub id: String,
}

impl DocumentId {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: CollectionId(collection.into()),
            id: id.into(),
        }
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({}/{})", self.collection, self.id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// One step into a bound value tree.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object field key.
    Field(String),

    /// Array position.
    Index(usize),

    /// Collection member, addressed by identity rather than position so
    /// reordering a collection does not invalidate paths beneath a member.
    Doc(DocumentId),
}

impl fmt::Debug for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(key) => write!(f, "Field({key})"),
            PathSegment::Index(i) => write!(f, "Index({i})"),
            PathSegment::Doc(id) => write!(f, "Doc({id})"),
        }
    }
}

/// Location of a field in a bound value tree, rooted at the binding.
///
/// Field paths key the subscription registry: every reference subscription is
/// owned by exactly one path, and releasing a subtree releases every
/// subscription whose path extends the subtree's base.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    /// The empty path, i.e. the binding's root value.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        FieldPath(segments)
    }

    pub fn field(&self, key: &str) -> Self {
        self.child(PathSegment::Field(key.to_string()))
    }

    pub fn index(&self, i: usize) -> Self {
        self.child(PathSegment::Index(i))
    }

    pub fn doc(&self, id: DocumentId) -> Self {
        self.child(PathSegment::Doc(id))
    }

    /// True when `prefix` is a (not necessarily proper) prefix of this path.
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl From<Vec<PathSegment>> for FieldPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        FieldPath(segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(root)");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(key) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{key}")?;
                }
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
                PathSegment::Doc(id) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "<{id}>")?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({self})")
    }
}

/// A raw field value as delivered by the snapshot source.
///
/// `Reference` is the database client's own reference type carried through as
/// an explicit tag; classification never falls back to shape inspection.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Array(Vec<RawValue>),
    Object(BTreeMap<String, RawValue>),
    Reference(DocumentId),
}

/// Top-level fields of a raw document payload.
pub type RawFields = BTreeMap<String, RawValue>;

impl RawValue {
    /// Extract the field map of an `Object` value.
    pub fn into_object(self) -> Option<RawFields> {
        match self {
            RawValue::Object(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(b),
            serde_json::Value::Number(n) => RawValue::Number(n),
            serde_json::Value::String(s) => RawValue::Text(s),
            serde_json::Value::Array(items) => {
                RawValue::Array(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                RawValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<DocumentId> for RawValue {
    fn from(id: DocumentId) -> Self {
        RawValue::Reference(id)
    }
}

/// One document's current state, delivered via callback on change.
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    pub id: DocumentId,

    /// False when the document does not exist; `fields` is empty then.
    pub exists: bool,

    pub fields: RawFields,
}

impl DocumentSnapshot {
    pub fn existing(id: DocumentId, fields: RawFields) -> Self {
        Self {
            id,
            exists: true,
            fields,
        }
    }

    pub fn missing(id: DocumentId) -> Self {
        Self {
            id,
            exists: false,
            fields: RawFields::new(),
        }
    }
}

/// An ordered view of a collection's members.
#[derive(Clone, Debug)]
pub struct CollectionSnapshot {
    pub id: CollectionId,

    /// Members in source order.
    pub docs: Vec<DocumentSnapshot>,
}

/// Target of a `bind` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindSource {
    Document(DocumentId),
    Collection(CollectionId),
}

impl BindSource {
    /// Parse a slash-separated path: an odd number of segments names a
    /// collection, an even number a document. Empty segments are invalid.
    pub fn parse(path: &str) -> Result<Self> {
        let segments: Vec<&str> = path.split('/').collect();
        if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(BindError::InvalidSource(path.to_string()));
        }
        if segments.len() % 2 == 1 {
            Ok(BindSource::Collection(CollectionId(path.to_string())))
        } else {
            match path.rsplit_once('/') {
                Some((collection, id)) => Ok(BindSource::Document(DocumentId::new(collection, id))),
                None => Err(BindError::InvalidSource(path.to_string())),
            }
        }
    }
}

impl From<DocumentId> for BindSource {
    fn from(id: DocumentId) -> Self {
        BindSource::Document(id)
    }
}

impl From<CollectionId> for BindSource {
    fn from(id: CollectionId) -> Self {
        BindSource::Collection(id)
    }
}

impl fmt::Display for BindSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindSource::Document(id) => write!(f, "{id}"),
            BindSource::Collection(id) => write!(f, "{id}"),
        }
    }
}
