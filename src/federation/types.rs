//! Shared serde shapes for ActivityStreams properties

use serde::Deserialize;

/// A property that is either a bare IRI or an embedded object with an `id`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IdRef {
    Id(String),
    Object { id: String },
}

impl IdRef {
    pub fn id(&self) -> &str {
        match self {
            IdRef::Id(id) => id,
            IdRef::Object { id } => id,
        }
    }
}

/// A property that may hold one value or an array of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}
