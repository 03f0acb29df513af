//! Default-field rules applied to every document on its way in and out of a store.
//!
//! [`DefaultFields`] wraps the `default_data` mapping a store is configured
//! with. Defaults are injected on read when missing and are protected from
//! deletion, together with the reserved `id` and `name` fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{is_reserved_field, Document, Identity, ID_FIELD, NAME_FIELD};

/// Fields guaranteed present on every document returned by a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultFields {
    fields: Document,
}

impl DefaultFields {
    /// Wraps a default-field mapping.
    #[must_use]
    pub fn new(fields: Document) -> Self {
        Self { fields }
    }

    /// The raw default mapping.
    #[must_use]
    pub fn fields(&self) -> &Document {
        &self.fields
    }

    /// Looks up a single default value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Builds the document for an entity that has never been written:
    /// every default plus the identity fields.
    #[must_use]
    pub fn fresh(&self, identity: &impl Identity) -> Document {
        let mut doc = self.fields.clone();
        stamp(&mut doc, identity);
        doc
    }

    /// Inserts every default that `doc` does not already carry.
    ///
    /// Present fields are left untouched, even when their value is `null`.
    pub fn backfill(&self, doc: &mut Document) {
        for (field, value) in &self.fields {
            if !doc.contains_key(field) {
                doc.insert(field.clone(), value.clone());
            }
        }
    }

    /// The read-side view of a stored document: defaults backfilled and
    /// identity fields overwritten with the caller's identity.
    #[must_use]
    pub fn materialize(&self, mut doc: Document, identity: &impl Identity) -> Document {
        self.backfill(&mut doc);
        stamp(&mut doc, identity);
        doc
    }

    /// Whether `field` may never be removed from a document.
    #[must_use]
    pub fn is_protected(&self, field: &str) -> bool {
        is_reserved_field(field) || self.fields.contains_key(field)
    }
}

impl From<Document> for DefaultFields {
    fn from(fields: Document) -> Self {
        Self::new(fields)
    }
}

/// Overwrites the reserved `id` and `name` fields with `identity`.
pub fn stamp(doc: &mut Document, identity: &impl Identity) {
    doc.insert(ID_FIELD.to_string(), identity.id_value());
    doc.insert(NAME_FIELD.to_string(), Value::String(identity.name()));
}

/// Shallow merge: every field of `partial` replaces the same field in `base`.
///
/// Nested objects are replaced wholesale, never merged recursively.
pub fn merge(base: &mut Document, partial: Document) {
    for (field, value) in partial {
        base.insert(field, value);
    }
}
