use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted entity document: a flat mapping of field name to JSON value.
///
/// Field order carries no meaning. Nested objects and arrays are allowed as
/// values but the store never looks inside them.
pub type Document = serde_json::Map<String, Value>;

/// Reserved field holding the entity's stable identifier.
pub const ID_FIELD: &str = "id";

/// Reserved field holding the entity's current display name.
pub const NAME_FIELD: &str = "name";

/// Returns `true` for the two fields every document carries and no caller may delete.
#[must_use]
pub fn is_reserved_field(field: &str) -> bool {
    field == ID_FIELD || field == NAME_FIELD
}

/// The entity a document belongs to, as supplied by the caller on every operation.
///
/// `id()` doubles as the storage key, so it must be stable for the lifetime
/// of the entity. `name()` is refreshed into the document on every read and
/// may change between calls.
pub trait Identity {
    /// Stable identifier, also used as the document's storage key.
    fn id(&self) -> String;

    /// Current display name.
    fn name(&self) -> String;

    /// JSON value stamped into the `id` field. Defaults to the id string.
    fn id_value(&self) -> Value {
        Value::String(self.id())
    }
}

/// Plain owned [`Identity`] for callers without their own entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl EntityRef {
    /// Creates an entity reference from anything string-like.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl Identity for EntityRef {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl<T: Identity + ?Sized> Identity for &T {
    fn id(&self) -> String {
        (**self).id()
    }

    fn name(&self) -> String {
        (**self).name()
    }

    fn id_value(&self) -> Value {
        (**self).id_value()
    }
}
