//! docstore core: the document model shared by stores and their callers.
//!
//! Defines [`Document`], the [`Identity`] callers hand to every operation,
//! and the [`DefaultFields`] rules that shape documents on read and protect
//! fields on delete.

pub mod defaults;
pub mod types;

pub use defaults::{merge, stamp, DefaultFields};
pub use types::{is_reserved_field, Document, EntityRef, Identity, ID_FIELD, NAME_FIELD};
