//! Record registry: type catalog, association metadata and the authoritative
//! record store.
//!
//! Polymorphic `belongs_to` references are `(type, id)` attribute pairs
//! resolved through the [`SchemaRegistry`]; an unregistered type is a
//! malformed reference, never an open-ended lookup.

mod index;
mod schema;
mod store;

pub use index::AssociationIndex;
pub use schema::{
    attribute_diff, AssociationDef, AssociationKind, AssociationTarget, JsonAttributes,
    ReferenceChange, SchemaRegistry, Through, TypeCapability, TypeDef,
};
pub use store::{CollectionMove, Committed, RecordStore};
