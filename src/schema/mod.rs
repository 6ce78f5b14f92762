// Schema graph: field registry, values, node arena and containers.
//
// # Modules
//
// - `types`      — Field tables (`SchemaType`) and the `TypeRegistry`
// - `value`      — Field/item values; nested nodes are `RefId` handles
// - `document`   — Node arena, structure instances, projection, clone
// - `collection` — Container storage and its mutating view

pub mod collection;
pub mod document;
pub mod types;
pub mod value;

use thiserror::Error;

use crate::changes::RefId;

pub use collection::{Collection, CollectionMut, ContainerKind};
pub use document::{Callback, CallbackKind, CallbackResult, Document, NodeType};
pub use types::{
    ChildType, FieldDef, FieldType, PrimitiveType, SchemaBuilder, SchemaType, TypeId,
    TypeRegistry,
};
pub use value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown schema type {0:?}")]
    UnknownType(TypeId),
    #[error("schema type `{0}` is declared but not defined")]
    UndefinedType(String),
    #[error("type `{type_name}` has no field `{field}`")]
    UnknownField { type_name: String, field: String },
    #[error("unknown node {0}")]
    UnknownNode(RefId),
    #[error("node {0} is not a structure instance")]
    NotAnInstance(RefId),
    #[error("node {0} is not a container")]
    NotAContainer(RefId),
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("node {0} is already attached to a parent")]
    AlreadyAttached(RefId),
    #[error("attaching node {0} would create a cycle")]
    Cycle(RefId),
    #[error("container {0} has no identities left")]
    IdentitiesExhausted(RefId),
}
