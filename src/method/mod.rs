//! Protocol method model.
//!
//! - [`field`] - argument types, field tables and their wire encoding
//! - [`types`] - static per-method descriptors grouped by protocol class
//! - [`instance`] - decoded methods with typed accessors
//! - [`registry`] - `(class_id, method_id)` lookup and the payload codec

pub mod field;
pub mod instance;
pub mod registry;
pub mod types;

pub use field::{FieldTable, FieldType, FieldValue, TableValue};
pub use instance::MethodInstance;
pub use registry::{MethodRegistry, MethodRegistryBuilder};
pub use types::{FieldSpec, MethodKind, MethodType, ProtocolClass};
