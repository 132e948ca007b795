//! Convenient re-exports of commonly used types from docmapper.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use docmapper::prelude::*;
//! ```
//!
//! This provides access to:
//! - Schemas, field descriptors and field kinds
//! - Entities and values
//! - Query, update and aggregation builders
//! - Sessions and store drivers
//! - Error types

pub use docmapper_core::{
    aggregation::Aggregation,
    config::{PartialWritePolicy, SessionConfig},
    driver::{FindOptions, StoreDriver, StoreDriverBuilder, UpdateOutcome, WriteModel, WriteOutcome},
    entity::{Entity, SharedEntity},
    error::{MapperError, MapperResult},
    field::{FieldDescriptor, FieldKind, Modifier, OnUpdate},
    kind::{
        AnyKind, BinaryKind, BoolKind, DateTimeKind, DictKind, DocumentKind, EnumKind, FloatKind, IntKind,
        KeyValueKind, ListKind, ObjectIdKind, ReferenceKind, SetKind, StringKind, TupleKind, UuidKind,
    },
    query::{Query, QueryExpression, QueryField, RemoveQuery},
    schema::{DocumentSchema, ExtraFields, IndexSpec, SortOrder},
    session::{CancelHandle, Session, SessionFactory, UpdateOptions},
    update::UpdateExpression,
    value::{Reference, Value},
};
