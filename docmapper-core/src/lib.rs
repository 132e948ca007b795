//! A typed object-document mapper with a unit-of-work session for JSON/BSON document stores.
//!
//! This crate is the core of the docmapper project and provides:
//!
//! - **Values** ([`value`]) - The native value model entities hold
//! - **Field codecs** ([`field`], [`kind`]) - Validation and native/wire conversion per field
//! - **Schemas** ([`schema`], [`registry`]) - Document types, inheritance and polymorphic loading
//! - **Entities** ([`entity`]) - Field storage with per-field dirty tracking
//! - **Queries** ([`query`], [`update`], [`aggregation`]) - Compilation of typed expressions to store filters and update documents
//! - **Store drivers** ([`driver`]) - The trait every document store backend implements
//! - **Sessions** ([`session`], [`operation`]) - Unit of work, identity cache and compensating commit
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::{field::FieldDescriptor, kind::IntKind, schema::DocumentSchema};
//!
//! let bots = DocumentSchema::builder("Bot")
//!     .field(FieldDescriptor::new("name", StringKind::new().max_length(32)))
//!     .field(FieldDescriptor::new("age", IntKind::new().min(0)))
//!     .register()?;
//!
//! let mut session = Session::new(store, SessionConfig::default());
//! session.insert(Entity::create(bots.clone(), [("name", Value::from("Bot")), ("age", 5.into())])?)?;
//! session.commit().await?;
//!
//! let age = bots.field_path("age")?;
//! let bot = session.one(&Query::new(&bots).filter(age.eq(5)?)?).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_core;

pub mod aggregation;
mod cache;
pub mod config;
pub mod driver;
pub mod entity;
pub mod error;
pub mod field;
pub mod kind;
pub mod operation;
pub mod query;
pub mod registry;
pub mod schema;
pub mod session;
pub mod update;
pub mod value;

pub use aggregation::Aggregation;
pub use config::{PartialWritePolicy, SessionConfig};
pub use driver::{FindOptions, StoreDriver, StoreDriverBuilder, UpdateOutcome, WriteModel, WriteOutcome};
pub use entity::{Entity, SharedEntity};
pub use error::{MapperError, MapperResult};
pub use field::{FieldDescriptor, FieldKind, Modifier, OnUpdate};
pub use query::{Query, QueryExpression, QueryField, RemoveQuery};
pub use schema::{DocumentSchema, IndexSpec, SortOrder};
pub use session::{CancelHandle, Session, SessionFactory, UpdateOptions};
pub use update::UpdateExpression;
pub use value::{Reference, Value};
