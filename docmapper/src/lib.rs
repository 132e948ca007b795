//! Main docmapper crate: a typed object-document mapper for JSON/BSON document stores.
//!
//! This crate is the primary entry point for users of docmapper. It re-exports the core
//! types from `docmapper-core` and provides access to the available store drivers.
//!
//! # Features
//!
//! - **Typed schemas** - Declare document types with validated, convertible fields
//! - **Polymorphism** - Store a type hierarchy in one collection and load the right subtype
//! - **Compiled queries** - Build filters, sorts and updates against field paths
//! - **Unit of work** - Queue writes in a session and commit them all or nothing
//! - **Identity cache** - One in-memory entity per stored document within a session
//!
//! # Quick Start
//!
//! ```ignore
//! use docmapper::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> MapperResult<()> {
//!     let bots = DocumentSchema::builder("Bot")
//!         .field(FieldDescriptor::new("name", StringKind::new()))
//!         .field(FieldDescriptor::new("age", IntKind::new().min(0)))
//!         .register()?;
//!
//!     let mut session = Session::new(InMemoryStore::new(), SessionConfig::default());
//!
//!     session.insert(Entity::create(
//!         bots.clone(),
//!         [("name", Value::from("Wall-E")), ("age", Value::from(700))],
//!     )?)?;
//!     session.commit().await?;
//!
//!     let age = bots.field_path("age")?;
//!     let bot = session.one(&Query::new(&bots).filter(age.gt(100)?)?).await?;
//!     bot.write().set("age", 701)?;
//!     session.update(&bot)?;
//!     session.commit().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Transactions
//!
//! Scopes nest. Only the outermost scope commits; a failing scope undoes just its own
//! operations.
//!
//! ```ignore
//! session
//!     .transaction(|s| Box::pin(async move {
//!         s.add(&first)?;
//!         s.add(&second)?;
//!         Ok(())
//!     }))
//!     .await?;
//! ```
//!
//! # Drivers
//!
//! - [`memory`] - In-memory store for development and testing
//! - [`mongodb`] - MongoDB driver (requires the `mongodb` feature)

pub mod prelude;

pub use docmapper_core::{
    Aggregation, CancelHandle, DocumentSchema, Entity, FieldDescriptor, FieldKind, FindOptions, IndexSpec,
    MapperError, MapperResult, Modifier, OnUpdate, PartialWritePolicy, Query, QueryExpression, QueryField,
    Reference, RemoveQuery, Session, SessionConfig, SessionFactory, SharedEntity, SortOrder, StoreDriver,
    StoreDriverBuilder, UpdateExpression, UpdateOptions, UpdateOutcome, Value, WriteModel, WriteOutcome,
};
pub use docmapper_core::{
    aggregation, config, driver, entity, error, field, kind, operation, query, registry, schema, session, update,
    value,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory store driver.
pub mod memory {
    pub use docmapper_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB store driver.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmapper_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
