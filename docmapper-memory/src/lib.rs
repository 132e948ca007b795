//! In-memory document store driver for docmapper.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreDriver` trait.
//! It uses async-aware read-write locks for concurrent access and is ideal for development,
//! testing, and small-scale deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Store filter language** - Comparison, logical, array, regex and legacy geo operators
//! - **Update operators** - `$set`, `$inc`, `$push`, `$pushAll`, `$addToSet`, `$pull`, positional `$` and more
//! - **Aggregation** - `$match`, `$project`, `$sort`, `$group`, `$unwind` and `$lookup` stages
//! - **Unique indexes** - Enforced on insert, update and replace
//!
//! # Quick Start
//!
//! ```ignore
//! use docmapper::{Session, SessionConfig, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryStore::builder().build().await?;
//!     let mut session = Session::new(store, SessionConfig::default());
//!
//!     session.insert(Entity::create(users.clone(), [("name", "Alice")])?)?;
//!     session.commit().await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_memory;

mod evaluator;
mod modifier;
mod pipeline;
pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
