//! MongoDB driver for docmapper.
//!
//! This crate provides a MongoDB-based implementation of the `StoreDriver` trait.
//! Filters, updates and pipelines compiled by the session are passed to the server
//! as they are, after legacy operators are rewritten to their current names.
//!
//! To use this driver, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docmapper = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Atomicity
//!
//! Each call is atomic per document only. The session's compensating commit provides
//! all-or-nothing behavior on top of it; server-side transactions are not used.
//!
//! # Example
//!
//! ```ignore
//! use docmapper::{StoreDriverBuilder, Session, SessionConfig, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!     let mut session = Session::new(store, SessionConfig::default());
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_mongodb;

mod sanitizer;
pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
