//! Store driver abstraction.
//!
//! The session never talks to a database directly. Every store call goes through the
//! [`StoreDriver`] trait, which speaks the store's native vocabulary: filter, update,
//! projection, sort and pipeline documents produced by the query compiler.
//!
//! # Traits
//!
//! - [`StoreDriver`]: the async interface a store must implement
//! - [`StoreDriverBuilder`]: factory trait for creating driver instances
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::driver::{FindOptions, StoreDriver};
//! use bson::doc;
//!
//! let docs = driver
//!     .find("users", FindOptions::new(doc! { "age": { "$gt": 4 } }).with_limit(10))
//!     .await?;
//! ```

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::{
    error::{MapperError, MapperResult},
    schema::IndexSpec,
};

/// Parameters of a `find` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub filter: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub hint: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

impl FindOptions {
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_hint(mut self, hint: Document) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of an update or replace call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    /// Identity of the document created by an upsert.
    pub upserted_id: Option<Bson>,
}

/// One write of an ordered bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

/// Result of one [`WriteModel`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted,
    Updated(UpdateOutcome),
    Deleted(u64),
}

/// Applies a single write model through the driver's individual calls.
pub async fn apply_model<D>(driver: &D, collection: &str, model: WriteModel) -> MapperResult<WriteOutcome>
where
    D: StoreDriver + ?Sized,
{
    match model {
        WriteModel::InsertOne { document } => {
            driver.insert_one(collection, document).await?;
            Ok(WriteOutcome::Inserted)
        }
        WriteModel::UpdateOne { filter, update, upsert } => driver
            .update_one(collection, filter, update, upsert)
            .await
            .map(WriteOutcome::Updated),
        WriteModel::UpdateMany { filter, update, upsert } => driver
            .update_many(collection, filter, update, upsert)
            .await
            .map(WriteOutcome::Updated),
        WriteModel::ReplaceOne { filter, replacement, upsert } => driver
            .replace_one(collection, filter, replacement, upsert)
            .await
            .map(WriteOutcome::Updated),
        WriteModel::DeleteOne { filter } => driver
            .delete_one(collection, filter)
            .await
            .map(WriteOutcome::Deleted),
        WriteModel::DeleteMany { filter } => driver
            .delete_many(collection, filter)
            .await
            .map(WriteOutcome::Deleted),
    }
}

/// Abstract interface for document stores.
///
/// Individual calls are atomic per document at most; the session builds its
/// all-or-nothing commit on top of them with compensating writes.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. One driver handle is typically shared by many
/// sessions through [`SessionFactory`](crate::session::SessionFactory).
///
/// # Error Handling
///
/// Store failures are reported as [`MapperError::Backend`]; a duplicate identity on
/// insert is reported as [`MapperError::DocumentAlreadyExists`].
#[async_trait]
pub trait StoreDriver: Send + Sync + Debug {
    /// Returns the documents matching `options.filter`, projected, sorted and paginated.
    async fn find(&self, collection: &str, options: FindOptions) -> MapperResult<Vec<Document>>;

    /// Returns the first matching document.
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
        sort: Option<Document>,
    ) -> MapperResult<Option<Document>> {
        let options = FindOptions {
            filter,
            projection,
            sort,
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self.find(collection, options).await?.into_iter().next())
    }

    /// Inserts a document. Fails if its `_id` is already present.
    async fn insert_one(&self, collection: &str, document: Document) -> MapperResult<()>;

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> MapperResult<()> {
        for document in documents {
            self.insert_one(collection, document).await?;
        }
        Ok(())
    }

    /// Applies `update` to the first matching document, inserting one when `upsert` is set
    /// and nothing matches.
    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome>;

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome>;

    /// Replaces the first matching document wholesale.
    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome>;

    /// Deletes the first matching document and returns the number removed.
    async fn delete_one(&self, collection: &str, filter: Document) -> MapperResult<u64>;

    async fn delete_many(&self, collection: &str, filter: Document) -> MapperResult<u64>;

    /// Applies `models` in order, stopping at the first failure.
    ///
    /// The default implementation issues one call per model. A failure is reported as
    /// [`MapperError::BulkWrite`] carrying the outcomes of the models that were applied.
    async fn bulk_write(&self, collection: &str, models: Vec<WriteModel>) -> MapperResult<Vec<WriteOutcome>> {
        let mut outcomes = Vec::with_capacity(models.len());
        for model in models {
            match apply_model(self, collection, model).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(source) => {
                    return Err(MapperError::BulkWrite {
                        completed: outcomes,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Runs an aggregation pipeline.
    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> MapperResult<Vec<Document>>;

    async fn count_documents(&self, collection: &str, filter: Document) -> MapperResult<u64>;

    /// Distinct values of `field` (a dotted wire path) among matching documents.
    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> MapperResult<Vec<Bson>>;

    async fn list_collection_names(&self) -> MapperResult<Vec<String>>;

    async fn create_collection(&self, name: &str) -> MapperResult<()>;

    async fn drop_collection(&self, name: &str) -> MapperResult<()>;

    /// Creates the index if it does not exist yet.
    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> MapperResult<()>;

    /// Releases the driver's resources. The default implementation is a no-op.
    async fn shutdown(self) -> MapperResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
impl<D> StoreDriver for &D
where
    D: StoreDriver,
{
    async fn find(&self, collection: &str, options: FindOptions) -> MapperResult<Vec<Document>> {
        (**self).find(collection, options).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
        sort: Option<Document>,
    ) -> MapperResult<Option<Document>> {
        (**self).find_one(collection, filter, projection, sort).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> MapperResult<()> {
        (**self).insert_one(collection, document).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> MapperResult<()> {
        (**self).insert_many(collection, documents).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        (**self).update_one(collection, filter, update, upsert).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        (**self).update_many(collection, filter, update, upsert).await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        (**self).replace_one(collection, filter, replacement, upsert).await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        (**self).delete_one(collection, filter).await
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        (**self).delete_many(collection, filter).await
    }

    async fn bulk_write(&self, collection: &str, models: Vec<WriteModel>) -> MapperResult<Vec<WriteOutcome>> {
        (**self).bulk_write(collection, models).await
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> MapperResult<Vec<Document>> {
        (**self).aggregate(collection, pipeline).await
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        (**self).count_documents(collection, filter).await
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> MapperResult<Vec<Bson>> {
        (**self).distinct(collection, field, filter).await
    }

    async fn list_collection_names(&self) -> MapperResult<Vec<String>> {
        (**self).list_collection_names().await
    }

    async fn create_collection(&self, name: &str) -> MapperResult<()> {
        (**self).create_collection(name).await
    }

    async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        (**self).drop_collection(name).await
    }

    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> MapperResult<()> {
        (**self).ensure_index(collection, index).await
    }
}

#[async_trait]
impl<D> StoreDriver for Arc<D>
where
    D: StoreDriver,
{
    async fn find(&self, collection: &str, options: FindOptions) -> MapperResult<Vec<Document>> {
        (**self).find(collection, options).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
        sort: Option<Document>,
    ) -> MapperResult<Option<Document>> {
        (**self).find_one(collection, filter, projection, sort).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> MapperResult<()> {
        (**self).insert_one(collection, document).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> MapperResult<()> {
        (**self).insert_many(collection, documents).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        (**self).update_one(collection, filter, update, upsert).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        (**self).update_many(collection, filter, update, upsert).await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        (**self).replace_one(collection, filter, replacement, upsert).await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        (**self).delete_one(collection, filter).await
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        (**self).delete_many(collection, filter).await
    }

    async fn bulk_write(&self, collection: &str, models: Vec<WriteModel>) -> MapperResult<Vec<WriteOutcome>> {
        (**self).bulk_write(collection, models).await
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> MapperResult<Vec<Document>> {
        (**self).aggregate(collection, pipeline).await
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        (**self).count_documents(collection, filter).await
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> MapperResult<Vec<Bson>> {
        (**self).distinct(collection, field, filter).await
    }

    async fn list_collection_names(&self) -> MapperResult<Vec<String>> {
        (**self).list_collection_names().await
    }

    async fn create_collection(&self, name: &str) -> MapperResult<()> {
        (**self).create_collection(name).await
    }

    async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        (**self).drop_collection(name).await
    }

    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> MapperResult<()> {
        (**self).ensure_index(collection, index).await
    }
}

/// Factory for store drivers.
#[async_trait]
pub trait StoreDriverBuilder {
    type Driver: StoreDriver;

    async fn build(self) -> MapperResult<Self::Driver>;
}
