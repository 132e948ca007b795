use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::TryStreamExt;
use mongodb::{
    Client, Collection as MongoCollection, IndexModel,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, FindOptions as MongoFindOptions, Hint, IndexOptions},
};
use tracing::debug;

use docmapper_core::{
    driver::{FindOptions, StoreDriver, StoreDriverBuilder, UpdateOutcome},
    error::{MapperError, MapperResult},
    schema::IndexSpec,
};

use crate::sanitizer::OperatorSanitizer;

/// Server error code for a unique index violation.
const DUPLICATE_KEY: i32 = 11000;

/// Maps a driver error onto the mapper's error vocabulary.
fn store_error(collection: &str, error: MongoError) -> MapperError {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY => {
            MapperError::DocumentAlreadyExists(write_error.message.clone(), collection.to_string())
        }
        _ => MapperError::Backend(error.to_string()),
    }
}

/// A [`StoreDriver`] backed by a MongoDB database.
#[derive(Debug, Clone)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client.database(&self.database).collection(collection_name)
    }

    fn outcome(result: mongodb::results::UpdateResult) -> UpdateOutcome {
        UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id,
        }
    }
}

#[async_trait]
impl StoreDriver for MongoDbStore {
    async fn find(&self, collection: &str, options: FindOptions) -> MapperResult<Vec<Document>> {
        let mut find_options = MongoFindOptions::default();
        find_options.projection = options.projection;
        find_options.sort = options.sort;
        find_options.hint = options.hint.map(Hint::Keys);
        find_options.skip = options.skip;
        find_options.limit = options.limit;

        self.get_collection(collection)
            .find(OperatorSanitizer::sanitize_filter(options.filter))
            .with_options(find_options)
            .await
            .map_err(|e| store_error(collection, e))?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(|e| store_error(collection, e))
    }

    async fn insert_one(&self, collection: &str, document: Document) -> MapperResult<()> {
        self.get_collection(collection)
            .insert_one(document)
            .await
            .map_err(|e| store_error(collection, e))?;

        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        self.get_collection(collection)
            .update_one(
                OperatorSanitizer::sanitize_filter(filter),
                OperatorSanitizer::sanitize_update(update),
            )
            .upsert(upsert)
            .await
            .map(Self::outcome)
            .map_err(|e| store_error(collection, e))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        self.get_collection(collection)
            .update_many(
                OperatorSanitizer::sanitize_filter(filter),
                OperatorSanitizer::sanitize_update(update),
            )
            .upsert(upsert)
            .await
            .map(Self::outcome)
            .map_err(|e| store_error(collection, e))
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        self.get_collection(collection)
            .replace_one(OperatorSanitizer::sanitize_filter(filter), replacement)
            .upsert(upsert)
            .await
            .map(Self::outcome)
            .map_err(|e| store_error(collection, e))
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        self.get_collection(collection)
            .delete_one(OperatorSanitizer::sanitize_filter(filter))
            .await
            .map(|result| result.deleted_count)
            .map_err(|e| store_error(collection, e))
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        self.get_collection(collection)
            .delete_many(OperatorSanitizer::sanitize_filter(filter))
            .await
            .map(|result| result.deleted_count)
            .map_err(|e| store_error(collection, e))
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> MapperResult<Vec<Document>> {
        self.get_collection(collection)
            .aggregate(OperatorSanitizer::sanitize_pipeline(pipeline))
            .await
            .map_err(|e| store_error(collection, e))?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(|e| store_error(collection, e))
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        self.get_collection(collection)
            .count_documents(OperatorSanitizer::sanitize_filter(filter))
            .await
            .map_err(|e| store_error(collection, e))
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> MapperResult<Vec<Bson>> {
        self.get_collection(collection)
            .distinct(field, OperatorSanitizer::sanitize_filter(filter))
            .await
            .map_err(|e| store_error(collection, e))
    }

    async fn list_collection_names(&self) -> MapperResult<Vec<String>> {
        self.client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(|e| MapperError::Backend(e.to_string()))
    }

    async fn create_collection(&self, name: &str) -> MapperResult<()> {
        self.client
            .database(&self.database)
            .create_collection(name)
            .await
            .map_err(|e| store_error(name, e))?;

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        self.get_collection(name)
            .drop()
            .await
            .map_err(|e| store_error(name, e))?;

        Ok(())
    }

    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> MapperResult<()> {
        debug!(collection, index = %index.name(), "creating index");

        self.get_collection(collection)
            .create_index(
                IndexModel::builder()
                    .keys(index.keys())
                    .options(
                        IndexOptions::builder()
                            .name(index.name())
                            .unique(index.is_unique())
                            .expire_after(index.expire_after_secs().map(Duration::from_secs))
                            .build(),
                    )
                    .build(),
            )
            .await
            .map_err(|e| store_error(collection, e))?;

        Ok(())
    }

    async fn shutdown(self) -> MapperResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

/// Connects a [`MongoDbStore`] from a connection string.
pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreDriverBuilder for MongoDbStoreBuilder {
    type Driver = MongoDbStore;

    async fn build(self) -> MapperResult<Self::Driver> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| MapperError::Initialization(e.to_string()))?,
            )
            .map_err(|e| MapperError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}
