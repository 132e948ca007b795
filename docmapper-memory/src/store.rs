//! In-memory storage implementation for document stores.
//!
//! This module provides a simple but complete in-memory driver that keeps each
//! collection's documents as BSON in insertion order behind an async-aware read-write
//! lock. Every call takes the lock once, so individual calls (and whole bulk writes) are
//! atomic with respect to other callers.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document, oid::ObjectId};
use indexmap::IndexMap;
use mea::rwlock::RwLock;
use tracing::debug;

use docmapper_core::{
    driver::{FindOptions, StoreDriver, StoreDriverBuilder, UpdateOutcome, WriteModel, WriteOutcome},
    error::{MapperError, MapperResult},
    schema::IndexSpec,
};

use crate::{
    evaluator::{
        DocumentEvaluator, equal, project, proximity, resolve, sort_by_distance, sort_documents,
    },
    modifier::{apply_update, is_operator_update, seed_from_filter},
    pipeline,
};

/// Documents of one collection keyed by their canonical `_id`, plus its indexes.
#[derive(Debug, Default)]
struct Collection {
    documents: IndexMap<String, Document>,
    indexes: Vec<IndexSpec>,
}

type StoreMap = HashMap<String, Collection>;

fn id_key(id: &Bson) -> String {
    id.to_string()
}

/// How a matched document is rewritten.
#[derive(Clone, Copy)]
enum Change<'a> {
    Update(&'a Document),
    Replace(&'a Document),
}

impl Collection {
    fn matching(&self, filter: &Document, many: bool) -> MapperResult<Vec<String>> {
        let mut keys = Vec::new();
        for (key, document) in &self.documents {
            if DocumentEvaluator::new(document).evaluate(filter)? {
                keys.push(key.clone());
                if !many {
                    break;
                }
            }
        }
        Ok(keys)
    }

    /// Rejects `document` when a unique index already holds its key under another identity.
    fn check_unique(&self, name: &str, key: &str, document: &Document) -> MapperResult<()> {
        for index in self.indexes.iter().filter(|index| index.is_unique()) {
            let values = index_values(index, document);
            let clash = self
                .documents
                .iter()
                .filter(|(other_key, _)| other_key.as_str() != key)
                .any(|(_, other)| {
                    index_values(index, other)
                        .iter()
                        .zip(values.iter())
                        .all(|(a, b)| equal(a, b))
                });
            if clash {
                let shown: Vec<String> = values.iter().map(ToString::to_string).collect();
                return Err(MapperError::DocumentAlreadyExists(
                    format!("{} ({})", index.name(), shown.join(", ")),
                    name.to_string(),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, mut document: Document) -> MapperResult<Bson> {
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                let mut with_id = Document::new();
                with_id.insert("_id", id.clone());
                for (field, value) in document {
                    with_id.insert(field, value);
                }
                document = with_id;
                id
            }
        };
        let key = id_key(&id);
        if self.documents.contains_key(&key) {
            return Err(MapperError::DocumentAlreadyExists(id.to_string(), name.to_string()));
        }
        self.check_unique(name, &key, &document)?;
        self.documents.insert(key, document);
        Ok(id)
    }

    fn write(
        &mut self,
        name: &str,
        filter: &Document,
        change: Change<'_>,
        upsert: bool,
        many: bool,
    ) -> MapperResult<UpdateOutcome> {
        let mut outcome = UpdateOutcome::default();
        for key in self.matching(filter, many)? {
            let Some(original) = self.documents.get(&key) else {
                continue;
            };
            let mut updated = match change {
                Change::Update(update) => {
                    let mut updated = original.clone();
                    apply_update(&mut updated, update, filter, false)?;
                    updated
                }
                Change::Replace(replacement) => {
                    let mut updated = Document::new();
                    if let Some(id) = original.get("_id") {
                        updated.insert("_id", id.clone());
                    }
                    for (field, value) in replacement {
                        if field != "_id" {
                            updated.insert(field.clone(), value.clone());
                        }
                    }
                    updated
                }
            };
            if let Change::Replace(replacement) = change
                && let Some(id) = replacement.get("_id")
                && original.get("_id").is_some_and(|existing| !equal(existing, id))
            {
                return Err(MapperError::Backend(format!(
                    "the _id of a replacement must not change (collection {name})"
                )));
            }
            if !updated.get("_id").zip(original.get("_id")).is_some_and(|(a, b)| equal(a, b)) {
                return Err(MapperError::Backend(format!(
                    "an update must not change _id (collection {name})"
                )));
            }
            self.check_unique(name, &key, &updated)?;
            outcome.matched += 1;
            if updated != *original {
                outcome.modified += 1;
            }
            if let Some(slot) = self.documents.get_mut(&key) {
                std::mem::swap(slot, &mut updated);
            }
        }

        if outcome.matched == 0 && upsert {
            let seeded = match change {
                Change::Update(update) => {
                    let mut seeded = seed_from_filter(filter)?;
                    apply_update(&mut seeded, update, filter, true)?;
                    seeded
                }
                Change::Replace(replacement) => {
                    let mut seeded = replacement.clone();
                    if !seeded.contains_key("_id") {
                        let seed = seed_from_filter(filter)?;
                        if let Some(id) = seed.get("_id") {
                            seeded.insert("_id", id.clone());
                        }
                    }
                    seeded
                }
            };
            outcome.upserted_id = Some(self.insert(name, seeded)?);
        }
        Ok(outcome)
    }

    fn delete(&mut self, filter: &Document, many: bool) -> MapperResult<u64> {
        let keys = self.matching(filter, many)?;
        for key in &keys {
            self.documents.shift_remove(key);
        }
        Ok(keys.len() as u64)
    }

    fn find(&self, options: &FindOptions) -> MapperResult<Vec<Document>> {
        let mut documents = DocumentEvaluator::filter_documents(self.documents.values(), &options.filter)?;
        match &options.sort {
            Some(sort) if !sort.is_empty() => sort_documents(&mut documents, sort),
            _ => {
                if let Some((path, origin, spherical)) = proximity(&options.filter) {
                    sort_by_distance(&mut documents, &path, origin, spherical);
                }
            }
        }
        let skip = options.skip.unwrap_or_default() as usize;
        let limit = match options.limit {
            Some(limit) if limit != 0 => limit.unsigned_abs() as usize,
            _ => usize::MAX,
        };
        documents
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| match &options.projection {
                Some(projection) => project(&document, projection),
                None => Ok(document),
            })
            .collect()
    }
}

fn index_values(index: &IndexSpec, document: &Document) -> Vec<Bson> {
    index
        .components()
        .iter()
        .map(|(path, _)| resolve(document, path).into_iter().next().cloned().unwrap_or(Bson::Null))
        .collect()
}

fn apply(store: &mut StoreMap, collection: &str, model: WriteModel) -> MapperResult<WriteOutcome> {
    let target = store.entry(collection.to_string()).or_default();
    match model {
        WriteModel::InsertOne { document } => target.insert(collection, document).map(|_| WriteOutcome::Inserted),
        WriteModel::UpdateOne { filter, update, upsert } => {
            check_update(&update)?;
            target
                .write(collection, &filter, Change::Update(&update), upsert, false)
                .map(WriteOutcome::Updated)
        }
        WriteModel::UpdateMany { filter, update, upsert } => {
            check_update(&update)?;
            target
                .write(collection, &filter, Change::Update(&update), upsert, true)
                .map(WriteOutcome::Updated)
        }
        WriteModel::ReplaceOne { filter, replacement, upsert } => {
            if is_operator_update(&replacement) {
                return Err(MapperError::BadQuery("a replacement must not contain update operators".into()));
            }
            target
                .write(collection, &filter, Change::Replace(&replacement), upsert, false)
                .map(WriteOutcome::Updated)
        }
        WriteModel::DeleteOne { filter } => target.delete(&filter, false).map(WriteOutcome::Deleted),
        WriteModel::DeleteMany { filter } => target.delete(&filter, true).map(WriteOutcome::Deleted),
    }
}

fn check_update(update: &Document) -> MapperResult<()> {
    if update.is_empty() || !update.keys().all(|key| key.starts_with('$')) {
        return Err(MapperError::BadQuery("an update document must only contain update operators".into()));
    }
    Ok(())
}

/// Thread-safe in-memory document store.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing it to
/// be shared across sessions and tasks. Clones share the same data.
///
/// Queries scan the whole collection. Unique indexes are enforced; other index
/// definitions are recorded but do not change how queries run.
///
/// # Example
///
/// ```ignore
/// use docmapper_memory::InMemoryStore;
/// use docmapper_core::driver::{FindOptions, StoreDriver};
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// store.insert_one("users", doc! { "name": "Alice", "age": 30 }).await?;
///
/// let adults = store.find("users", FindOptions::new(doc! { "age": { "$gte": 18 } })).await?;
/// assert_eq!(adults.len(), 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// collection name -> documents
    store: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use docmapper_memory::InMemoryStore;
    ///
    /// let store = InMemoryStore::builder().build().await?;
    /// ```
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Every document of `collection` in insertion order.
    pub async fn snapshot(&self, collection: &str) -> Vec<Document> {
        self.store
            .read()
            .await
            .get(collection)
            .map(|target| target.documents.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StoreDriver for InMemoryStore {
    async fn find(&self, collection: &str, options: FindOptions) -> MapperResult<Vec<Document>> {
        let store = self.store.read().await;
        match store.get(collection) {
            Some(target) => target.find(&options),
            None => Ok(Vec::new()),
        }
    }

    async fn insert_one(&self, collection: &str, document: Document) -> MapperResult<()> {
        let mut store = self.store.write().await;
        apply(&mut store, collection, WriteModel::InsertOne { document }).map(|_| ())
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> MapperResult<()> {
        let mut store = self.store.write().await;
        for document in documents {
            apply(&mut store, collection, WriteModel::InsertOne { document })?;
        }
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        let mut store = self.store.write().await;
        match apply(&mut store, collection, WriteModel::UpdateOne { filter, update, upsert })? {
            WriteOutcome::Updated(outcome) => Ok(outcome),
            _ => Ok(UpdateOutcome::default()),
        }
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        let mut store = self.store.write().await;
        match apply(&mut store, collection, WriteModel::UpdateMany { filter, update, upsert })? {
            WriteOutcome::Updated(outcome) => Ok(outcome),
            _ => Ok(UpdateOutcome::default()),
        }
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        let mut store = self.store.write().await;
        match apply(&mut store, collection, WriteModel::ReplaceOne { filter, replacement, upsert })? {
            WriteOutcome::Updated(outcome) => Ok(outcome),
            _ => Ok(UpdateOutcome::default()),
        }
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        let mut store = self.store.write().await;
        match apply(&mut store, collection, WriteModel::DeleteOne { filter })? {
            WriteOutcome::Deleted(count) => Ok(count),
            _ => Ok(0),
        }
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        let mut store = self.store.write().await;
        match apply(&mut store, collection, WriteModel::DeleteMany { filter })? {
            WriteOutcome::Deleted(count) => Ok(count),
            _ => Ok(0),
        }
    }

    /// Applies the models under a single write lock, stopping at the first failure.
    async fn bulk_write(&self, collection: &str, models: Vec<WriteModel>) -> MapperResult<Vec<WriteOutcome>> {
        let mut store = self.store.write().await;
        let mut outcomes = Vec::with_capacity(models.len());
        for model in models {
            match apply(&mut store, collection, model) {
                Ok(outcome) => outcomes.push(outcome),
                Err(source) => {
                    debug!(collection, completed = outcomes.len(), error = %source, "bulk write stopped");
                    return Err(MapperError::BulkWrite {
                        completed: outcomes,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> MapperResult<Vec<Document>> {
        let store = self.store.read().await;
        let documents = store
            .get(collection)
            .map(|target| target.documents.values().cloned().collect())
            .unwrap_or_default();
        pipeline::run(documents, &pipeline, |name| {
            store
                .get(name)
                .map(|target| target.documents.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        let store = self.store.read().await;
        let Some(target) = store.get(collection) else {
            return Ok(0);
        };
        let mut count = 0;
        for document in target.documents.values() {
            if DocumentEvaluator::new(document).evaluate(&filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> MapperResult<Vec<Bson>> {
        let store = self.store.read().await;
        let Some(target) = store.get(collection) else {
            return Ok(Vec::new());
        };
        let mut values: Vec<Bson> = Vec::new();
        for document in target.documents.values() {
            if !DocumentEvaluator::new(document).evaluate(&filter)? {
                continue;
            }
            for value in resolve(document, field) {
                let items = match value {
                    Bson::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                for item in items {
                    if !values.iter().any(|existing| equal(existing, &item)) {
                        values.push(item);
                    }
                }
            }
        }
        Ok(values)
    }

    async fn list_collection_names(&self) -> MapperResult<Vec<String>> {
        let mut names: Vec<String> = self.store.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str) -> MapperResult<()> {
        self.store.write().await.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        let mut store = self.store.write().await;
        if store.remove(name).is_none() {
            return Err(MapperError::CollectionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> MapperResult<()> {
        let mut store = self.store.write().await;
        let target = store.entry(collection.to_string()).or_default();
        if target.indexes.iter().any(|existing| existing.name() == index.name()) {
            return Ok(());
        }
        if index.is_unique() {
            let mut seen: Vec<Vec<Bson>> = Vec::new();
            for document in target.documents.values() {
                let values = index_values(index, document);
                if seen
                    .iter()
                    .any(|other| other.iter().zip(values.iter()).all(|(a, b)| equal(a, b)))
                {
                    return Err(MapperError::Backend(format!(
                        "cannot build unique index {} on {collection}: duplicate keys",
                        index.name()
                    )));
                }
                seen.push(values);
            }
        }
        if let Some(seconds) = index.expire_after_secs() {
            debug!(collection, index = %index.name(), seconds, "expiring indexes are not enforced in memory");
        }
        target.indexes.push(index.clone());
        Ok(())
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// ```ignore
/// use docmapper_memory::InMemoryStore;
/// use docmapper_core::driver::StoreDriverBuilder;
///
/// let store = InMemoryStore::builder()
///     .with_collection("users")
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder {
    collections: Vec<String>,
    seed: Vec<(String, Document)>,
}

impl InMemoryStoreBuilder {
    /// Creates `name` up front so it is listed before any write.
    pub fn with_collection(mut self, name: impl Into<String>) -> Self {
        self.collections.push(name.into());
        self
    }

    /// Inserts `document` into `collection` when the store is built.
    pub fn with_document(mut self, collection: impl Into<String>, document: Document) -> Self {
        self.seed.push((collection.into(), document));
        self
    }
}

#[async_trait]
impl StoreDriverBuilder for InMemoryStoreBuilder {
    type Driver = InMemoryStore;

    /// Builds a store holding the configured collections and seed documents.
    ///
    /// # Errors
    ///
    /// Fails when two seed documents share a collection and an `_id`.
    async fn build(self) -> MapperResult<Self::Driver> {
        let store = InMemoryStore::new();
        for name in &self.collections {
            store.create_collection(name).await?;
        }
        for (collection, document) in self.seed {
            store.insert_one(&collection, document).await?;
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[tokio::test]
    async fn insert_rejects_duplicate_identity() {
        let store = InMemoryStore::new();
        store.insert_one("c", doc! { "_id": 1, "a": 1 }).await.unwrap();

        match store.insert_one("c", doc! { "_id": 1, "a": 2 }).await {
            Err(MapperError::DocumentAlreadyExists(id, collection)) => {
                assert_eq!(id, "1");
                assert_eq!(collection, "c");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_identity_is_minted_first() {
        let store = InMemoryStore::new();
        store.insert_one("c", doc! { "a": 1 }).await.unwrap();

        let documents = store.snapshot("c").await;
        assert_eq!(documents[0].keys().next().map(String::as_str), Some("_id"));
        assert!(matches!(documents[0].get("_id"), Some(Bson::ObjectId(_))));
    }

    #[tokio::test]
    async fn find_filters_sorts_pages_and_projects() {
        let store = InMemoryStore::new();
        for n in 1..=5 {
            store.insert_one("c", doc! { "_id": n, "n": n, "tag": "t" }).await.unwrap();
        }

        let found = store
            .find(
                "c",
                FindOptions::new(doc! { "n": { "$gte": 2 } })
                    .with_sort(doc! { "n": -1 })
                    .with_skip(1)
                    .with_limit(2)
                    .with_projection(doc! { "n": true }),
            )
            .await
            .unwrap();

        assert_eq!(found, vec![doc! { "_id": 4, "n": 4 }, doc! { "_id": 3, "n": 3 }]);
    }

    #[tokio::test]
    async fn upsert_seeds_from_the_filter() {
        let store = InMemoryStore::new();
        let outcome = store
            .update_one("c", doc! { "_id": 7, "name": "bot" }, doc! { "$inc": { "age": 1 } }, true)
            .await
            .unwrap();

        assert_eq!(outcome.matched, 0);
        assert_eq!(outcome.upserted_id, Some(Bson::Int32(7)));
        assert_eq!(store.snapshot("c").await, vec![doc! { "_id": 7, "name": "bot", "age": 1 }]);

        let outcome = store
            .update_one("c", doc! { "_id": 7 }, doc! { "$inc": { "age": 1 } }, true)
            .await
            .unwrap();
        assert_eq!((outcome.matched, outcome.modified, outcome.upserted_id), (1, 1, None));
    }

    #[tokio::test]
    async fn replace_keeps_identity() {
        let store = InMemoryStore::new();
        store.insert_one("c", doc! { "_id": 1, "a": 1, "b": 2 }).await.unwrap();
        store
            .replace_one("c", doc! { "_id": 1 }, doc! { "_id": 1, "a": 5 }, false)
            .await
            .unwrap();

        assert_eq!(store.snapshot("c").await, vec![doc! { "_id": 1, "a": 5 }]);
    }

    #[tokio::test]
    async fn unique_indexes_are_enforced() {
        let store = InMemoryStore::new();
        store
            .ensure_index("c", &IndexSpec::new().ascending("name").unique())
            .await
            .unwrap();
        store.insert_one("c", doc! { "_id": 1, "name": "a" }).await.unwrap();

        assert!(matches!(
            store.insert_one("c", doc! { "_id": 2, "name": "a" }).await,
            Err(MapperError::DocumentAlreadyExists(..))
        ));
        assert!(store.update_one("c", doc! { "_id": 1 }, doc! { "$set": { "name": "a" } }, false).await.is_ok());
    }

    #[tokio::test]
    async fn bulk_write_reports_completed_models() {
        let store = InMemoryStore::new();
        let models = vec![
            WriteModel::InsertOne { document: doc! { "_id": 1 } },
            WriteModel::InsertOne { document: doc! { "_id": 2 } },
            WriteModel::InsertOne { document: doc! { "_id": 1 } },
            WriteModel::InsertOne { document: doc! { "_id": 3 } },
        ];

        match store.bulk_write("c", models).await {
            Err(MapperError::BulkWrite { completed, source }) => {
                assert_eq!(completed, vec![WriteOutcome::Inserted, WriteOutcome::Inserted]);
                assert!(matches!(*source, MapperError::DocumentAlreadyExists(..)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.count_documents("c", doc! {}).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn distinct_flattens_arrays() {
        let store = InMemoryStore::builder()
            .with_document("c", doc! { "_id": 1, "tags": ["a", "b"] })
            .with_document("c", doc! { "_id": 2, "tags": ["b", "c"] })
            .build()
            .await
            .unwrap();

        let values = store.distinct("c", "tags", doc! {}).await.unwrap();
        assert_eq!(values, vec![Bson::from("a"), Bson::from("b"), Bson::from("c")]);
    }

    #[tokio::test]
    async fn drop_of_missing_collection_fails() {
        let store = InMemoryStore::builder().with_collection("kept").build().await.unwrap();

        assert_eq!(store.list_collection_names().await.unwrap(), vec!["kept".to_string()]);
        assert!(matches!(
            store.drop_collection("missing").await,
            Err(MapperError::CollectionNotFound(_))
        ));
    }
}
