use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use docmapper::{memory::InMemoryStore, prelude::*};

fn bot_schema(type_name: &str) -> Arc<DocumentSchema> {
    DocumentSchema::builder(type_name)
        .field(FieldDescriptor::new("name", StringKind::new().max_length(32)))
        .field(FieldDescriptor::new("age", IntKind::new().min(0)))
        .register()
        .unwrap()
}

fn unique_bot_schema(type_name: &str) -> Arc<DocumentSchema> {
    DocumentSchema::builder(type_name)
        .field(FieldDescriptor::string("name"))
        .field(FieldDescriptor::int("age"))
        .index(IndexSpec::new().ascending("name").unique())
        .register()
        .unwrap()
}

/// A store already holding "alpha", and a factory whose sessions ensure indexes.
async fn alpha_store(bots: &Arc<DocumentSchema>) -> (InMemoryStore, SessionFactory<InMemoryStore>) {
    let store = InMemoryStore::new();
    let config = SessionConfig::builder().with_auto_ensure_indexes(true).build();
    let factory = SessionFactory::new(store.clone(), config);

    let mut setup = factory.session();
    setup.insert(bot(bots, "alpha", 1)).unwrap();
    setup.commit().await.unwrap();
    setup.close().unwrap();
    (store, factory)
}

fn bot(schema: &Arc<DocumentSchema>, name: &str, age: i64) -> Entity {
    Entity::create(Arc::clone(schema), [("name", Value::from(name)), ("age", Value::from(age))]).unwrap()
}

fn age_of(entity: &SharedEntity) -> i64 {
    entity.read().value("age").unwrap().as_i64().unwrap()
}

#[tokio::test]
async fn save_query_and_update_round() {
    let bots = bot_schema("SessionBot");
    let store = InMemoryStore::new();
    let mut session = Session::new(store.clone(), SessionConfig::default());

    session.insert(bot(&bots, "Bot", 5)).unwrap();
    session.commit().await.unwrap();

    let age = bots.field_path("age").unwrap();
    let query = Query::new(&bots).filter(age.eq(5).unwrap()).unwrap();
    let found = session.one(&query).await.unwrap();
    assert_eq!(found.read().value("name").unwrap(), Value::from("Bot"));
    assert_eq!(age_of(&found), 5);

    found.write().set("age", 6).unwrap();
    session.update(&found).unwrap();
    session.commit().await.unwrap();

    let stored = store.snapshot("SessionBot").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_i64("age").unwrap(), 6);
    assert!(session.one_or_none(&query).await.unwrap().is_none());
}

#[test]
fn validation_failures_reject_the_value() {
    let bots = bot_schema("ValidatedBot");

    let mut entity = bots.new_entity();
    assert!(matches!(entity.set("age", -1), Err(MapperError::BadValue { .. })));
    assert!(matches!(
        entity.set("name", "x".repeat(33)),
        Err(MapperError::BadValue { .. })
    ));
    assert!(matches!(entity.set("color", "red"), Err(MapperError::ExtraValue(_))));
    assert!(matches!(
        Entity::create(Arc::clone(&bots), [("name", Value::from("only name"))]),
        Err(MapperError::MissingValue(_))
    ));
}

#[tokio::test]
async fn identity_cache_returns_the_same_entity() {
    let bots = bot_schema("CachedBot");
    let mut session = Session::new(InMemoryStore::new(), SessionConfig::default());

    let inserted = session.insert(bot(&bots, "one", 1)).unwrap();
    session.flush().await.unwrap();

    let query = Query::new(&bots);
    let first = session.one(&query).await.unwrap();
    let second = session.first(&query).await.unwrap().unwrap();

    assert!(first.ptr_eq(&inserted));
    assert!(second.ptr_eq(&inserted));

    let id = inserted.read().id().cloned().unwrap();
    let by_id = session.get(&bots, id).await.unwrap().unwrap();
    assert!(by_id.ptr_eq(&inserted));
}

#[tokio::test]
async fn uncached_sessions_load_fresh_entities() {
    let bots = bot_schema("UncachedBot");
    let config = SessionConfig::builder().with_cache_size(0).build();
    let mut session = Session::new(InMemoryStore::new(), config);

    session.insert(bot(&bots, "one", 1)).unwrap();
    session.commit().await.unwrap();

    let query = Query::new(&bots);
    let first = session.one(&query).await.unwrap();
    let second = session.one(&query).await.unwrap();
    assert!(!first.ptr_eq(&second));
}

#[tokio::test]
async fn failed_commit_leaves_the_store_untouched() {
    let bots = unique_bot_schema("UniqueBot");
    let (store, factory) = alpha_store(&bots).await;

    let mut session = factory.session();
    let alpha = session.one(&Query::new(&bots)).await.unwrap();
    alpha.write().set("age", 2).unwrap();
    session.update(&alpha).unwrap();
    session.insert(bot(&bots, "beta", 3)).unwrap();
    session.insert(bot(&bots, "alpha", 4)).unwrap();

    let result = session.commit().await;
    assert!(matches!(result, Err(MapperError::DocumentAlreadyExists(..))));

    let stored = store.snapshot("UniqueBot").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_str("name").unwrap(), "alpha");
    assert_eq!(stored[0].get_i64("age").unwrap(), 1);
    assert_eq!(session.pending(), 0);
    assert_eq!(session.uncommitted(), 0);
}

#[tokio::test]
async fn failed_commit_deletes_documents_created_by_upserts() {
    let bots = unique_bot_schema("UpsertedBot");
    let (store, factory) = alpha_store(&bots).await;
    let mut session = factory.session();

    let upsert = Query::new(&bots)
        .filter_by([("name", "ghost")])
        .unwrap()
        .update()
        .set("age", 9)
        .unwrap()
        .upsert();
    session.execute_update(&upsert).unwrap();
    session.insert(bot(&bots, "alpha", 2)).unwrap();

    let result = session.commit().await;
    assert!(matches!(result, Err(MapperError::DocumentAlreadyExists(..))));

    let stored = store.snapshot("UpsertedBot").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_str("name").unwrap(), "alpha");
}

#[tokio::test]
async fn failed_commit_forgets_entities_it_never_stored() {
    let bots = unique_bot_schema("ForgottenBot");
    let (store, factory) = alpha_store(&bots).await;
    let mut session = factory.session();

    let alpha = session.one(&Query::new(&bots)).await.unwrap();
    alpha.write().set("age", 5).unwrap();
    session.update(&alpha).unwrap();
    let beta = session.insert(bot(&bots, "beta", 2)).unwrap();
    session.insert(bot(&bots, "alpha", 3)).unwrap();
    assert!(session.commit().await.is_err());
    assert_eq!(store.snapshot("ForgottenBot").await.len(), 1);

    let beta_id = beta.read().id().cloned().unwrap();
    assert!(session.get(&bots, beta_id).await.unwrap().is_none());

    let alpha_id = alpha.read().id().cloned().unwrap();
    let reloaded = session.get(&bots, alpha_id).await.unwrap().unwrap();
    assert!(!reloaded.ptr_eq(&alpha));
    assert_eq!(age_of(&reloaded), 1);
}

#[tokio::test]
async fn rollback_keeps_the_cache_in_step_with_the_store() {
    let bots = bot_schema("RolledBackCacheBot");
    let mut session = Session::new(InMemoryStore::new(), SessionConfig::default());

    let kept = session.insert(bot(&bots, "kept", 1)).unwrap();
    session.commit().await.unwrap();
    let kept_id = kept.read().id().cloned().unwrap();

    session.remove(&kept).unwrap();
    let flushed = session.insert(bot(&bots, "flushed", 2)).unwrap();
    session.flush().await.unwrap();
    let queued = session.insert(bot(&bots, "queued", 3)).unwrap();

    session.rollback().await.unwrap();

    for discarded in [&flushed, &queued] {
        let id = discarded.read().id().cloned().unwrap();
        assert!(session.get(&bots, id).await.unwrap().is_none());
    }
    let restored = session.get(&bots, kept_id).await.unwrap().unwrap();
    assert_eq!(restored.read().value("name").unwrap(), Value::from("kept"));
}

#[tokio::test]
async fn factory_sessions_commit_side_by_side() {
    let bots = bot_schema("WorkerBot");
    let store = InMemoryStore::new();
    let factory = SessionFactory::new(store.clone(), SessionConfig::default());

    let workers = (0..4).map(|n| {
        let mut session = factory.session();
        let entity = bot(&bots, &format!("worker-{n}"), n);
        async move {
            session.insert(entity)?;
            session.commit().await?;
            session.close()
        }
    });
    let results = futures::future::join_all(workers).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(store.snapshot("WorkerBot").await.len(), 4);
}

#[tokio::test]
async fn rollback_undoes_flushed_operations() {
    let bots = bot_schema("RollbackBot");
    let store = InMemoryStore::new();
    let mut session = Session::new(store.clone(), SessionConfig::default());

    let kept = session.insert(bot(&bots, "kept", 1)).unwrap();
    session.commit().await.unwrap();

    kept.write().set("age", 10).unwrap();
    session.update(&kept).unwrap();
    session.insert(bot(&bots, "flushed", 2)).unwrap();
    session.flush().await.unwrap();
    session.insert(bot(&bots, "queued", 3)).unwrap();
    assert_eq!(store.snapshot("RollbackBot").await.len(), 2);

    session.rollback().await.unwrap();

    let stored = store.snapshot("RollbackBot").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_str("name").unwrap(), "kept");
    assert_eq!(stored[0].get_i64("age").unwrap(), 1);
    assert_eq!(session.pending(), 0);
}

#[tokio::test]
async fn nested_scopes_commit_only_at_the_outermost_end() {
    let bots = bot_schema("NestedBot");
    let store = InMemoryStore::new();
    let mut session = Session::new(store.clone(), SessionConfig::default());

    let outer = session.begin();
    session.insert(bot(&bots, "outer", 1)).unwrap();

    let inner = session.begin();
    session.insert(bot(&bots, "inner", 2)).unwrap();
    assert!(matches!(session.end(outer, true).await, Err(MapperError::Transaction(_))));
    session.end(inner, true).await.unwrap();
    assert!(store.snapshot("NestedBot").await.is_empty());

    let failed = session.begin();
    session.insert(bot(&bots, "discarded", 3)).unwrap();
    session.end(failed, false).await.unwrap();

    session.end(outer, true).await.unwrap();
    assert_eq!(session.depth(), 0);

    let mut names: Vec<String> = store
        .snapshot("NestedBot")
        .await
        .iter()
        .map(|document| document.get_str("name").unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, ["inner", "outer"]);
}

#[tokio::test]
async fn failed_inner_scope_undoes_its_flushed_writes() {
    let bots = bot_schema("FlushedScopeBot");
    let store = InMemoryStore::new();
    let mut session = Session::new(store.clone(), SessionConfig::default());

    let outer = session.begin();
    session.insert(bot(&bots, "outer", 1)).unwrap();
    let inner = session.begin();
    session.insert(bot(&bots, "inner", 2)).unwrap();
    session.flush().await.unwrap();
    assert_eq!(store.snapshot("FlushedScopeBot").await.len(), 2);

    session.end(inner, false).await.unwrap();
    let stored = store.snapshot("FlushedScopeBot").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_str("name").unwrap(), "outer");

    session.end(outer, true).await.unwrap();
    assert_eq!(store.snapshot("FlushedScopeBot").await.len(), 1);
}

#[tokio::test]
async fn transaction_closure_commits_or_discards() {
    let bots = bot_schema("ClosureBot");
    let store = InMemoryStore::new();
    let mut session = Session::new(store.clone(), SessionConfig::default());

    let saved = bot(&bots, "saved", 1);
    session
        .transaction(move |s| {
            Box::pin(async move {
                s.insert(saved)?;
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(store.snapshot("ClosureBot").await.len(), 1);

    let dropped = bot(&bots, "dropped", 2);
    let result: MapperResult<()> = session
        .transaction(move |s| {
            Box::pin(async move {
                s.insert(dropped)?;
                Err(MapperError::BadQuery("abort".into()))
            })
        })
        .await;
    assert!(matches!(result, Err(MapperError::BadQuery(_))));
    assert_eq!(store.snapshot("ClosureBot").await.len(), 1);
    assert_eq!(session.pending(), 0);
}

#[tokio::test]
async fn close_with_an_open_scope_is_an_error() {
    let mut session = Session::new(InMemoryStore::new(), SessionConfig::default());
    session.begin();
    assert!(matches!(session.close(), Err(MapperError::Transaction(_))));
}

#[tokio::test]
async fn partial_entities_follow_the_write_policy() {
    let bots = bot_schema("PartialBot");
    let store = InMemoryStore::new();
    let mut setup = Session::new(store.clone(), SessionConfig::default());
    setup.insert(bot(&bots, "partial", 7)).unwrap();
    setup.commit().await.unwrap();

    let query = Query::new(&bots).fields(["name"]).unwrap();

    let mut strict = Session::new(store.clone(), SessionConfig::default());
    let loaded = strict.one(&query).await.unwrap();
    assert!(loaded.read().is_partial());
    assert!(matches!(
        loaded.write().get("age"),
        Err(MapperError::FieldNotRetrieved(_))
    ));
    loaded.write().set("name", "renamed").unwrap();
    assert!(matches!(strict.add(&loaded), Err(MapperError::FieldNotRetrieved(_))));

    let lenient_config = SessionConfig::builder()
        .with_partial_write_policy(PartialWritePolicy::SkipIfUnfetched)
        .build();
    let mut lenient = Session::new(store.clone(), lenient_config);
    let loaded = lenient.one(&query).await.unwrap();
    loaded.write().set("name", "renamed").unwrap();
    lenient.add(&loaded).unwrap();
    lenient.commit().await.unwrap();

    let stored = store.snapshot("PartialBot").await;
    assert_eq!(stored[0].get_str("name").unwrap(), "renamed");
    assert_eq!(stored[0].get_i64("age").unwrap(), 7);
}

#[tokio::test]
async fn mark_clean_is_idempotent() {
    let bots = bot_schema("CleanBot");
    let mut entity = bot(&bots, "clean", 1);
    assert!(entity.is_dirty());

    entity.mark_clean();
    entity.mark_clean();
    assert!(!entity.is_dirty());
    assert!(entity.get_dirty_ops(false).unwrap().is_empty());

    entity.set("age", 2).unwrap();
    assert_eq!(entity.get_dirty_ops(false).unwrap(), doc! { "$set": { "age": 2_i64 } });
}

#[tokio::test]
async fn consecutive_updates_reach_the_store_once() {
    let bots = bot_schema("CoalescedBot");
    let store = CountingStore::new(InMemoryStore::new());
    let config = SessionConfig::builder().with_bulk_writes(false).build();
    let mut session = Session::new(store.clone(), config);

    let entity = session.insert(bot(&bots, "c", 1)).unwrap();
    session.commit().await.unwrap();
    let before = store.writes();

    entity.write().set("age", 2).unwrap();
    session.update(&entity).unwrap();
    entity.write().set("name", "d").unwrap();
    session.update(&entity).unwrap();
    session.commit().await.unwrap();

    assert_eq!(store.writes() - before, 1);
    let stored = store.inner.snapshot("CoalescedBot").await;
    assert_eq!(stored[0].get_str("name").unwrap(), "d");
    assert_eq!(stored[0].get_i64("age").unwrap(), 2);
}

#[tokio::test]
async fn unacknowledged_failures_do_not_abort_the_commit() {
    let bots = bot_schema("UnsafeBot");
    let store = CountingStore::failing_deletes(InMemoryStore::new());
    let config = SessionConfig::builder().with_safe(false).with_bulk_writes(false).build();
    let mut session = Session::new(store.clone(), config);

    let doomed = session.insert(bot(&bots, "doomed", 1)).unwrap();
    session.commit().await.unwrap();

    session.remove(&doomed).unwrap();
    session.insert(bot(&bots, "survivor", 2)).unwrap();
    session.commit().await.unwrap();

    assert_eq!(store.inner.snapshot("UnsafeBot").await.len(), 2);
}

#[tokio::test]
async fn cancellation_aborts_the_next_store_call() {
    let bots = bot_schema("CancelledBot");
    let store = InMemoryStore::new();
    let mut session = Session::new(store.clone(), SessionConfig::default());

    session.insert(bot(&bots, "never", 1)).unwrap();
    session.cancel_handle().cancel();

    assert!(matches!(session.commit().await, Err(MapperError::Cancelled)));
    assert!(store.snapshot("CancelledBot").await.is_empty());

    session.insert(bot(&bots, "later", 2)).unwrap();
    session.commit().await.unwrap();
    assert_eq!(store.snapshot("CancelledBot").await.len(), 1);
}

#[tokio::test]
async fn bulk_updates_and_removes() {
    let bots = bot_schema("BulkBot");
    let store = InMemoryStore::new();
    let mut session = Session::new(store.clone(), SessionConfig::default());
    for (name, age) in [("a", 1), ("b", 2), ("c", 3)] {
        session.insert(bot(&bots, name, age)).unwrap();
    }
    session.commit().await.unwrap();

    let age = bots.field_path("age").unwrap();
    let update = Query::new(&bots)
        .filter(age.ge(2).unwrap())
        .unwrap()
        .update()
        .inc_by("age", 10)
        .unwrap()
        .multi();
    session.execute_update(&update).unwrap();
    session
        .execute_remove(&Query::new(&bots).filter_by([("name", "a")]).unwrap().into())
        .unwrap();
    session.commit().await.unwrap();

    let query = Query::new(&bots).ascending("age").unwrap();
    let ages: Vec<i64> = session
        .documents(&query)
        .await
        .unwrap()
        .iter()
        .map(|document| document.get_i64("age").unwrap())
        .collect();
    assert_eq!(ages, [12, 13]);
    assert_eq!(session.count(&Query::new(&bots).limit(1)).await.unwrap(), 1);
}

#[tokio::test]
async fn references_resolve_through_the_session() {
    let pets = DocumentSchema::builder("RefPet")
        .field(FieldDescriptor::string("name"))
        .register()
        .unwrap();
    let owners = DocumentSchema::builder("RefOwner")
        .field(FieldDescriptor::string("name"))
        .field(FieldDescriptor::reference("pet", "RefPet").optional())
        .register()
        .unwrap();
    let mut session = Session::new(InMemoryStore::new(), SessionConfig::default());

    let pet = session
        .insert(Entity::create(Arc::clone(&pets), [("name", "rex")]).unwrap())
        .unwrap();
    let reference = pet.read().to_ref().unwrap();
    let mut owner = Entity::create(Arc::clone(&owners), [("name", "ann")]).unwrap();
    owner.set("pet", reference.clone()).unwrap();
    session.insert(owner).unwrap();
    session.commit().await.unwrap();

    let loaded = session.one(&Query::new(&owners)).await.unwrap();
    let stored = loaded.read().value("pet").unwrap();
    let target = session
        .dereference(stored.as_reference().unwrap(), false)
        .await
        .unwrap()
        .unwrap();
    assert!(target.ptr_eq(&pet));

    let dangling = Reference::new("RefPet", bson::oid::ObjectId::new());
    assert!(matches!(
        session.dereference(&dangling, false).await,
        Err(MapperError::BadReference(_))
    ));
    assert!(session.dereference(&dangling, true).await.unwrap().is_none());
}

/// Delegating driver that counts writes and can fail deletes.
#[derive(Clone)]
struct CountingStore {
    inner: InMemoryStore,
    writes: Arc<AtomicUsize>,
    fail_deletes: bool,
}

impl fmt::Debug for CountingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingStore").finish_non_exhaustive()
    }
}

impl CountingStore {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            writes: Arc::new(AtomicUsize::new(0)),
            fail_deletes: false,
        }
    }

    fn failing_deletes(inner: InMemoryStore) -> Self {
        Self {
            fail_deletes: true,
            ..Self::new(inner)
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreDriver for CountingStore {
    async fn find(&self, collection: &str, options: FindOptions) -> MapperResult<Vec<Document>> {
        self.inner.find(collection, options).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> MapperResult<()> {
        self.count();
        self.inner.insert_one(collection, document).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        self.count();
        self.inner.update_one(collection, filter, update, upsert).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        self.count();
        self.inner.update_many(collection, filter, update, upsert).await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        self.count();
        self.inner.replace_one(collection, filter, replacement, upsert).await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        self.count();
        if self.fail_deletes {
            return Err(MapperError::Backend("deletes are disabled".into()));
        }
        self.inner.delete_one(collection, filter).await
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        self.count();
        if self.fail_deletes {
            return Err(MapperError::Backend("deletes are disabled".into()));
        }
        self.inner.delete_many(collection, filter).await
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> MapperResult<Vec<Document>> {
        self.inner.aggregate(collection, pipeline).await
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> MapperResult<u64> {
        self.inner.count_documents(collection, filter).await
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> MapperResult<Vec<Bson>> {
        self.inner.distinct(collection, field, filter).await
    }

    async fn list_collection_names(&self) -> MapperResult<Vec<String>> {
        self.inner.list_collection_names().await
    }

    async fn create_collection(&self, name: &str) -> MapperResult<()> {
        self.inner.create_collection(name).await
    }

    async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        self.inner.drop_collection(name).await
    }

    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> MapperResult<()> {
        self.inner.ensure_index(collection, index).await
    }
}
