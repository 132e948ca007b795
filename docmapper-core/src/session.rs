//! Unit-of-work session.
//!
//! A [`Session`] queues writes as [`Operation`]s and sends them to the store when the
//! outermost transaction scope ends (or on [`Session::commit`] / [`Session::flush`]).
//! Operations run strictly in enqueue order. Consecutive operations on one collection go
//! out as a single ordered bulk write, and consecutive targeted updates of the same
//! document are merged into one update.
//!
//! The store has no multi-document transactions, so commit is made all-or-nothing by
//! compensation: before each write the documents it may touch are captured, and when a
//! later write fails every write already executed in this flush is undone in reverse
//! order. The error that stopped the flush is then returned unchanged.
//!
//! Every entity a session returns passes through its identity cache: within one session a
//! stored document is represented by exactly one [`SharedEntity`].
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::{entity::Entity, query::Query, session::Session};
//!
//! let mut session = Session::new(store, SessionConfig::default());
//! session
//!     .transaction(|s| {
//!         Box::pin(async move {
//!             s.insert(Entity::create(bots.clone(), [("name", "Bot"), ("age", 5)])?)?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//!
//! let bot = session.one(&Query::new(&bots).filter_by([("name", "bot")])?).await?;
//! ```

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bson::{Bson, Document, doc};
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::{
    aggregation::Aggregation,
    cache::IdentityCache,
    config::SessionConfig,
    driver::{FindOptions, StoreDriver, WriteModel, WriteOutcome, apply_model},
    entity::{Entity, SharedEntity},
    error::{MapperError, MapperResult},
    field::{ID_KEY, Modifier},
    operation::{Compensation, Operation, OperationKind, TransactionId},
    query::{Query, QueryExpression, RemoveQuery},
    registry,
    schema::DocumentSchema,
    update::UpdateExpression,
    value::{Reference, Value},
};

/// Cancels the commit or query a session is running at its next store-call boundary.
///
/// A cancelled commit compensates exactly like a failed one and returns
/// [`MapperError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Options of a targeted update.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    id_filter: Option<QueryExpression>,
    upsert: bool,
    overrides: Vec<(String, Modifier)>,
    safe: Option<bool>,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the document with `filter` instead of the entity's identity.
    pub fn with_filter(mut self, filter: QueryExpression) -> Self {
        self.id_filter = Some(filter);
        self
    }

    /// Inserts the document when nothing matches. Required fields are then always written.
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    /// Writes `field` with `modifier` instead of the operator its slot recorded.
    pub fn with_override(mut self, field: impl Into<String>, modifier: Modifier) -> Self {
        self.overrides.push((field.into(), modifier));
        self
    }

    pub fn with_safe(mut self, safe: bool) -> Self {
        self.safe = Some(safe);
        self
    }
}

/// Compensations of one executed operation.
#[derive(Debug)]
struct JournalEntry {
    transaction: Option<TransactionId>,
    collection: String,
    target: Option<Bson>,
    compensations: Vec<Compensation>,
}

/// One write sent to the store: a queued operation, or several coalesced ones.
#[derive(Debug)]
struct Unit {
    write: Operation,
    members: Vec<Operation>,
}

/// Merges consecutive compatible operations. Order is preserved.
fn plan(queue: Vec<Operation>) -> Vec<Unit> {
    let mut units: Vec<Unit> = Vec::with_capacity(queue.len());
    for op in queue {
        if let Some(last) = units.last_mut()
            && last.write.coalesce(&op)
        {
            last.members.push(op);
            continue;
        }
        units.push(Unit {
            write: op.clone(),
            members: vec![op],
        });
    }
    units
}

/// Splits units into runs that go out as one store request.
fn batches(units: Vec<Unit>, bulk_writes: bool) -> Vec<Vec<Unit>> {
    let mut batches: Vec<Vec<Unit>> = Vec::new();
    for unit in units {
        match batches.last_mut() {
            Some(batch)
                if bulk_writes
                    && batch
                        .last()
                        .is_some_and(|last| last.write.collection() == unit.write.collection()) =>
            {
                batch.push(unit);
            }
            _ => batches.push(vec![unit]),
        }
    }
    batches
}

/// A unit of work bound to a store driver.
///
/// Sessions are `Send` but not shared: one task drives a session at a time. Use a
/// [`SessionFactory`] to give each worker its own.
#[derive(Debug)]
pub struct Session<D: StoreDriver> {
    driver: D,
    config: SessionConfig,
    cache: IdentityCache,
    queue: Vec<Operation>,
    journal: Vec<JournalEntry>,
    transactions: Vec<TransactionId>,
    next_transaction: TransactionId,
    ensured_indexes: HashSet<String>,
    cancel: CancelHandle,
    closed: bool,
}

impl<D: StoreDriver> Session<D> {
    pub fn new(driver: D, config: SessionConfig) -> Self {
        Self {
            driver,
            cache: IdentityCache::new(config.cache_size),
            config,
            queue: Vec::new(),
            journal: Vec::new(),
            transactions: Vec::new(),
            next_transaction: 0,
            ensured_indexes: HashSet::new(),
            cancel: CancelHandle::default(),
            closed: false,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Number of open transaction scopes.
    pub fn depth(&self) -> usize {
        self.transactions.len()
    }

    /// Number of queued operations not yet sent to the store.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of executed operations that can still be rolled back.
    pub fn uncommitted(&self) -> usize {
        self.journal.len()
    }

    fn current_transaction(&self) -> Option<TransactionId> {
        self.transactions.last().copied()
    }

    fn checkpoint(&self) -> MapperResult<()> {
        if self.cancel.take() {
            return Err(MapperError::Cancelled);
        }
        Ok(())
    }

    // Transaction scopes

    /// Opens a (possibly nested) transaction scope.
    pub fn begin(&mut self) -> TransactionId {
        self.next_transaction += 1;
        let id = self.next_transaction;
        self.transactions.push(id);
        debug!(transaction = id, depth = self.transactions.len(), "transaction scope opened");
        id
    }

    /// Closes the innermost transaction scope.
    ///
    /// On success the scope's operations join the enclosing scope, or are committed and
    /// the identity cache cleared when this was the outermost scope. On failure the
    /// scope's queued operations are discarded and its already executed ones compensated.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Transaction`] if `id` is not the innermost open scope, or
    /// the commit error when the outermost scope fails to commit.
    pub async fn end(&mut self, id: TransactionId, success: bool) -> MapperResult<()> {
        if self.current_transaction() != Some(id) {
            return Err(MapperError::Transaction(format!(
                "transaction {id} is not the innermost open scope"
            )));
        }
        self.transactions.pop();
        let parent = self.current_transaction();

        if !success {
            self.abort_scope(id).await;
            return Ok(());
        }

        if parent.is_some() {
            for op in &mut self.queue {
                op.retag(id, parent);
            }
            for entry in &mut self.journal {
                if entry.transaction == Some(id) {
                    entry.transaction = parent;
                }
            }
            debug!(transaction = id, "nested transaction scope closed");
            return Ok(());
        }

        let result = self.commit().await;
        debug!(entities = self.cache.len(), "identity cache cleared");
        self.cache.clear();
        result
    }

    async fn abort_scope(&mut self, id: TransactionId) {
        let (discarded, queue): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|op| op.transaction() == Some(id));
        self.queue = queue;
        let (aborted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.journal)
            .into_iter()
            .partition(|entry| entry.transaction == Some(id));
        self.journal = kept;
        debug!(
            transaction = id,
            discarded = discarded.len(),
            compensated = aborted.len(),
            "transaction scope aborted"
        );
        self.forget_operations(&discarded);
        self.forget_entries(&aborted);
        if let Some(error) = self.compensate(aborted).await {
            error!(transaction = id, error = %error, "failed to undo an aborted transaction scope");
        }
    }

    /// Runs `body` inside a transaction scope, closing it with the body's outcome.
    ///
    /// ```ignore
    /// session
    ///     .transaction(|s| Box::pin(async move { s.add(&bot) }))
    ///     .await?;
    /// ```
    pub async fn transaction<F, T>(&mut self, body: F) -> MapperResult<T>
    where
        F: for<'s> FnOnce(&'s mut Session<D>) -> BoxFuture<'s, MapperResult<T>>,
    {
        let id = self.begin();
        match body(self).await {
            Ok(value) => {
                self.end(id, true).await?;
                Ok(value)
            }
            Err(error) => {
                self.end(id, false).await?;
                Err(error)
            }
        }
    }

    // Enqueueing

    /// Queues a save of `entity`. An identity is minted first when it has none.
    ///
    /// # Errors
    ///
    /// Fails when the entity cannot be wrapped, for instance because a required field
    /// has no value.
    pub fn add(&mut self, entity: &SharedEntity) -> MapperResult<()> {
        let op = {
            let mut guard = entity.write();
            Operation::save(
                self.current_transaction(),
                &mut guard,
                self.config.safe,
                self.config.partial_write_policy,
            )?
        };
        if let OperationKind::Save { id, .. } = op.kind() {
            self.cache.write(op.collection(), id, entity.clone());
        }
        debug!(collection = op.collection(), "save queued");
        self.queue.push(op);
        Ok(())
    }

    /// Wraps `entity` in a shared handle and queues its save.
    pub fn insert(&mut self, entity: Entity) -> MapperResult<SharedEntity> {
        let shared = SharedEntity::new(entity);
        self.add(&shared)?;
        Ok(shared)
    }

    pub fn add_all<'a, I>(&mut self, entities: I) -> MapperResult<()>
    where
        I: IntoIterator<Item = &'a SharedEntity>,
    {
        for entity in entities {
            self.add(entity)?;
        }
        Ok(())
    }

    /// Queues an update of `entity`'s changed fields.
    pub fn update(&mut self, entity: &SharedEntity) -> MapperResult<()> {
        self.update_with(entity, UpdateOptions::default())
    }

    /// # Errors
    ///
    /// Returns [`MapperError::InvalidUpdate`] when neither a filter nor an identity
    /// selects the document.
    pub fn update_with(&mut self, entity: &SharedEntity, options: UpdateOptions) -> MapperResult<()> {
        let overrides: Vec<(&str, Modifier)> = options
            .overrides
            .iter()
            .map(|(name, modifier)| (name.as_str(), *modifier))
            .collect();
        let op = {
            let mut guard = entity.write();
            Operation::update_targeted(
                self.current_transaction(),
                &mut guard,
                options.safe.unwrap_or(self.config.safe),
                options.id_filter,
                options.upsert,
                &overrides,
            )?
        };
        debug!(collection = op.collection(), "update queued");
        self.queue.push(op);
        Ok(())
    }

    /// Queues a delete of `entity`. An entity without identity is ignored.
    pub fn remove(&mut self, entity: &SharedEntity) -> MapperResult<()> {
        let op = Operation::remove(self.current_transaction(), &entity.read(), self.config.safe)?;
        if let OperationKind::Remove { id: Some(id) } = op.kind() {
            self.cache.remove(op.collection(), id);
        }
        debug!(collection = op.collection(), "remove queued");
        self.queue.push(op);
        Ok(())
    }

    pub fn execute_update(&mut self, update: &UpdateExpression) -> MapperResult<()> {
        let op = Operation::bulk_update(self.current_transaction(), update, self.config.safe)?;
        debug!(collection = op.collection(), "bulk update queued");
        self.queue.push(op);
        Ok(())
    }

    pub fn execute_remove(&mut self, query: &RemoveQuery) -> MapperResult<()> {
        let op = Operation::bulk_remove(self.current_transaction(), query, self.config.safe);
        debug!(collection = op.collection(), "bulk remove queued");
        self.queue.push(op);
        Ok(())
    }

    /// Queues a delete of every document in `schema`'s collection.
    pub fn clear_collection(&mut self, schema: &Arc<DocumentSchema>) {
        let op = Operation::clear_collection(self.current_transaction(), schema, self.config.safe);
        debug!(collection = op.collection(), "clear collection queued");
        self.queue.push(op);
    }

    // Execution

    /// Sends every queued operation to the store without closing any scope. Executed
    /// operations stay undoable through [`Session::rollback`] until committed.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing safe operation, after everything this
    /// flush executed has been compensated and the rest of the queue discarded.
    pub async fn flush(&mut self) -> MapperResult<()> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return Ok(());
        }
        debug!(operations = queue.len(), "flushing session");

        let targets: Vec<(String, Bson)> = queue
            .iter()
            .filter_map(|op| op.target_id().map(|id| (op.collection().to_string(), id.clone())))
            .collect();
        let mut executed = Vec::new();
        match self.execute(queue, &mut executed).await {
            Ok(()) => {
                self.journal.append(&mut executed);
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, executed = executed.len(), "flush failed, compensating");
                for (collection, id) in &targets {
                    self.cache.remove(collection, id);
                }
                if let Some(compensation_error) = self.compensate(executed).await {
                    error!(error = %compensation_error, "compensation failed");
                }
                Err(error)
            }
        }
    }

    /// Flushes and forgets the undo information of everything executed so far.
    pub async fn commit(&mut self) -> MapperResult<()> {
        self.flush().await?;
        let committed = self.journal.len();
        self.journal.clear();
        debug!(operations = committed, "session committed");
        Ok(())
    }

    /// Discards queued operations and undoes executed but uncommitted ones, newest first.
    ///
    /// # Errors
    ///
    /// Returns the first compensation failure; the remaining compensations still run.
    pub async fn rollback(&mut self) -> MapperResult<()> {
        let discarded = std::mem::take(&mut self.queue);
        let journal = std::mem::take(&mut self.journal);
        debug!(
            discarded = discarded.len(),
            compensated = journal.len(),
            "rolling back session"
        );
        self.forget_operations(&discarded);
        self.forget_entries(&journal);
        match self.compensate(journal).await {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn execute(&mut self, queue: Vec<Operation>, executed: &mut Vec<JournalEntry>) -> MapperResult<()> {
        for batch in batches(plan(queue), self.config.bulk_writes) {
            self.checkpoint()?;
            self.execute_batch(&batch, executed).await?;
        }
        Ok(())
    }

    async fn execute_batch(&mut self, units: &[Unit], executed: &mut Vec<JournalEntry>) -> MapperResult<()> {
        let Some(first) = units.first() else {
            return Ok(());
        };
        let collection = first.write.collection().to_string();

        for unit in units {
            self.auto_ensure_indexes(unit.write.schema()).await?;
        }

        let mut pre_images = Vec::with_capacity(units.len());
        for unit in units {
            let images = match unit.write.snapshot_filter() {
                Some(filter) => {
                    self.checkpoint()?;
                    self.driver.find(&collection, FindOptions::new(filter)).await?
                }
                None => Vec::new(),
            };
            pre_images.push(images);
        }

        let models: Vec<(usize, WriteModel)> = units
            .iter()
            .enumerate()
            .flat_map(|(index, unit)| unit.write.write_models().into_iter().map(move |model| (index, model)))
            .collect();
        debug!(collection = %collection, writes = models.len(), "executing batch");

        let mut next = 0;
        while next < models.len() {
            self.checkpoint()?;
            let (outcomes, failure) = self.run_models(&collection, &models[next..]).await;
            for (offset, outcome) in outcomes.iter().enumerate() {
                let index = models[next + offset].0;
                record(&units[index], &pre_images[index], outcome.as_ref(), executed);
            }
            let Some(error) = failure else {
                break;
            };
            let failed = next + outcomes.len();
            let unit = &units[models[failed].0];
            if unit.write.is_safe() || matches!(error, MapperError::Cancelled) {
                return Err(error);
            }
            warn!(
                collection = %collection,
                error = %error,
                "unacknowledged write failed, continuing"
            );
            for member in &unit.members {
                if let Some(id) = member.target_id() {
                    self.cache.remove(member.collection(), id);
                }
            }
            next = failed + 1;
        }
        Ok(())
    }

    /// Runs `models` in order and returns the outcomes of those that completed plus the
    /// error that stopped the run.
    async fn run_models(
        &self,
        collection: &str,
        models: &[(usize, WriteModel)],
    ) -> (Vec<Option<WriteOutcome>>, Option<MapperError>) {
        let models: Vec<WriteModel> = models.iter().map(|(_, model)| model.clone()).collect();
        if self.config.bulk_writes {
            return match self.driver.bulk_write(collection, models).await {
                Ok(outcomes) => (outcomes.into_iter().map(Some).collect(), None),
                Err(MapperError::BulkWrite { completed, source }) => {
                    (completed.into_iter().map(Some).collect(), Some(*source))
                }
                Err(error) => (Vec::new(), Some(error)),
            };
        }

        let mut outcomes = Vec::with_capacity(models.len());
        for model in models {
            if let Err(error) = self.checkpoint() {
                return (outcomes, Some(error));
            }
            match apply_model(&self.driver, collection, model).await {
                Ok(outcome) => outcomes.push(Some(outcome)),
                Err(error) => return (outcomes, Some(error)),
            }
        }
        (outcomes, None)
    }

    /// Drops the cached entities of writes that never reached the store. Their next load
    /// reads the stored document.
    fn forget_operations(&mut self, operations: &[Operation]) {
        for op in operations {
            if let Some(id) = op.target_id() {
                self.cache.remove(op.collection(), id);
            }
        }
    }

    /// Drops the cached entities of writes that are about to be undone.
    fn forget_entries(&mut self, entries: &[JournalEntry]) {
        for entry in entries {
            if let Some(id) = &entry.target {
                self.cache.remove(&entry.collection, id);
            }
        }
    }

    /// Applies the compensations of `entries`, newest first. Failures are logged and the
    /// first one returned.
    async fn compensate(&self, entries: Vec<JournalEntry>) -> Option<MapperError> {
        let mut first_error = None;
        for entry in entries.into_iter().rev() {
            for compensation in entry.compensations.into_iter().rev() {
                let model = compensation.into_write_model();
                if let Err(error) = apply_model(&self.driver, &entry.collection, model).await {
                    error!(collection = %entry.collection, error = %error, "compensating write failed");
                    first_error.get_or_insert(error);
                }
            }
        }
        first_error
    }

    // Indexes

    /// Creates the indexes declared by `schema`.
    pub async fn ensure_indexes(&mut self, schema: &Arc<DocumentSchema>) -> MapperResult<()> {
        for index in schema.indexes() {
            self.checkpoint()?;
            self.driver.ensure_index(schema.collection(), index).await?;
        }
        self.ensured_indexes.insert(schema.type_name().to_string());
        debug!(type_name = schema.type_name(), indexes = schema.indexes().len(), "indexes ensured");
        Ok(())
    }

    async fn auto_ensure_indexes(&mut self, schema: &Arc<DocumentSchema>) -> MapperResult<()> {
        if !self.config.auto_ensure_indexes || self.ensured_indexes.contains(schema.type_name()) {
            return Ok(());
        }
        self.ensure_indexes(schema).await
    }

    // Queries

    /// Returns the cached entity for `wire`'s identity, or unwraps and caches it.
    fn materialize(
        &mut self,
        schema: &Arc<DocumentSchema>,
        wire: Document,
        fields: Option<&[String]>,
    ) -> MapperResult<SharedEntity> {
        let collection = schema.collection().to_string();
        let id = wire.get(ID_KEY).cloned();
        if let Some(id) = &id
            && let Some(cached) = self.cache.read(&collection, id)
        {
            return Ok(cached);
        }
        let entity = SharedEntity::new(schema.unwrap(wire, fields)?);
        if let Some(id) = &id {
            self.cache.write(&collection, id, entity.clone());
        }
        Ok(entity)
    }

    async fn fetch(&mut self, query: &Query, options: FindOptions) -> MapperResult<Vec<Document>> {
        self.checkpoint()?;
        self.auto_ensure_indexes(query.schema()).await?;
        self.driver.find(query.collection(), options).await
    }

    fn entities(&mut self, query: &Query, documents: Vec<Document>) -> MapperResult<Vec<SharedEntity>> {
        if query.is_raw_output() {
            return Err(MapperError::BadQuery(
                "raw_output queries return documents, use Session::documents".into(),
            ));
        }
        let fields = query.projected_paths();
        documents
            .into_iter()
            .map(|document| self.materialize(query.schema(), document, fields.as_deref()))
            .collect()
    }

    /// Every entity matching `query`.
    pub async fn all(&mut self, query: &Query) -> MapperResult<Vec<SharedEntity>> {
        let documents = self.fetch(query, query.find_options()?).await?;
        self.entities(query, documents)
    }

    /// Every wire document matching `query`, bypassing the identity cache.
    pub async fn documents(&mut self, query: &Query) -> MapperResult<Vec<Document>> {
        self.fetch(query, query.find_options()?).await
    }

    /// The single entity matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::NoResultFound`] when nothing matches and
    /// [`MapperError::TooManyResults`] when more than one document does.
    pub async fn one(&mut self, query: &Query) -> MapperResult<SharedEntity> {
        self.one_or_none(query).await?.ok_or(MapperError::NoResultFound)
    }

    pub async fn one_or_none(&mut self, query: &Query) -> MapperResult<Option<SharedEntity>> {
        let options = query.find_options()?.with_limit(2);
        let mut entities = {
            let documents = self.fetch(query, options).await?;
            self.entities(query, documents)?
        };
        if entities.len() > 1 {
            return Err(MapperError::TooManyResults);
        }
        Ok(entities.pop())
    }

    /// The first entity in sort order, by identity when the query has no sort.
    pub async fn first(&mut self, query: &Query) -> MapperResult<Option<SharedEntity>> {
        let mut options = query.find_options()?.with_limit(1);
        if options.sort.is_none() {
            options.sort = Some(doc! { ID_KEY: 1 });
        }
        let documents = self.fetch(query, options).await?;
        Ok(self.entities(query, documents)?.pop())
    }

    /// The last entity in sort order, by identity when the query has no sort.
    pub async fn last(&mut self, query: &Query) -> MapperResult<Option<SharedEntity>> {
        let mut options = query.find_options()?.with_limit(1);
        options.sort = Some(match options.sort.take() {
            Some(sort) => reverse_sort(sort),
            None => doc! { ID_KEY: -1 },
        });
        let documents = self.fetch(query, options).await?;
        Ok(self.entities(query, documents)?.pop())
    }

    /// Number of documents `query` would return, skip and limit included.
    pub async fn count(&mut self, query: &Query) -> MapperResult<u64> {
        self.checkpoint()?;
        let total = self
            .driver
            .count_documents(query.collection(), query.filter_document().clone())
            .await?;
        let total = total.saturating_sub(query.skip_value().unwrap_or_default());
        Ok(match query.limit_value() {
            Some(limit) if limit > 0 => total.min(limit as u64),
            _ => total,
        })
    }

    /// Distinct values of the field `name` among the documents matching `query`.
    /// Sequence fields yield their elements.
    pub async fn distinct(&mut self, query: &Query, name: &str) -> MapperResult<Vec<Value>> {
        let field = query.field(name)?;
        self.checkpoint()?;
        let values = self
            .driver
            .distinct(
                query.collection(),
                &field.absolute_name(),
                query.filter_document().clone(),
            )
            .await?;
        let target = field.descriptor().kind().item().unwrap_or(field.descriptor());
        values.into_iter().map(|value| target.unwrap(value)).collect()
    }

    async fn find_by_id(
        &mut self,
        schema: &Arc<DocumentSchema>,
        id: Bson,
    ) -> MapperResult<Option<SharedEntity>> {
        if let Some(cached) = self.cache.read(schema.collection(), &id) {
            return Ok(Some(cached));
        }
        self.checkpoint()?;
        let filter = doc! { ID_KEY: id };
        match self.driver.find_one(schema.collection(), filter, None, None).await? {
            Some(document) => self.materialize(schema, document, None).map(Some),
            None => Ok(None),
        }
    }

    /// The entity of type `schema` (or a subtype) with identity `id`.
    pub async fn get(
        &mut self,
        schema: &Arc<DocumentSchema>,
        id: impl Into<Value>,
    ) -> MapperResult<Option<SharedEntity>> {
        let field = schema
            .identity_field()
            .ok_or_else(|| MapperError::InvalidConfig(format!("{} has no identity field", schema.type_name())))?;
        let id = field.wrap(&id.into())?;
        let entity = self.find_by_id(schema, id).await?;
        Ok(entity.filter(|entity| entity.read().schema().is_a(schema)))
    }

    /// Loads the entity a reference points to.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::BadReference`] when the target is missing and `allow_none`
    /// is false, and [`MapperError::UnknownType`] when no type is registered for the
    /// reference's collection.
    pub async fn dereference(
        &mut self,
        reference: &Reference,
        allow_none: bool,
    ) -> MapperResult<Option<SharedEntity>> {
        let schema = registry::lookup_collection(&reference.collection)
            .ok_or_else(|| MapperError::UnknownType(reference.collection.clone()))?;
        let entity = self.find_by_id(&schema, reference.id.clone()).await?;
        if entity.is_none() && !allow_none {
            return Err(MapperError::BadReference(format!(
                "{} in {}",
                reference.id, reference.collection
            )));
        }
        Ok(entity)
    }

    /// Runs a pipeline and returns its raw output.
    pub async fn aggregate(&mut self, aggregation: &Aggregation) -> MapperResult<Vec<Document>> {
        self.checkpoint()?;
        self.driver
            .aggregate(aggregation.collection(), aggregation.pipeline().to_vec())
            .await
    }

    /// Runs a pipeline whose output documents are entities of its schema.
    pub async fn aggregate_entities(&mut self, aggregation: &Aggregation) -> MapperResult<Vec<SharedEntity>> {
        let schema = aggregation
            .schema()
            .cloned()
            .ok_or_else(|| MapperError::BadQuery("aggregation has no document type".into()))?;
        let documents = self.aggregate(aggregation).await?;
        documents
            .into_iter()
            .map(|document| self.materialize(&schema, document, None))
            .collect()
    }

    /// Ends the session.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Transaction`] when a transaction scope is still open. Queued
    /// operations outside any scope are discarded.
    pub fn close(mut self) -> MapperResult<()> {
        self.closed = true;
        if !self.transactions.is_empty() {
            return Err(MapperError::Transaction(format!(
                "session closed with {} open transaction scope(s)",
                self.transactions.len()
            )));
        }
        if !self.queue.is_empty() {
            warn!(operations = self.queue.len(), "session closed with uncommitted operations");
        }
        Ok(())
    }
}

impl<D: StoreDriver> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.closed && !self.transactions.is_empty() {
            error!(
                depth = self.transactions.len(),
                "session dropped with an open transaction scope"
            );
        }
    }
}

fn record(unit: &Unit, pre_images: &[Document], outcome: Option<&WriteOutcome>, executed: &mut Vec<JournalEntry>) {
    for member in &unit.members {
        executed.push(JournalEntry {
            transaction: member.transaction(),
            collection: member.collection().to_string(),
            target: member.target_id().cloned(),
            compensations: member.compensations(pre_images, outcome),
        });
    }
}

fn reverse_sort(sort: Document) -> Document {
    let mut reversed = Document::new();
    for (path, direction) in sort {
        let flipped = match direction {
            Bson::Int32(n) => Bson::Int32(-n),
            Bson::Int64(n) => Bson::Int64(-n),
            other => other,
        };
        reversed.insert(path, flipped);
    }
    reversed
}

/// Hands out independent sessions over one shared driver handle.
#[derive(Debug, Clone)]
pub struct SessionFactory<D: StoreDriver + Clone> {
    driver: D,
    config: SessionConfig,
}

impl<D: StoreDriver + Clone> SessionFactory<D> {
    pub fn new(driver: D, config: SessionConfig) -> Self {
        Self { driver, config }
    }

    pub fn session(&self) -> Session<D> {
        Session::new(self.driver.clone(), self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDescriptor;

    fn schema(name: &str) -> Arc<DocumentSchema> {
        DocumentSchema::builder(name)
            .field(FieldDescriptor::string("title").optional())
            .build()
            .unwrap()
    }

    fn targeted(schema: &Arc<DocumentSchema>, id: i32, title: &str) -> Operation {
        let mut entity = Entity::new(Arc::clone(schema));
        entity.set_id(bson::oid::ObjectId::from_bytes([id as u8; 12])).unwrap();
        entity.mark_clean();
        entity.set("title", title).unwrap();
        Operation::update_targeted(None, &mut entity, true, None, false, &[]).unwrap()
    }

    #[test]
    fn consecutive_updates_of_one_document_are_coalesced() {
        let notes = schema("SessionPlanNote");
        let units = plan(vec![
            targeted(&notes, 1, "a"),
            targeted(&notes, 1, "b"),
            targeted(&notes, 2, "c"),
            targeted(&notes, 1, "d"),
        ]);

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].members.len(), 2);
        let OperationKind::UpdateTargeted { update, .. } = units[0].write.kind() else {
            panic!("expected a targeted update");
        };
        assert_eq!(update, &doc! { "$set": { "title": "b" } });
    }

    #[test]
    fn batches_never_reorder_collections() {
        let a = schema("SessionBatchA");
        let b = schema("SessionBatchB");
        let ops = vec![
            Operation::clear_collection(None, &a, true),
            Operation::clear_collection(None, &a, true),
            Operation::clear_collection(None, &b, true),
            Operation::clear_collection(None, &a, true),
        ];

        let grouped = batches(plan(ops.clone()), true);
        let sizes: Vec<usize> = grouped.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);

        assert_eq!(batches(plan(ops), false).len(), 4);
    }

    #[test]
    fn reverse_sort_flips_every_key() {
        assert_eq!(
            reverse_sort(doc! { "a": 1, "b": -1 }),
            doc! { "a": -1, "b": 1 }
        );
    }

    #[test]
    fn cancel_handle_is_consumed_once() {
        let handle = CancelHandle::default();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.take());
        assert!(!handle.take());
    }
}
