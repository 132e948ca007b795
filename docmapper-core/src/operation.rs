//! Queued write operations and their compensations.
//!
//! An [`Operation`] is built when a mutation is enqueued and never changes afterwards:
//! the wire documents it will send are computed up front, so later edits to the entity
//! only affect later operations. Each operation knows which documents to capture before
//! it runs ([`Operation::snapshot_filter`]) and how to undo itself from those captured
//! pre-images ([`Operation::compensations`]).

use std::{collections::BTreeSet, sync::Arc};

use bson::{Bson, Document, doc};

use crate::{
    config::PartialWritePolicy,
    driver::{WriteModel, WriteOutcome},
    entity::Entity,
    error::{MapperError, MapperResult},
    field::{ID_KEY, Modifier},
    query::{Query, QueryExpression, RemoveQuery},
    schema::DocumentSchema,
    update::UpdateExpression,
};

/// Identifier of a transaction scope within a session.
pub type TransactionId = u64;

/// What an operation does.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    /// Upserts the whole wire form of an entity. Partially loaded entities are written
    /// with `$set` so fields outside the projection survive.
    Save {
        id: Bson,
        document: Document,
        partial: bool,
    },
    /// Applies an entity's dirty-ops to one document.
    UpdateTargeted {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    /// Deletes one entity by identity. Without an identity there is nothing to delete.
    Remove { id: Option<Bson> },
    /// Applies an [`UpdateExpression`].
    BulkUpdate {
        filter: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    },
    /// Deletes every document matched by a [`RemoveQuery`].
    BulkRemove { filter: Document },
    /// Deletes every document of a collection.
    ClearCollection,
}

/// A write queued on a session.
#[derive(Debug, Clone)]
pub struct Operation {
    transaction: Option<TransactionId>,
    collection: String,
    schema: Arc<DocumentSchema>,
    safe: bool,
    kind: OperationKind,
}

impl Operation {
    fn with_kind(
        transaction: Option<TransactionId>,
        schema: &Arc<DocumentSchema>,
        safe: bool,
        kind: OperationKind,
    ) -> Self {
        Self {
            transaction,
            collection: schema.collection().to_string(),
            schema: Arc::clone(schema),
            safe,
            kind,
        }
    }

    /// Saves `entity`, minting its identity first when it has none, then marks it clean.
    pub fn save(
        transaction: Option<TransactionId>,
        entity: &mut Entity,
        safe: bool,
        policy: PartialWritePolicy,
    ) -> MapperResult<Self> {
        let id = entity.ensure_id()?;
        let mut document = entity.wrap_with(policy)?;
        document.insert(ID_KEY, id.clone());
        let partial = entity.is_partial();
        entity.mark_clean();
        Ok(Self::with_kind(
            transaction,
            entity.schema(),
            safe,
            OperationKind::Save { id, document, partial },
        ))
    }

    /// Writes the dirty-ops of `entity` to the document selected by `id_filter`, or by the
    /// entity's identity when no filter is given.
    ///
    /// `overrides` moves named fields from the operator they would use to another one.
    pub fn update_targeted(
        transaction: Option<TransactionId>,
        entity: &mut Entity,
        safe: bool,
        id_filter: Option<QueryExpression>,
        upsert: bool,
        overrides: &[(&str, Modifier)],
    ) -> MapperResult<Self> {
        let schema = Arc::clone(entity.schema());
        let filter = match (id_filter, entity.wire_id()?) {
            (Some(expression), _) => Query::new(&schema).filter(expression)?.filter_document().clone(),
            (None, Some(id)) => doc! { ID_KEY: id },
            (None, None) => {
                return Err(MapperError::InvalidUpdate(
                    "the document must have an identity or an identity filter must be given".into(),
                ));
            }
        };

        let mut update = entity.get_dirty_ops(upsert)?;
        for (name, modifier) in overrides {
            let path = schema.field_path(name)?.absolute_name();
            override_operator(&mut update, &path, *modifier);
        }
        strip_identity(&mut update);

        entity.mark_clean();
        Ok(Self::with_kind(
            transaction,
            &schema,
            safe,
            OperationKind::UpdateTargeted { filter, update, upsert },
        ))
    }

    pub fn remove(transaction: Option<TransactionId>, entity: &Entity, safe: bool) -> MapperResult<Self> {
        let id = entity.wire_id()?;
        Ok(Self::with_kind(
            transaction,
            entity.schema(),
            safe,
            OperationKind::Remove { id },
        ))
    }

    /// Fails with [`MapperError::InvalidUpdate`] when the expression holds no modifier.
    pub fn bulk_update(
        transaction: Option<TransactionId>,
        update: &UpdateExpression,
        safe: bool,
    ) -> MapperResult<Self> {
        if update.is_empty() {
            return Err(MapperError::InvalidUpdate("update expression has no modifiers".into()));
        }
        Ok(Self::with_kind(
            transaction,
            update.schema(),
            update.safe_flag().unwrap_or(safe),
            OperationKind::BulkUpdate {
                filter: update.query().filter_document().clone(),
                update: update.update_document().clone(),
                upsert: update.is_upsert(),
                multi: update.is_multi(),
            },
        ))
    }

    pub fn bulk_remove(transaction: Option<TransactionId>, query: &RemoveQuery, safe: bool) -> Self {
        Self::with_kind(
            transaction,
            query.schema(),
            query.safe().unwrap_or(safe),
            OperationKind::BulkRemove {
                filter: query.filter_document().clone(),
            },
        )
    }

    pub fn clear_collection(
        transaction: Option<TransactionId>,
        schema: &Arc<DocumentSchema>,
        safe: bool,
    ) -> Self {
        Self::with_kind(transaction, schema, safe, OperationKind::ClearCollection)
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub(crate) fn retag(&mut self, from: TransactionId, to: Option<TransactionId>) {
        if self.transaction == Some(from) {
            self.transaction = to;
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn schema(&self) -> &Arc<DocumentSchema> {
        &self.schema
    }

    /// Whether a failure of this operation aborts the commit.
    pub fn is_safe(&self) -> bool {
        self.safe
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// The driver writes this operation performs, in order.
    pub fn write_models(&self) -> Vec<WriteModel> {
        match &self.kind {
            OperationKind::Save { id, document, partial: false } => vec![WriteModel::ReplaceOne {
                filter: doc! { ID_KEY: id.clone() },
                replacement: document.clone(),
                upsert: true,
            }],
            OperationKind::Save { id, document, partial: true } => {
                let mut fields = document.clone();
                fields.remove(ID_KEY);
                vec![WriteModel::UpdateOne {
                    filter: doc! { ID_KEY: id.clone() },
                    update: doc! { "$set": fields },
                    upsert: true,
                }]
            }
            OperationKind::UpdateTargeted { update, .. } if update.is_empty() => Vec::new(),
            OperationKind::UpdateTargeted { filter, update, upsert } => vec![WriteModel::UpdateOne {
                filter: filter.clone(),
                update: update.clone(),
                upsert: *upsert,
            }],
            OperationKind::Remove { id: None } => Vec::new(),
            OperationKind::Remove { id: Some(id) } => vec![WriteModel::DeleteOne {
                filter: doc! { ID_KEY: id.clone() },
            }],
            OperationKind::BulkUpdate { filter, update, upsert, multi: true } => {
                vec![WriteModel::UpdateMany {
                    filter: filter.clone(),
                    update: update.clone(),
                    upsert: *upsert,
                }]
            }
            OperationKind::BulkUpdate { filter, update, upsert, multi: false } => {
                vec![WriteModel::UpdateOne {
                    filter: filter.clone(),
                    update: update.clone(),
                    upsert: *upsert,
                }]
            }
            OperationKind::BulkRemove { filter } => vec![WriteModel::DeleteMany {
                filter: filter.clone(),
            }],
            OperationKind::ClearCollection => vec![WriteModel::DeleteMany {
                filter: Document::new(),
            }],
        }
    }

    /// Identity of the single document this operation writes, if it targets one.
    pub fn target_id(&self) -> Option<&Bson> {
        match &self.kind {
            OperationKind::Save { id, .. } | OperationKind::Remove { id: Some(id) } => Some(id),
            OperationKind::UpdateTargeted { filter, .. } => {
                filter.get(ID_KEY).filter(|id| !matches!(id, Bson::Document(_)))
            }
            OperationKind::Remove { id: None }
            | OperationKind::BulkUpdate { .. }
            | OperationKind::BulkRemove { .. }
            | OperationKind::ClearCollection => None,
        }
    }

    /// Filter selecting the documents to capture before the operation runs, or `None` when
    /// the operation writes nothing.
    pub fn snapshot_filter(&self) -> Option<Document> {
        match &self.kind {
            OperationKind::Save { id, .. } => Some(doc! { ID_KEY: id.clone() }),
            OperationKind::UpdateTargeted { update, .. } if update.is_empty() => None,
            OperationKind::UpdateTargeted { filter, .. }
            | OperationKind::BulkUpdate { filter, .. }
            | OperationKind::BulkRemove { filter } => Some(filter.clone()),
            OperationKind::Remove { id } => id.as_ref().map(|id| doc! { ID_KEY: id.clone() }),
            OperationKind::ClearCollection => Some(Document::new()),
        }
    }

    /// The writes that undo this operation, given the documents captured before it ran and
    /// the outcome of its write.
    pub fn compensations(&self, pre_images: &[Document], outcome: Option<&WriteOutcome>) -> Vec<Compensation> {
        match &self.kind {
            OperationKind::Save { id, .. } => match pre_images.first() {
                Some(previous) => vec![Compensation::Restore {
                    document: previous.clone(),
                }],
                None => vec![Compensation::Delete { id: id.clone() }],
            },
            OperationKind::UpdateTargeted { filter, update, upsert }
            | OperationKind::BulkUpdate { filter, update, upsert, .. } => {
                let touched = touched_fields(update);
                let mut compensations: Vec<Compensation> = pre_images
                    .iter()
                    .filter_map(|previous| Compensation::revert(previous, &touched))
                    .collect();
                let upserted = match outcome {
                    Some(WriteOutcome::Updated(outcome)) => outcome.upserted_id.clone(),
                    _ => None,
                };
                // Without an outcome, an identity filter still names the upserted document.
                let upserted = upserted.or_else(|| {
                    (*upsert && pre_images.is_empty())
                        .then(|| filter.get(ID_KEY).cloned())
                        .flatten()
                        .filter(|id| !matches!(id, Bson::Document(_)))
                });
                if let Some(id) = upserted {
                    compensations.push(Compensation::Delete { id });
                }
                compensations
            }
            OperationKind::Remove { .. } | OperationKind::BulkRemove { .. } | OperationKind::ClearCollection => {
                pre_images
                    .iter()
                    .map(|previous| Compensation::Restore {
                        document: previous.clone(),
                    })
                    .collect()
            }
        }
    }

    /// Folds a later targeted update of the same document into this one. Later values win
    /// per path. Only `$set`/`$unset` updates of the same transaction are merged.
    pub(crate) fn coalesce(&mut self, later: &Operation) -> bool {
        if self.collection != later.collection || self.transaction != later.transaction || self.safe != later.safe {
            return false;
        }
        let (
            OperationKind::UpdateTargeted { filter, update, upsert },
            OperationKind::UpdateTargeted {
                filter: later_filter,
                update: later_update,
                upsert: later_upsert,
            },
        ) = (&mut self.kind, &later.kind)
        else {
            return false;
        };
        if *filter != *later_filter || *upsert != *later_upsert || !is_plain(update) || !is_plain(later_update) {
            return false;
        }
        for (op, fields) in later_update {
            let Bson::Document(fields) = fields else {
                continue;
            };
            for (path, value) in fields {
                remove_path(update, path);
                let target = update
                    .entry(op.clone())
                    .or_insert_with(|| Bson::Document(Document::new()));
                if let Bson::Document(target) = target {
                    target.insert(path.clone(), value.clone());
                }
            }
        }
        true
    }
}

/// A write that undoes part of an executed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    /// Deletes a document the operation created.
    Delete { id: Bson },
    /// Puts a captured document back, re-inserting it if it was deleted.
    Restore { document: Document },
    /// Resets the named top-level fields of a document to their captured values.
    Revert {
        id: Bson,
        set: Document,
        unset: Vec<String>,
    },
}

impl Compensation {
    fn revert(previous: &Document, touched: &BTreeSet<String>) -> Option<Self> {
        let id = previous.get(ID_KEY)?.clone();
        let mut set = Document::new();
        let mut unset = Vec::new();
        for field in touched {
            match previous.get(field) {
                Some(value) => {
                    set.insert(field.clone(), value.clone());
                }
                None => unset.push(field.clone()),
            }
        }
        if set.is_empty() && unset.is_empty() {
            return None;
        }
        Some(Compensation::Revert { id, set, unset })
    }

    pub fn into_write_model(self) -> WriteModel {
        match self {
            Compensation::Delete { id } => WriteModel::DeleteOne {
                filter: doc! { ID_KEY: id },
            },
            Compensation::Restore { document } => {
                let id = document.get(ID_KEY).cloned().unwrap_or(Bson::Null);
                WriteModel::ReplaceOne {
                    filter: doc! { ID_KEY: id },
                    replacement: document,
                    upsert: true,
                }
            }
            Compensation::Revert { id, set, unset } => {
                let mut update = Document::new();
                if !set.is_empty() {
                    update.insert("$set", set);
                }
                if !unset.is_empty() {
                    let mut fields = Document::new();
                    for field in unset {
                        fields.insert(field, true);
                    }
                    update.insert("$unset", fields);
                }
                WriteModel::UpdateOne {
                    filter: doc! { ID_KEY: id },
                    update,
                    upsert: false,
                }
            }
        }
    }
}

fn is_plain(update: &Document) -> bool {
    update
        .keys()
        .all(|op| op == Modifier::Set.as_str() || op == Modifier::Unset.as_str())
}

/// Top-level wire fields an update document writes.
fn touched_fields(update: &Document) -> BTreeSet<String> {
    let mut touched = BTreeSet::new();
    for fields in update.values() {
        if let Bson::Document(fields) = fields {
            for path in fields.keys() {
                if let Some(top) = path.split('.').next() {
                    touched.insert(top.to_string());
                }
            }
        }
    }
    touched
}

fn remove_path(update: &mut Document, path: &str) {
    let mut emptied = Vec::new();
    for (op, fields) in update.iter_mut() {
        if let Bson::Document(fields) = fields {
            fields.remove(path);
            if fields.is_empty() {
                emptied.push(op.clone());
            }
        }
    }
    for op in emptied {
        update.remove(&op);
    }
}

/// Moves `path` from whichever operator currently holds it to `modifier`.
fn override_operator(update: &mut Document, path: &str, modifier: Modifier) {
    let mut found = None;
    for (op, fields) in update.iter() {
        if let Bson::Document(fields) = fields
            && let Some(value) = fields.get(path)
        {
            found = Some((op.clone(), value.clone()));
            break;
        }
    }
    let Some((current, value)) = found else {
        return;
    };
    if current == modifier.as_str() {
        return;
    }
    remove_path(update, path);
    let target = update
        .entry(modifier.as_str().to_string())
        .or_insert_with(|| Bson::Document(Document::new()));
    if let Bson::Document(target) = target {
        target.insert(path.to_string(), value);
    }
}

fn strip_identity(update: &mut Document) {
    remove_path(update, ID_KEY);
}
