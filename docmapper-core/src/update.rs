//! Update expressions.
//!
//! An [`UpdateExpression`] accumulates operator fragments against the documents matched by
//! a [`Query`]. Every mutator resolves its field, checks that the operator is one the field
//! accepts and wraps its operand with the field (or element) codec. Fragments are keyed
//! `{op: {path: value}}` exactly like entity dirty-ops, and a repeated `(op, path)` pair
//! replaces the earlier fragment.

use std::sync::Arc;

use bson::{Bson, Document};

use crate::{
    error::{MapperError, MapperResult},
    field::Modifier,
    query::{Query, QueryExpression, QueryField},
    schema::DocumentSchema,
    value::Value,
};

/// A set of atomic modifications applied to every document a query matches.
#[derive(Debug, Clone)]
pub struct UpdateExpression {
    query: Query,
    data: Document,
    upsert: bool,
    multi: bool,
    safe: Option<bool>,
}

impl UpdateExpression {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            data: Document::new(),
            upsert: false,
            multi: false,
            safe: None,
        }
    }

    fn target(&self, name: &str, modifier: Modifier) -> MapperResult<QueryField> {
        let field = self.query.field(name)?;
        if !field.descriptor().valid_modifiers().contains(&modifier) {
            return Err(MapperError::InvalidModifier {
                field: field.absolute_name(),
                modifier: modifier.as_str().to_string(),
            });
        }
        Ok(field)
    }

    fn record(&mut self, modifier: Modifier, path: String, value: Bson) {
        let fields = self
            .data
            .entry(modifier.as_str().to_string())
            .or_insert_with(|| Bson::Document(Document::new()));
        if let Bson::Document(fields) = fields {
            fields.insert(path, value);
        }
    }

    fn wrap_item(field: &QueryField, value: &Value) -> MapperResult<Bson> {
        match field.descriptor().kind().item() {
            Some(item) => item.wrap(value),
            None => field.descriptor().wrap_value(value),
        }
    }

    /// `$set` of the field to `value`.
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Set)?;
        let wire = field.descriptor().wrap_value(&value.into())?;
        self.record(Modifier::Set, field.absolute_name(), wire);
        Ok(self)
    }

    /// `$set` of several fields at once.
    pub fn set_many<I, K, V>(mut self, pairs: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in pairs {
            self = self.set(name.as_ref(), value)?;
        }
        Ok(self)
    }

    pub fn unset(mut self, name: &str) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Unset)?;
        self.record(Modifier::Unset, field.absolute_name(), Bson::Boolean(true));
        Ok(self)
    }

    /// Increments by one.
    pub fn inc(self, name: &str) -> MapperResult<Self> {
        self.inc_by(name, 1)
    }

    pub fn inc_by(mut self, name: &str, value: impl Into<Value>) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Inc)?;
        let wire = field.descriptor().wrap_value(&value.into())?;
        self.record(Modifier::Inc, field.absolute_name(), wire);
        Ok(self)
    }

    /// `$push` of one element.
    pub fn append(mut self, name: &str, value: impl Into<Value>) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Push)?;
        let wire = Self::wrap_item(&field, &value.into())?;
        self.record(Modifier::Push, field.absolute_name(), wire);
        Ok(self)
    }

    /// `$pushAll` of several elements.
    pub fn extend<I, V>(mut self, name: &str, values: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let field = self.target(name, Modifier::PushAll)?;
        let wire = values
            .into_iter()
            .map(|value| Self::wrap_item(&field, &value.into()))
            .collect::<MapperResult<Vec<_>>>()?;
        self.record(Modifier::PushAll, field.absolute_name(), Bson::Array(wire));
        Ok(self)
    }

    pub fn add_to_set(mut self, name: &str, value: impl Into<Value>) -> MapperResult<Self> {
        let field = self.target(name, Modifier::AddToSet)?;
        let wire = Self::wrap_item(&field, &value.into())?;
        self.record(Modifier::AddToSet, field.absolute_name(), wire);
        Ok(self)
    }

    /// `$pull` of every element equal to `value`.
    pub fn remove(mut self, name: &str, value: impl Into<Value>) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Pull)?;
        let wire = Self::wrap_item(&field, &value.into())?;
        self.record(Modifier::Pull, field.absolute_name(), wire);
        Ok(self)
    }

    /// `$pull` of every element matching `expression`.
    pub fn remove_matching(mut self, name: &str, expression: QueryExpression) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Pull)?;
        self.record(
            Modifier::Pull,
            field.absolute_name(),
            Bson::Document(expression.into_document()),
        );
        Ok(self)
    }

    /// `$pullAll` of every element equal to one of `values`.
    pub fn remove_all<I, V>(mut self, name: &str, values: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let field = self.target(name, Modifier::PullAll)?;
        let wire = values
            .into_iter()
            .map(|value| Self::wrap_item(&field, &value.into()))
            .collect::<MapperResult<Vec<_>>>()?;
        self.record(Modifier::PullAll, field.absolute_name(), Bson::Array(wire));
        Ok(self)
    }

    pub fn pop_first(mut self, name: &str) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Pop)?;
        self.record(Modifier::Pop, field.absolute_name(), Bson::Int32(-1));
        Ok(self)
    }

    pub fn pop_last(mut self, name: &str) -> MapperResult<Self> {
        let field = self.target(name, Modifier::Pop)?;
        self.record(Modifier::Pop, field.absolute_name(), Bson::Int32(1));
        Ok(self)
    }

    /// Inserts a document when nothing matches.
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    /// Applies to every matched document instead of the first.
    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn safe(mut self, safe: bool) -> Self {
        self.safe = Some(safe);
        self
    }

    pub fn is_upsert(&self) -> bool {
        self.upsert
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    pub fn safe_flag(&self) -> Option<bool> {
        self.safe
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn schema(&self) -> &Arc<DocumentSchema> {
        self.query.schema()
    }

    pub fn update_document(&self) -> &Document {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::{field::FieldDescriptor, kind::IntKind};

    fn counters() -> Arc<DocumentSchema> {
        DocumentSchema::builder("UpdateCounter")
            .field(FieldDescriptor::string("name").with_wire_name("n"))
            .field(FieldDescriptor::new("hits", IntKind::new().min(0)))
            .field(FieldDescriptor::list("tags", FieldDescriptor::string("tag")).optional())
            .build()
            .unwrap()
    }

    #[test]
    fn fragments_are_grouped_by_operator() {
        let schema = counters();
        let update = Query::new(&schema)
            .update()
            .set("name", "x")
            .unwrap()
            .inc("hits")
            .unwrap()
            .append("tags", "a")
            .unwrap()
            .extend("tags", ["b", "c"])
            .unwrap()
            .pop_first("tags")
            .unwrap();

        assert_eq!(
            update.update_document(),
            &doc! {
                "$set": { "n": "x" },
                "$inc": { "hits": 1_i64 },
                "$push": { "tags": "a" },
                "$pushAll": { "tags": ["b", "c"] },
                "$pop": { "tags": -1 },
            }
        );
    }

    #[test]
    fn repeated_operator_and_path_overwrites() {
        let schema = counters();
        let update = Query::new(&schema)
            .update()
            .set("name", "first")
            .unwrap()
            .set("name", "second")
            .unwrap();

        assert_eq!(update.update_document(), &doc! { "$set": { "n": "second" } });
    }

    #[test]
    fn operators_are_checked_against_the_field() {
        let schema = counters();
        match Query::new(&schema).update().append("hits", 1) {
            Err(MapperError::InvalidModifier { field, modifier }) => {
                assert_eq!(field, "hits");
                assert_eq!(modifier, "$push");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            Query::new(&schema).update().inc("name"),
            Err(MapperError::InvalidModifier { .. })
        ));
    }

    #[test]
    fn operands_are_validated() {
        let schema = counters();
        assert!(matches!(
            Query::new(&schema).update().set("hits", -1),
            Err(MapperError::BadValue { .. })
        ));
        assert!(matches!(
            Query::new(&schema).update().append("tags", 3),
            Err(MapperError::BadValue { .. })
        ));
    }

    #[test]
    fn pull_accepts_values_and_expressions() {
        let schema = counters();
        let update = Query::new(&schema)
            .update()
            .remove_matching("tags", QueryExpression::raw(doc! { "$in": ["a", "b"] }))
            .unwrap()
            .remove_all("tags", ["z"])
            .unwrap()
            .multi()
            .upsert();

        assert!(update.is_multi());
        assert!(update.is_upsert());
        assert_eq!(
            update.update_document(),
            &doc! { "$pull": { "tags": { "$in": ["a", "b"] } }, "$pullAll": { "tags": ["z"] } }
        );
    }
}
