//! Query compilation: field paths, predicate expressions and queries.
//!
//! Field paths are resolved against a schema once and compiled to wire names. Comparators
//! on a [`QueryField`] wrap their operands with the field's own codec, so a query never
//! carries a value the field would refuse to store. Expressions are plain wire documents;
//! combining two constraints on the same path merges them key-wise when both are operator
//! documents and fails with [`MapperError::BadQuery`] otherwise.
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::query::Query;
//!
//! let age = bots.field_path("age")?;
//! let query = Query::new(&bots)
//!     .filter(age.gt(4)?)?
//!     .filter(age.lt(6)?)?
//!     .descending("name")?
//!     .limit(10);
//! assert_eq!(query.filter_document(), &doc! { "age": { "$gt": 4_i64, "$lt": 6_i64 } });
//! ```

use std::{collections::BTreeSet, fmt, sync::Arc};

use bson::{Bson, Document, doc};

use crate::{
    driver::FindOptions,
    error::{MapperError, MapperResult},
    field::{FieldDescriptor, ID_KEY},
    registry,
    schema::{DocumentSchema, SortOrder},
    update::UpdateExpression,
    value::Value,
};

#[derive(Debug, Clone, PartialEq)]
struct PathSegment {
    wire_name: String,
    positional: bool,
}

/// A field path compiled against a schema.
#[derive(Debug, Clone)]
pub struct QueryField {
    schema: Arc<DocumentSchema>,
    segments: Vec<PathSegment>,
    descriptor: FieldDescriptor,
    projection: Bson,
}

impl fmt::Display for QueryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute_name())
    }
}

impl PartialEq for QueryField {
    fn eq(&self, other: &Self) -> bool {
        self.schema.type_name() == other.schema.type_name() && self.segments == other.segments
    }
}

impl QueryField {
    /// Resolves a dotted path of field names (or wire names). A `$` segment marks the
    /// previous sequence segment as positional.
    pub fn resolve(schema: &Arc<DocumentSchema>, path: &str) -> MapperResult<Self> {
        let mut segments = path.split('.');
        let first = segments.next().unwrap_or_default();
        let descriptor = schema
            .field(first)
            .cloned()
            .ok_or_else(|| MapperError::field_not_found(first, path))?;

        let mut field = Self {
            schema: Arc::clone(schema),
            segments: vec![PathSegment {
                wire_name: descriptor.wire_name().to_string(),
                positional: false,
            }],
            descriptor,
            projection: Bson::Boolean(true),
        };
        for segment in segments {
            field = if segment == "$" {
                field.matched_index()?
            } else {
                field.child_in(segment, path)?
            };
        }
        Ok(field)
    }

    /// The field reached by one more path segment.
    pub fn child(&self, segment: &str) -> MapperResult<Self> {
        let path = format!("{}.{}", self.absolute_name(), segment);
        self.clone().child_in(segment, &path)
    }

    fn child_in(mut self, segment: &str, path: &str) -> MapperResult<Self> {
        let descriptor = self
            .descriptor
            .kind()
            .subfield(segment)
            .ok_or_else(|| MapperError::field_not_found(segment, path))?;
        self.segments.push(PathSegment {
            wire_name: descriptor.wire_name().to_string(),
            positional: false,
        });
        self.descriptor = descriptor;
        Ok(self)
    }

    /// Targets the array element matched by the query (`path.$`).
    pub fn matched_index(mut self) -> MapperResult<Self> {
        let item = self.descriptor.kind().item().cloned().ok_or_else(|| {
            MapperError::BadQuery(format!("positional operator on a non-sequence field: {self}"))
        })?;
        if let Some(last) = self.segments.last_mut() {
            last.positional = true;
        }
        self.descriptor = item;
        Ok(self)
    }

    /// Leaves the field out of a projection instead of including it.
    pub fn exclude(mut self) -> Self {
        self.projection = Bson::Boolean(false);
        self
    }

    pub fn schema(&self) -> &Arc<DocumentSchema> {
        &self.schema
    }

    /// Descriptor of the final segment.
    pub fn descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    /// The dotted wire path, `$` markers included.
    pub fn absolute_name(&self) -> String {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            parts.push(segment.wire_name.as_str());
            if segment.positional {
                parts.push("$");
            }
        }
        parts.join(".")
    }

    /// Projection value of the field (`true`, `false` or an `$elemMatch` document).
    pub fn projection(&self) -> &Bson {
        &self.projection
    }

    fn predicate(&self, predicate: impl Into<Bson>) -> QueryExpression {
        let mut doc = Document::new();
        doc.insert(self.absolute_name(), predicate.into());
        QueryExpression(doc)
    }

    fn comparator(&self, op: &str, value: impl Into<Value>) -> MapperResult<QueryExpression> {
        let wire = self.descriptor.wrap_value(&value.into())?;
        let mut predicate = Document::new();
        predicate.insert(op, wire);
        Ok(self.predicate(predicate))
    }

    fn wrap_all<I, V>(&self, values: I) -> MapperResult<Vec<Bson>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        values
            .into_iter()
            .map(|value| self.descriptor.wrap_value(&value.into()))
            .collect()
    }

    pub fn eq(&self, value: impl Into<Value>) -> MapperResult<QueryExpression> {
        let wire = self.descriptor.wrap_value(&value.into())?;
        Ok(self.predicate(wire))
    }

    pub fn ne(&self, value: impl Into<Value>) -> MapperResult<QueryExpression> {
        self.comparator("$ne", value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> MapperResult<QueryExpression> {
        self.comparator("$lt", value)
    }

    pub fn le(&self, value: impl Into<Value>) -> MapperResult<QueryExpression> {
        self.comparator("$lte", value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> MapperResult<QueryExpression> {
        self.comparator("$gt", value)
    }

    pub fn ge(&self, value: impl Into<Value>) -> MapperResult<QueryExpression> {
        self.comparator("$gte", value)
    }

    pub fn in_<I, V>(&self, values: I) -> MapperResult<QueryExpression>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Ok(self.predicate(doc! { "$in": self.wrap_all(values)? }))
    }

    pub fn not_in<I, V>(&self, values: I) -> MapperResult<QueryExpression>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Ok(self.predicate(doc! { "$nin": self.wrap_all(values)? }))
    }

    pub fn exists(&self, exists: bool) -> QueryExpression {
        self.predicate(doc! { "$exists": exists })
    }

    pub fn regex(&self, pattern: &str) -> QueryExpression {
        self.regex_with_options(pattern, None)
    }

    pub fn regex_with_options(&self, pattern: &str, options: Option<&str>) -> QueryExpression {
        let mut predicate = doc! { "$regex": pattern };
        if let Some(options) = options {
            predicate.insert("$options", options);
        }
        self.predicate(predicate)
    }

    pub fn starts_with(&self, prefix: &str) -> QueryExpression {
        self.regex(&format!("^{}", escape_regex(prefix)))
    }

    pub fn starts_with_ignore_case(&self, prefix: &str) -> QueryExpression {
        self.regex_with_options(&format!("^{}", escape_regex(prefix)), Some("i"))
    }

    pub fn ends_with(&self, suffix: &str) -> QueryExpression {
        self.regex(&format!("{}$", escape_regex(suffix)))
    }

    pub fn ends_with_ignore_case(&self, suffix: &str) -> QueryExpression {
        self.regex_with_options(&format!("{}$", escape_regex(suffix)), Some("i"))
    }

    pub fn near(&self, x: f64, y: f64, max_distance: Option<f64>) -> QueryExpression {
        self.near_op("$near", x, y, max_distance)
    }

    pub fn near_sphere(&self, x: f64, y: f64, max_distance: Option<f64>) -> QueryExpression {
        self.near_op("$nearSphere", x, y, max_distance)
    }

    fn near_op(&self, op: &str, x: f64, y: f64, max_distance: Option<f64>) -> QueryExpression {
        let mut predicate = Document::new();
        predicate.insert(op, vec![x, y]);
        if let Some(distance) = max_distance {
            predicate.insert("$maxDistance", distance);
        }
        self.predicate(predicate)
    }

    pub fn within_box(&self, corner1: (f64, f64), corner2: (f64, f64)) -> QueryExpression {
        self.predicate(doc! {
            "$within": { "$box": [[corner1.0, corner1.1], [corner2.0, corner2.1]] }
        })
    }

    pub fn within_radius(&self, x: f64, y: f64, radius: f64) -> QueryExpression {
        self.predicate(doc! { "$within": { "$center": [[x, y], radius] } })
    }

    pub fn within_radius_sphere(&self, x: f64, y: f64, radius: f64) -> QueryExpression {
        self.predicate(doc! { "$within": { "$centerSphere": [[x, y], radius] } })
    }

    pub fn within_polygon(&self, polygon: &[(f64, f64)]) -> QueryExpression {
        let points: Vec<Bson> = polygon
            .iter()
            .map(|(x, y)| Bson::Array(vec![Bson::Double(*x), Bson::Double(*y)]))
            .collect();
        self.predicate(doc! { "$within": { "$polygon": points } })
    }

    /// Matches documents with at least one element satisfying `expression`. The
    /// returned field projects only that element.
    pub fn elem_match(&self, expression: QueryExpression) -> MapperResult<ElemMatch> {
        if !self.descriptor.kind().is_sequence() {
            return Err(MapperError::BadQuery(format!(
                "elem_match called on a non-sequence field: {self}"
            )));
        }
        let predicate = doc! { "$elemMatch": expression.0 };
        let mut field = self.clone();
        field.projection = Bson::Document(predicate.clone());
        Ok(ElemMatch {
            expression: self.predicate(predicate),
            field,
        })
    }
}

/// Escapes regular-expression metacharacters.
pub fn escape_regex(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if "\\.^$|?*+()[]{}-/".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Result of [`QueryField::elem_match`]: the predicate plus the projected field.
#[derive(Debug, Clone)]
pub struct ElemMatch {
    field: QueryField,
    expression: QueryExpression,
}

impl ElemMatch {
    pub fn field(&self) -> &QueryField {
        &self.field
    }

    pub fn expression(&self) -> &QueryExpression {
        &self.expression
    }
}

impl From<ElemMatch> for QueryExpression {
    fn from(elem_match: ElemMatch) -> Self {
        elem_match.expression
    }
}

/// A wire predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryExpression(Document);

impl QueryExpression {
    /// Wraps an already compiled wire predicate.
    pub fn raw(doc: Document) -> Self {
        Self(doc)
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }

    /// Negation. Bare values become `$ne`; operator documents are wrapped in `$not`.
    /// Mixing operator and plain keys under one path is rejected.
    pub fn not_(&self) -> MapperResult<QueryExpression> {
        let mut out = Document::new();
        for (path, predicate) in &self.0 {
            let Bson::Document(ops) = predicate else {
                out.insert(path.clone(), doc! { "$ne": predicate.clone() });
                continue;
            };
            let operators = ops.keys().filter(|key| key.starts_with('$')).count();
            if operators != 0 && operators != ops.len() {
                return Err(MapperError::BadQuery(format!(
                    "$ operator used in field name under {path}"
                )));
            }
            if operators == 0 {
                out.insert(path.clone(), doc! { "$ne": predicate.clone() });
                continue;
            }
            out.insert(path.clone(), doc! { "$not": ops.clone() });
        }
        Ok(QueryExpression(out))
    }

    /// Disjunction, flattened into a single `$or` array.
    ///
    /// When `self` already holds an `$or`, `other` joins that array and the other keys of
    /// `self` stay outside it: `{name: "a", $or: [x, y]}.or_(z)` reads
    /// `name == "a" and (x or y or z)`.
    pub fn or_(mut self, other: QueryExpression) -> QueryExpression {
        if let Some(Bson::Array(branches)) = self.0.get_mut("$or") {
            branches.push(Bson::Document(other.0));
            return self;
        }
        QueryExpression(doc! { "$or": [self.0, other.0] })
    }

    /// Conjunction with the same merge rules as [`Query::filter`].
    pub fn and(mut self, other: QueryExpression) -> MapperResult<QueryExpression> {
        merge_filter(&mut self.0, other.0)?;
        Ok(self)
    }
}

/// Merges `incoming` constraints into `target`. A path constrained twice must carry an
/// operator document on both sides; those are merged key-wise.
pub(crate) fn merge_filter(target: &mut Document, incoming: Document) -> MapperResult<()> {
    for (path, predicate) in incoming {
        match (target.get_mut(&path), predicate) {
            (None, predicate) => {
                target.insert(path, predicate);
            }
            (Some(Bson::Document(existing)), Bson::Document(predicate)) => {
                for (op, value) in predicate {
                    existing.insert(op, value);
                }
            }
            _ => {
                return Err(MapperError::BadQuery(format!(
                    "Multiple assignments to a field must all be dicts: {path}"
                )));
            }
        }
    }
    Ok(())
}

/// Where a query reads from.
#[derive(Debug, Clone)]
pub enum Source {
    Schema(Arc<DocumentSchema>),
    /// A field of a schema; the field also joins the projection.
    Field(QueryField),
    /// A collection name, resolved through the registry.
    Collection(String),
}

impl From<Arc<DocumentSchema>> for Source {
    fn from(schema: Arc<DocumentSchema>) -> Self {
        Source::Schema(schema)
    }
}

impl From<&Arc<DocumentSchema>> for Source {
    fn from(schema: &Arc<DocumentSchema>) -> Self {
        Source::Schema(Arc::clone(schema))
    }
}

impl From<QueryField> for Source {
    fn from(field: QueryField) -> Self {
        Source::Field(field)
    }
}

impl From<&str> for Source {
    fn from(collection: &str) -> Self {
        Source::Collection(collection.to_string())
    }
}

/// A compiled find: filter, projection, sort, hint and pagination over one type.
#[derive(Debug, Clone)]
pub struct Query {
    schema: Arc<DocumentSchema>,
    filter: Document,
    clauses: Document,
    sort: Vec<(String, SortOrder)>,
    hints: Vec<(String, SortOrder)>,
    fields: Option<Vec<(String, Bson)>>,
    limit: Option<i64>,
    skip: Option<u64>,
    exclude_subclasses: bool,
    raw_output: bool,
}

impl Query {
    /// A query over `schema` and its registered subtypes.
    pub fn new(schema: &Arc<DocumentSchema>) -> Self {
        Self {
            schema: Arc::clone(schema),
            filter: schema.base_query(false),
            clauses: Document::new(),
            sort: Vec::new(),
            hints: Vec::new(),
            fields: None,
            limit: None,
            skip: None,
            exclude_subclasses: false,
            raw_output: false,
        }
    }

    /// A query over the registered type named `type_name`.
    pub fn named(type_name: &str) -> MapperResult<Self> {
        registry::lookup(type_name)
            .map(|schema| Self::new(&schema))
            .ok_or_else(|| MapperError::UnknownType(type_name.to_string()))
    }

    /// A query over the single type and collection named by `sources`.
    pub fn from_sources<I, S>(sources: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Source>,
    {
        let mut schemas: Vec<Arc<DocumentSchema>> = Vec::new();
        let mut fields = Vec::new();
        for source in sources {
            let schema = match source.into() {
                Source::Schema(schema) => schema,
                Source::Field(field) => {
                    let schema = Arc::clone(field.schema());
                    fields.push(field);
                    schema
                }
                Source::Collection(name) => registry::lookup_collection(&name)
                    .ok_or_else(|| MapperError::UnknownType(name.clone()))?,
            };
            if !schemas.iter().any(|s| s.type_name() == schema.type_name()) {
                schemas.push(schema);
            }
        }

        let collections: BTreeSet<&str> = schemas.iter().map(|s| s.collection()).collect();
        if collections.len() > 1 {
            return Err(MapperError::MultipleCollectionsFound(
                collections.into_iter().map(str::to_string).collect(),
            ));
        }
        if schemas.len() > 1 {
            return Err(MapperError::MultipleObjectsDetected(
                schemas.iter().map(|s| s.type_name().to_string()).collect(),
            ));
        }
        let Some(schema) = schemas.pop() else {
            return Err(MapperError::BadQuery("query has no source".into()));
        };

        let mut query = Self::new(&schema);
        if !fields.is_empty() {
            query = query.select(fields);
        }
        Ok(query)
    }

    pub fn schema(&self) -> &Arc<DocumentSchema> {
        &self.schema
    }

    pub fn collection(&self) -> &str {
        self.schema.collection()
    }

    /// Resolves a field name (dotted paths allowed) against the query's schema.
    pub fn field(&self, name: &str) -> MapperResult<QueryField> {
        QueryField::resolve(&self.schema, name)
    }

    fn wire_path(&self, name: &str) -> MapperResult<String> {
        if name.starts_with('$') || name == ID_KEY {
            return Ok(name.to_string());
        }
        Ok(self.field(name)?.absolute_name())
    }

    /// Adds a predicate.
    pub fn filter(mut self, expression: impl Into<QueryExpression>) -> MapperResult<Self> {
        let doc = expression.into().0;
        merge_filter(&mut self.filter, doc.clone())?;
        merge_filter(&mut self.clauses, doc)?;
        Ok(self)
    }

    /// Adds a raw predicate document whose keys are field names or paths.
    pub fn filter_doc(self, raw: Document) -> MapperResult<Self> {
        let mut resolved = Document::new();
        for (key, predicate) in raw {
            let mut clause = Document::new();
            clause.insert(self.wire_path(&key)?, predicate);
            merge_filter(&mut resolved, clause)?;
        }
        self.filter(QueryExpression(resolved))
    }

    /// Adds one equality predicate per `(field name, value)` pair.
    pub fn filter_by<I, K, V>(mut self, pairs: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in pairs {
            let predicate = self.field(name.as_ref())?.eq(value)?;
            self = self.filter(predicate)?;
        }
        Ok(self)
    }

    /// Adds the negation of `expression`.
    pub fn not_(self, expression: &QueryExpression) -> MapperResult<Self> {
        let negated = expression.not_()?;
        self.filter(negated)
    }

    /// Adds the disjunction of `expressions`.
    pub fn or_<I>(self, expressions: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = QueryExpression>,
    {
        let mut expressions = expressions.into_iter();
        let Some(first) = expressions.next() else {
            return Err(MapperError::BadQuery("or_ requires at least one expression".into()));
        };
        let combined = expressions.fold(first, QueryExpression::or_);
        self.filter(combined)
    }

    pub fn in_<I, V>(self, name: &str, values: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let predicate = self.field(name)?.in_(values)?;
        self.filter(predicate)
    }

    pub fn not_in<I, V>(self, name: &str, values: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let predicate = self.field(name)?.not_in(values)?;
        self.filter(predicate)
    }

    fn push_order(
        list: &mut Vec<(String, SortOrder)>,
        path: String,
        order: SortOrder,
        what: &str,
    ) -> MapperResult<()> {
        if list.iter().any(|(existing, _)| *existing == path) {
            return Err(MapperError::BadQuery(format!("Already {what} {path}")));
        }
        list.push((path, order));
        Ok(())
    }

    pub fn ascending(mut self, name: &str) -> MapperResult<Self> {
        let path = self.wire_path(name)?;
        Self::push_order(&mut self.sort, path, SortOrder::Ascending, "sorting by")?;
        Ok(self)
    }

    pub fn descending(mut self, name: &str) -> MapperResult<Self> {
        let path = self.wire_path(name)?;
        Self::push_order(&mut self.sort, path, SortOrder::Descending, "sorting by")?;
        Ok(self)
    }

    /// Appends several sort keys in order.
    pub fn sort<'a, I>(mut self, keys: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = (&'a str, SortOrder)>,
    {
        for (name, order) in keys {
            self = match order {
                SortOrder::Ascending => self.ascending(name)?,
                SortOrder::Descending => self.descending(name)?,
            };
        }
        Ok(self)
    }

    pub fn hint_asc(mut self, name: &str) -> MapperResult<Self> {
        let path = self.wire_path(name)?;
        Self::push_order(&mut self.hints, path, SortOrder::Ascending, "gave hint for")?;
        Ok(self)
    }

    pub fn hint_desc(mut self, name: &str) -> MapperResult<Self> {
        let path = self.wire_path(name)?;
        Self::push_order(&mut self.hints, path, SortOrder::Descending, "gave hint for")?;
        Ok(self)
    }

    /// Restricts the returned fields. The identity is always included.
    pub fn fields<I, S>(self, names: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = names
            .into_iter()
            .map(|name| self.field(name.as_ref()))
            .collect::<MapperResult<Vec<_>>>()?;
        Ok(self.select(fields))
    }

    /// Adds compiled fields (such as the field of an [`ElemMatch`]) to the projection.
    pub fn select<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = QueryField>,
    {
        let projection = self.fields.get_or_insert_with(Vec::new);
        for field in fields {
            let path = field.absolute_name();
            match projection.iter_mut().find(|(existing, _)| *existing == path) {
                Some(entry) => entry.1 = field.projection.clone(),
                None => projection.push((path, field.projection.clone())),
            }
        }
        if !projection.iter().any(|(path, _)| path == ID_KEY) {
            projection.push((ID_KEY.to_string(), Bson::Boolean(true)));
        }
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Matches this type's own discriminator value only.
    pub fn exclude_subclasses(mut self) -> MapperResult<Self> {
        let mut filter = self.schema.base_query(true);
        merge_filter(&mut filter, self.clauses.clone())?;
        self.filter = filter;
        self.exclude_subclasses = true;
        Ok(self)
    }

    /// Results are returned as wire documents instead of entities.
    pub fn raw_output(mut self) -> Self {
        self.raw_output = true;
        self
    }

    pub fn is_raw_output(&self) -> bool {
        self.raw_output
    }

    pub fn excludes_subclasses(&self) -> bool {
        self.exclude_subclasses
    }

    pub fn filter_document(&self) -> &Document {
        &self.filter
    }

    pub fn projection(&self) -> Option<Document> {
        self.fields.as_ref().map(|fields| {
            let mut doc = Document::new();
            for (path, projection) in fields {
                doc.insert(path.clone(), projection.clone());
            }
            doc
        })
    }

    /// Included top-level and nested paths of a partial projection.
    pub fn projected_paths(&self) -> Option<Vec<String>> {
        self.fields.as_ref().map(|fields| {
            fields
                .iter()
                .filter(|(_, projection)| !matches!(projection, Bson::Boolean(false)))
                .map(|(path, _)| path.clone())
                .collect()
        })
    }

    /// Explicit sort keys, falling back to the schema's default sort.
    pub fn sort_document(&self) -> MapperResult<Option<Document>> {
        let mut doc = Document::new();
        if self.sort.is_empty() {
            for (name, order) in self.schema.default_sort() {
                doc.insert(self.wire_path(name)?, order.as_i32());
            }
        } else {
            for (path, order) in &self.sort {
                doc.insert(path.clone(), order.as_i32());
            }
        }
        Ok((!doc.is_empty()).then_some(doc))
    }

    pub fn hint_document(&self) -> Option<Document> {
        if self.hints.is_empty() {
            return None;
        }
        let mut doc = Document::new();
        for (path, order) in &self.hints {
            doc.insert(path.clone(), order.as_i32());
        }
        Some(doc)
    }

    pub fn limit_value(&self) -> Option<i64> {
        self.limit
    }

    pub fn skip_value(&self) -> Option<u64> {
        self.skip
    }

    /// Driver parameters of the compiled query.
    pub fn find_options(&self) -> MapperResult<FindOptions> {
        Ok(FindOptions {
            filter: self.filter.clone(),
            projection: self.projection(),
            sort: self.sort_document()?,
            hint: self.hint_document(),
            skip: self.skip,
            limit: self.limit,
        })
    }

    /// Starts an update of the documents this query matches.
    pub fn update(self) -> UpdateExpression {
        UpdateExpression::new(self)
    }
}

/// A query selecting documents to delete.
#[derive(Debug, Clone)]
pub struct RemoveQuery {
    query: Query,
    safe: Option<bool>,
}

impl RemoveQuery {
    pub fn new(schema: &Arc<DocumentSchema>) -> Self {
        Self {
            query: Query::new(schema),
            safe: None,
        }
    }

    pub fn filter(mut self, expression: impl Into<QueryExpression>) -> MapperResult<Self> {
        self.query = self.query.filter(expression)?;
        Ok(self)
    }

    pub fn filter_by<I, K, V>(mut self, pairs: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.query = self.query.filter_by(pairs)?;
        Ok(self)
    }

    pub fn or_<I>(mut self, expressions: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = QueryExpression>,
    {
        self.query = self.query.or_(expressions)?;
        Ok(self)
    }

    pub fn in_<I, V>(mut self, name: &str, values: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.query = self.query.in_(name, values)?;
        Ok(self)
    }

    pub fn not_in<I, V>(mut self, name: &str, values: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.query = self.query.not_in(name, values)?;
        Ok(self)
    }

    pub fn set_safe(mut self, safe: bool) -> Self {
        self.safe = Some(safe);
        self
    }

    pub fn safe(&self) -> Option<bool> {
        self.safe
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn schema(&self) -> &Arc<DocumentSchema> {
        self.query.schema()
    }

    pub fn filter_document(&self) -> &Document {
        self.query.filter_document()
    }
}

impl From<Query> for RemoveQuery {
    fn from(query: Query) -> Self {
        Self { query, safe: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{IntKind, StringKind};

    fn bots() -> Arc<DocumentSchema> {
        let comment = DocumentSchema::builder("QueryComment")
            .field(FieldDescriptor::string("author").with_wire_name("a"))
            .field(FieldDescriptor::int("votes").optional())
            .build()
            .unwrap();
        DocumentSchema::builder("QueryBot")
            .field(FieldDescriptor::new("name", StringKind::new().max_length(255).uppercase().trim()))
            .field(FieldDescriptor::new("age", IntKind::new().max(100)))
            .field(FieldDescriptor::list("tags", FieldDescriptor::string("tag")).optional())
            .field(FieldDescriptor::list("comments", FieldDescriptor::document("comment", comment)).optional())
            .field(FieldDescriptor::anything("meta").optional())
            .build()
            .unwrap()
    }

    #[test]
    fn range_constraints_merge() {
        let schema = bots();
        let age = schema.field_path("age").unwrap();
        let query = Query::new(&schema)
            .filter(age.gt(4).unwrap())
            .unwrap()
            .filter(age.lt(6).unwrap())
            .unwrap();

        assert_eq!(
            query.filter_document(),
            &doc! { "age": { "$gt": 4_i64, "$lt": 6_i64 } }
        );
    }

    #[test]
    fn scalar_collisions_are_rejected() {
        let schema = bots();
        let age = schema.field_path("age").unwrap();
        let result = Query::new(&schema)
            .filter(age.eq(4).unwrap())
            .unwrap()
            .filter(age.eq(5).unwrap());

        assert!(matches!(result, Err(MapperError::BadQuery(_))));
    }

    #[test]
    fn filter_by_is_order_independent() {
        let schema = bots();
        let a = Query::new(&schema)
            .filter_by([("name", Value::from("bot")), ("age", Value::from(3))])
            .unwrap();
        let b = Query::new(&schema)
            .filter_by([("age", Value::from(3)), ("name", Value::from("bot"))])
            .unwrap();

        assert_eq!(a.filter_document(), b.filter_document());
        assert_eq!(a.filter_document().get_str("name").unwrap(), "BOT");
    }

    #[test]
    fn operands_are_validated_by_the_field() {
        let schema = bots();
        let age = schema.field_path("age").unwrap();
        assert!(matches!(age.gt(101), Err(MapperError::BadValue { .. })));
        assert!(matches!(age.eq("old"), Err(MapperError::BadValue { .. })));
    }

    #[test]
    fn paths_resolve_through_sequences_and_free_form_fields() {
        let schema = bots();

        assert_eq!(schema.field_path("comments.author").unwrap().absolute_name(), "comments.a");
        assert_eq!(schema.field_path("meta.x.y").unwrap().absolute_name(), "meta.x.y");
        assert_eq!(
            schema.field_path("comments.$.votes").unwrap().absolute_name(),
            "comments.$.votes"
        );
        assert_eq!(schema.field_path("mongo_id").unwrap().absolute_name(), "_id");

        match schema.field_path("comments.nope") {
            Err(MapperError::FieldNotFound { segment, path }) => {
                assert_eq!(segment, "nope");
                assert_eq!(path, "comments.nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn matched_index_targets_the_element() {
        let schema = bots();
        let tag = schema.field_path("tags").unwrap().matched_index().unwrap();

        assert_eq!(tag.absolute_name(), "tags.$");
        assert_eq!(tag.eq("x").unwrap().as_document(), &doc! { "tags.$": "x" });
        assert!(schema.field_path("age").unwrap().matched_index().is_err());
    }

    #[test]
    fn not_rewrites_each_predicate() {
        let schema = bots();
        let age = schema.field_path("age").unwrap();
        let name = schema.field_path("name").unwrap();

        let expr = name.eq("bot").unwrap().and(age.gt(4).unwrap()).unwrap();
        assert_eq!(
            expr.not_().unwrap().as_document(),
            &doc! { "name": { "$ne": "BOT" }, "age": { "$not": { "$gt": 4_i64 } } }
        );

        let mixed = QueryExpression::raw(doc! { "age": { "$gt": 4, "plain": 1 } });
        assert!(matches!(mixed.not_(), Err(MapperError::BadQuery(_))));
    }

    #[test]
    fn or_flattens_into_one_array() {
        let schema = bots();
        let age = schema.field_path("age").unwrap();
        let expr = age
            .eq(1)
            .unwrap()
            .or_(age.eq(2).unwrap())
            .or_(age.eq(3).unwrap());

        assert_eq!(
            expr.as_document(),
            &doc! { "$or": [{ "age": 1_i64 }, { "age": 2_i64 }, { "age": 3_i64 }] }
        );
    }

    #[test]
    fn or_keeps_sibling_constraints_outside_the_disjunction() {
        let schema = bots();
        let age = schema.field_path("age").unwrap();
        let name = schema.field_path("name").unwrap();
        let expr = age
            .eq(1)
            .unwrap()
            .or_(age.eq(2).unwrap())
            .and(name.eq("a").unwrap())
            .unwrap()
            .or_(age.eq(3).unwrap());

        assert_eq!(
            expr.as_document(),
            &doc! { "$or": [{ "age": 1_i64 }, { "age": 2_i64 }, { "age": 3_i64 }], "name": "A" }
        );
    }

    #[test]
    fn duplicate_sort_and_hint_keys_are_rejected() {
        let schema = bots();
        let query = Query::new(&schema).ascending("age").unwrap().descending("name").unwrap();
        assert_eq!(
            query.sort_document().unwrap(),
            Some(doc! { "age": 1, "name": -1 })
        );
        assert!(matches!(query.clone().descending("age"), Err(MapperError::BadQuery(_))));

        let hinted = query.hint_asc("age").unwrap();
        assert!(matches!(hinted.hint_asc("age"), Err(MapperError::BadQuery(_))));
    }

    #[test]
    fn projections_always_include_the_identity() {
        let schema = bots();
        let query = Query::new(&schema).fields(["name"]).unwrap();

        assert_eq!(query.projection(), Some(doc! { "name": true, "_id": true }));
        assert_eq!(
            query.projected_paths(),
            Some(vec!["name".to_string(), "_id".to_string()])
        );
    }

    #[test]
    fn elem_match_requires_a_sequence_and_projects_the_element() {
        let schema = bots();
        let comments = schema.field_path("comments").unwrap();
        let author = schema.field_path("comments.author").unwrap();
        let inner = QueryExpression::raw(doc! { "a": author.descriptor().wrap_value(&Value::from("x")).unwrap() });

        let matched = comments.elem_match(inner).unwrap();
        assert_eq!(
            matched.expression().as_document(),
            &doc! { "comments": { "$elemMatch": { "a": "x" } } }
        );
        let query = Query::new(&schema).select([matched.field().clone()]);
        assert_eq!(
            query.projection(),
            Some(doc! { "comments": { "$elemMatch": { "a": "x" } }, "_id": true })
        );

        let age = schema.field_path("age").unwrap();
        assert!(matches!(age.elem_match(QueryExpression::default()), Err(MapperError::BadQuery(_))));
    }

    #[test]
    fn regex_helpers_escape_literals() {
        let schema = bots();
        let name = schema.field_path("name").unwrap();

        assert_eq!(
            name.starts_with_ignore_case("a.b").as_document(),
            &doc! { "name": { "$regex": "^a\\.b", "$options": "i" } }
        );
        assert_eq!(name.ends_with("x").as_document(), &doc! { "name": { "$regex": "x$" } });
    }

    #[test]
    fn sources_must_agree_on_collection_and_type() {
        let a = DocumentSchema::builder("QuerySourceA").build().unwrap();
        let b = DocumentSchema::builder("QuerySourceB").build().unwrap();

        assert!(matches!(
            Query::from_sources([&a, &b]),
            Err(MapperError::MultipleCollectionsFound(_))
        ));

        let a2 = DocumentSchema::builder("QuerySourceA2").collection("QuerySourceA").build().unwrap();
        assert!(matches!(
            Query::from_sources([&a, &a2]),
            Err(MapperError::MultipleObjectsDetected(_))
        ));

        let query = Query::from_sources([&a]).unwrap();
        assert_eq!(query.collection(), "QuerySourceA");
        assert!(matches!(Query::named("QueryNeverRegistered"), Err(MapperError::UnknownType(_))));
    }
}
