//! Document schemas: the effective field set of an entity type plus its collection and
//! polymorphism metadata.
//!
//! Schemas are assembled once with a [`DocumentSchemaBuilder`] and are immutable
//! afterwards; they are shared as `Arc<DocumentSchema>`. Registering a schema with
//! [`registry::register`](crate::registry::register) makes it visible to string-named
//! queries, reference resolution and polymorphic unwrapping.
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::{field::FieldDescriptor, schema::DocumentSchema};
//!
//! let animal = DocumentSchema::builder("Animal")
//!     .field(FieldDescriptor::string("kind"))
//!     .field(FieldDescriptor::string("name"))
//!     .polymorphic_on("kind")
//!     .identity_value("animal")
//!     .register()?;
//!
//! let dog = DocumentSchema::builder("Dog")
//!     .extends(&animal)
//!     .field(FieldDescriptor::int("good_boy_points").optional())
//!     .identity_value("dog")
//!     .register()?;
//! assert_eq!(dog.collection(), "Animal");
//! ```

use std::{fmt, sync::Arc};

use bson::{Bson, Document, doc};
use indexmap::IndexMap;

use crate::{
    entity::Entity,
    error::{MapperError, MapperResult},
    field::{FieldDescriptor, ID_KEY},
    query::QueryField,
    registry,
};

/// Handling of incoming fields that are not part of the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtraFields {
    #[default]
    Error,
    /// Unknown fields are kept on the entity and written back unchanged.
    Ignore,
}

/// Sort direction for sorts, hints and index components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_i32(&self) -> i32 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }

    pub fn from_i32(direction: i32) -> Option<Self> {
        match direction {
            1 => Some(SortOrder::Ascending),
            -1 => Some(SortOrder::Descending),
            _ => None,
        }
    }
}

/// A single, possibly compound, index on a collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexSpec {
    components: Vec<(String, SortOrder)>,
    unique: bool,
    expire_after_secs: Option<u64>,
}

impl IndexSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(mut self, name: impl Into<String>) -> Self {
        self.components.push((name.into(), SortOrder::Ascending));
        self
    }

    pub fn descending(mut self, name: impl Into<String>) -> Self {
        self.components.push((name.into(), SortOrder::Descending));
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Documents expire `seconds` after the indexed date.
    pub fn expire(mut self, seconds: u64) -> Self {
        self.expire_after_secs = Some(seconds);
        self
    }

    pub fn components(&self) -> &[(String, SortOrder)] {
        &self.components
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn expire_after_secs(&self) -> Option<u64> {
        self.expire_after_secs
    }

    /// The key document (`{path: 1|-1, ...}`).
    pub fn keys(&self) -> Document {
        let mut keys = Document::new();
        for (path, order) in &self.components {
            keys.insert(path.clone(), order.as_i32());
        }
        keys
    }

    /// Conventional index name, `path_1_other_-1`.
    pub fn name(&self) -> String {
        self.components
            .iter()
            .map(|(path, order)| format!("{path}_{}", order.as_i32()))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// The effective field set and metadata of an entity type.
pub struct DocumentSchema {
    type_name: String,
    collection: String,
    parent: Option<Arc<DocumentSchema>>,
    fields: IndexMap<String, FieldDescriptor>,
    polymorphic_on: Option<String>,
    identity_value: Option<Bson>,
    polymorphic_collection: bool,
    default_sort: Vec<(String, SortOrder)>,
    extra_fields: ExtraFields,
    indexes: Vec<IndexSpec>,
}

impl fmt::Debug for DocumentSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentSchema")
            .field("type_name", &self.type_name)
            .field("collection", &self.collection)
            .field("parent", &self.parent.as_ref().map(|p| p.type_name()))
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("polymorphic_on", &self.polymorphic_on)
            .field("identity_value", &self.identity_value)
            .finish_non_exhaustive()
    }
}

impl DocumentSchema {
    pub fn builder(type_name: impl Into<String>) -> DocumentSchemaBuilder {
        DocumentSchemaBuilder::new(type_name)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn parent(&self) -> Option<&Arc<DocumentSchema>> {
        self.parent.as_ref()
    }

    pub fn fields(&self) -> &IndexMap<String, FieldDescriptor> {
        &self.fields
    }

    /// Looks a field up by name, falling back to its wire name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields
            .get(name)
            .or_else(|| self.fields.values().find(|field| field.wire_name() == name))
    }

    pub(crate) fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.get_index_of(name)
    }

    pub(crate) fn field_by_wire(&self, wire_name: &str) -> Option<(usize, &FieldDescriptor)> {
        self.fields
            .values()
            .enumerate()
            .find(|(_, field)| field.wire_name() == wire_name)
    }

    pub fn identity_field(&self) -> Option<&FieldDescriptor> {
        self.fields.values().find(|field| field.is_identity())
    }

    pub fn polymorphic_on(&self) -> Option<&str> {
        self.polymorphic_on.as_deref()
    }

    pub fn identity_value(&self) -> Option<&Bson> {
        self.identity_value.as_ref()
    }

    pub fn default_sort(&self) -> &[(String, SortOrder)] {
        &self.default_sort
    }

    pub fn extra_fields(&self) -> ExtraFields {
        self.extra_fields
    }

    /// Indexes with their components resolved to wire paths.
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Whether `self` is `other` or one of its descendants.
    pub fn is_a(&self, other: &DocumentSchema) -> bool {
        let mut current = Some(self);
        while let Some(schema) = current {
            if schema.type_name == other.type_name {
                return true;
            }
            current = schema.parent.as_deref();
        }
        false
    }

    /// Wire name of the discriminator field.
    fn discriminator_wire_name(&self) -> Option<&str> {
        let name = self.polymorphic_on.as_deref()?;
        self.field(name).map(FieldDescriptor::wire_name)
    }

    /// Filter restricting a collection to this type.
    ///
    /// Non-polymorphic types get `{}`. With `exclude_subclasses` the filter matches this
    /// type's own discriminator value only; otherwise it matches this type and every
    /// registered subtype with an `$in` over their discriminator values.
    pub fn base_query(&self, exclude_subclasses: bool) -> Document {
        let Some(wire_name) = self.discriminator_wire_name() else {
            return Document::new();
        };

        if exclude_subclasses {
            return match &self.identity_value {
                Some(value) => doc! { wire_name: value.clone() },
                None => Document::new(),
            };
        }

        let mut keys: Vec<Bson> = registry::subclasses_of(&self.type_name)
            .iter()
            .filter_map(|sub| sub.identity_value.clone())
            .collect();
        if let Some(value) = &self.identity_value {
            keys.push(value.clone());
        }
        if keys.is_empty() {
            return Document::new();
        }
        doc! { wire_name: { "$in": keys } }
    }

    /// The most specific registered subtype matching the discriminator value of `wire`, or
    /// `None` when that is this type (or nothing matches).
    pub fn get_subclass(&self, wire: &Document) -> Option<Arc<DocumentSchema>> {
        let wire_name = self.discriminator_wire_name()?;
        let value = wire.get(wire_name)?;
        let subclass = registry::subclass_for(&self.type_name, value)?;
        if subclass.type_name == self.type_name {
            return None;
        }
        Some(subclass.get_subclass(wire).unwrap_or(subclass))
    }

    /// Rebuilds an entity from a wire document, delegating to the most specific
    /// registered subtype. `fields` lists the projected paths of a partial load.
    pub fn unwrap(self: &Arc<Self>, wire: Document, fields: Option<&[String]>) -> MapperResult<Entity> {
        if let Some(subclass) = self.get_subclass(&wire) {
            return subclass.unwrap(wire, fields);
        }
        Entity::from_wire(Arc::clone(self), wire, fields)
    }

    /// A fresh entity of this type with defaults applied.
    pub fn new_entity(self: &Arc<Self>) -> Entity {
        Entity::new(Arc::clone(self))
    }

    /// Resolves a dotted field path (`"comments.author.name"`).
    pub fn field_path(self: &Arc<Self>, path: &str) -> MapperResult<QueryField> {
        QueryField::resolve(self, path)
    }
}

/// Assembles a [`DocumentSchema`].
#[derive(Debug)]
pub struct DocumentSchemaBuilder {
    type_name: String,
    collection: Option<String>,
    parent: Option<Arc<DocumentSchema>>,
    fields: Vec<FieldDescriptor>,
    polymorphic_on: Option<String>,
    identity_value: Option<Bson>,
    polymorphic_collection: Option<bool>,
    default_sort: Option<Vec<(String, SortOrder)>>,
    extra_fields: Option<ExtraFields>,
    indexes: Vec<IndexSpec>,
}

impl DocumentSchemaBuilder {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            collection: None,
            parent: None,
            fields: Vec::new(),
            polymorphic_on: None,
            identity_value: None,
            polymorphic_collection: None,
            default_sort: None,
            extra_fields: None,
            indexes: Vec::new(),
        }
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn extends(mut self, parent: &Arc<DocumentSchema>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Names the discriminator field. Inherited by subtypes.
    pub fn polymorphic_on(mut self, field: impl Into<String>) -> Self {
        self.polymorphic_on = Some(field.into());
        self
    }

    /// Discriminator value identifying this type.
    pub fn identity_value(mut self, value: impl Into<Bson>) -> Self {
        self.identity_value = Some(value.into());
        self
    }

    /// Subtypes store their documents in this type's collection.
    pub fn polymorphic_collection(mut self) -> Self {
        self.polymorphic_collection = Some(true);
        self
    }

    pub fn default_sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.default_sort.get_or_insert_with(Vec::new).push((field.into(), order));
        self
    }

    pub fn extra_fields(mut self, mode: ExtraFields) -> Self {
        self.extra_fields = Some(mode);
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn build(self) -> MapperResult<Arc<DocumentSchema>> {
        for field in &self.fields {
            field.validate_config()?;
        }

        let declares_identity = self.fields.iter().any(FieldDescriptor::is_identity);
        let mut fields: IndexMap<String, FieldDescriptor> = IndexMap::new();

        match &self.parent {
            Some(parent) => {
                for (name, field) in parent.fields() {
                    if declares_identity && field.is_identity() {
                        continue;
                    }
                    fields.insert(name.clone(), field.clone());
                }
            }
            None if !declares_identity => {
                let id = FieldDescriptor::mongo_id();
                fields.insert(id.name().to_string(), id);
            }
            None => {}
        }
        for field in self.fields {
            fields.insert(field.name().to_string(), field);
        }

        let identities: Vec<&str> = fields
            .values()
            .filter(|f| f.is_identity())
            .map(FieldDescriptor::name)
            .collect();
        if identities.len() > 1 {
            return Err(MapperError::InvalidConfig(format!(
                "{} declares more than one identity field: {:?}",
                self.type_name, identities
            )));
        }
        for (index, field) in fields.values().enumerate() {
            if let Some((_, other)) = fields
                .values()
                .enumerate()
                .find(|(other_index, other)| *other_index != index && other.wire_name() == field.wire_name())
            {
                return Err(MapperError::InvalidConfig(format!(
                    "{}: fields {} and {} share the wire name {}",
                    self.type_name,
                    field.name(),
                    other.name(),
                    field.wire_name()
                )));
            }
        }

        let parent = self.parent;
        let polymorphic_on = self
            .polymorphic_on
            .or_else(|| parent.as_ref().and_then(|p| p.polymorphic_on.clone()));
        if let Some(name) = &polymorphic_on
            && !fields.contains_key(name)
        {
            return Err(MapperError::InvalidConfig(format!(
                "{}: discriminator field {} is not a field",
                self.type_name, name
            )));
        }

        let inherits_collection = parent
            .as_ref()
            .is_some_and(|p| p.polymorphic_collection || p.polymorphic_on.is_some());
        let collection = match (self.collection, &parent) {
            (Some(collection), _) => collection,
            (None, Some(parent)) if inherits_collection => parent.collection.clone(),
            (None, _) => self.type_name.clone(),
        };

        let polymorphic_collection = self
            .polymorphic_collection
            .unwrap_or_else(|| parent.as_ref().is_some_and(|p| p.polymorphic_collection));
        let default_sort = self
            .default_sort
            .or_else(|| parent.as_ref().map(|p| p.default_sort.clone()))
            .unwrap_or_default();
        let extra_fields = self
            .extra_fields
            .or_else(|| parent.as_ref().map(|p| p.extra_fields))
            .unwrap_or_default();

        let mut indexes = parent.as_ref().map(|p| p.indexes.clone()).unwrap_or_default();

        let mut schema = DocumentSchema {
            type_name: self.type_name,
            collection,
            parent,
            fields,
            polymorphic_on,
            identity_value: self.identity_value,
            polymorphic_collection,
            default_sort,
            extra_fields,
            indexes: Vec::new(),
        };

        for index in self.indexes {
            let mut resolved = IndexSpec {
                components: Vec::with_capacity(index.components.len()),
                unique: index.unique,
                expire_after_secs: index.expire_after_secs,
            };
            for (name, order) in index.components {
                let path = resolve_wire_path(&schema, &name)?;
                resolved.components.push((path, order));
            }
            indexes.push(resolved);
        }
        schema.indexes = indexes;

        Ok(Arc::new(schema))
    }

    /// Builds the schema and registers it in the process-wide registry.
    pub fn register(self) -> MapperResult<Arc<DocumentSchema>> {
        Ok(registry::register(self.build()?))
    }
}

/// Wire path of a dotted field name, without the positional or sequence machinery used
/// by queries.
fn resolve_wire_path(schema: &DocumentSchema, path: &str) -> MapperResult<String> {
    if path == ID_KEY || path.starts_with('$') {
        return Ok(path.to_string());
    }
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut field = schema
        .field(first)
        .cloned()
        .ok_or_else(|| MapperError::field_not_found(first, path))?;
    let mut wire = vec![field.wire_name().to_string()];
    for segment in segments {
        field = field
            .kind()
            .subfield(segment)
            .ok_or_else(|| MapperError::field_not_found(segment, path))?;
        wire.push(field.wire_name().to_string());
    }
    Ok(wire.join("."))
}
