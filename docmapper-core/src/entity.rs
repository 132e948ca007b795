//! Entity instances: a schema handle plus one [`ValueSlot`] per field.
//!
//! Entities are plain owned values. Field access goes through the schema's descriptors so
//! every write is validated and normalised before it lands in a slot, and every slot knows
//! which update operator it needs when the entity is next flushed.

use std::{
    fmt,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError},
};

use bson::{Bson, Document, doc, oid::ObjectId};

use crate::{
    config::PartialWritePolicy,
    error::{MapperError, MapperResult},
    field::{FieldDescriptor, Modifier, merge_ops},
    schema::{DocumentSchema, ExtraFields},
    value::{Reference, Value, ValueSlot},
};

/// An instance of a document type.
#[derive(Clone)]
pub struct Entity {
    schema: Arc<DocumentSchema>,
    slots: Vec<ValueSlot>,
    extras: Document,
    loaded_extras: Document,
    partial: bool,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct(self.schema.type_name());
        for (field, slot) in self.schema.fields().values().zip(&self.slots) {
            if let Some(value) = slot.value() {
                out.field(field.name(), value);
            }
        }
        if !self.extras.is_empty() {
            out.field("extras", &self.extras);
        }
        out.finish()
    }
}

/// Structural equality: same type, same field values and same extra fields. Slot states
/// are not compared.
impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.schema.type_name() == other.schema.type_name()
            && self.extras == other.extras
            && self
                .slots
                .iter()
                .zip(&other.slots)
                .all(|(a, b)| a.value() == b.value())
    }
}

impl Entity {
    /// A fresh entity. Defaults are applied (and left dirty) and the discriminator is set
    /// to the type's identity value.
    pub fn new(schema: Arc<DocumentSchema>) -> Self {
        let mut slots = Vec::with_capacity(schema.fields().len());
        for field in schema.fields().values() {
            let mut slot = ValueSlot::new();
            if let Some(default) = field.default_value() {
                slot.write(default, field.on_update().modifier());
            }
            slots.push(slot);
        }

        let mut entity = Self {
            schema,
            slots,
            extras: Document::new(),
            loaded_extras: Document::new(),
            partial: false,
        };

        if let (Some(name), Some(identity)) = (
            entity.schema.polymorphic_on().map(str::to_string),
            entity.schema.identity_value().cloned(),
        ) && let Some(index) = entity.schema.field_index(&name)
        {
            let field = &entity.schema.fields()[index];
            if let Ok(value) = field.unwrap(identity) {
                entity.slots[index].write(value, field.on_update().modifier());
            }
        }

        entity
    }

    /// Builds an entity from `(name, value)` pairs and checks that every required field
    /// without a default received a value.
    pub fn create<I, K, V>(schema: Arc<DocumentSchema>, values: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut entity = Self::new(schema);
        for (name, value) in values {
            entity.set(name.as_ref(), value)?;
        }
        for (field, slot) in entity.schema.fields().values().zip(&entity.slots) {
            if field.is_required() && !slot.is_set() {
                return Err(MapperError::MissingValue(field.name().to_string()));
            }
        }
        Ok(entity)
    }

    /// Rebuilds an entity of exactly `schema` from its wire form. `fields` lists the paths
    /// of a partial projection; top-level fields outside it stay unretrieved.
    pub(crate) fn from_wire(
        schema: Arc<DocumentSchema>,
        wire: Document,
        fields: Option<&[String]>,
    ) -> MapperResult<Self> {
        let retrieved: Option<Vec<&str>> = fields.map(|paths| {
            paths
                .iter()
                .map(|path| path.split('.').next().unwrap_or_default())
                .collect()
        });

        let slots = schema
            .fields()
            .values()
            .map(|field| match &retrieved {
                Some(names)
                    if !field.is_identity()
                        && !names.iter().any(|n| *n == field.wire_name() || *n == field.name()) =>
                {
                    ValueSlot::unretrieved()
                }
                _ => ValueSlot::new(),
            })
            .collect();

        let mut entity = Self {
            schema: Arc::clone(&schema),
            slots,
            extras: Document::new(),
            loaded_extras: Document::new(),
            partial: fields.is_some(),
        };

        for (key, wire_value) in wire {
            match schema.field_by_wire(&key) {
                Some((index, field)) => {
                    let value = field.unwrap(wire_value)?;
                    entity.slots[index].load(value);
                }
                None => match schema.extra_fields() {
                    ExtraFields::Ignore => {
                        entity.extras.insert(key, wire_value);
                    }
                    ExtraFields::Error => return Err(MapperError::ExtraValue(key)),
                },
            }
        }

        entity.mark_clean();
        Ok(entity)
    }

    pub fn schema(&self) -> &Arc<DocumentSchema> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.type_name()
    }

    /// Whether the entity was loaded through a partial projection.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    fn position(&self, name: &str) -> MapperResult<(usize, &FieldDescriptor)> {
        let field = self
            .schema
            .field(name)
            .ok_or_else(|| MapperError::field_not_found(name, self.schema.type_name()))?;
        let index = self
            .schema
            .field_index(field.name())
            .ok_or_else(|| MapperError::field_not_found(name, self.schema.type_name()))?;
        Ok((index, field))
    }

    /// Reads a field, applying its default the first time an unset slot is read.
    pub fn get(&mut self, name: &str) -> MapperResult<&Value> {
        let (index, field) = self.position(name)?;
        if !self.slots[index].is_set() {
            let Some(default) = field.default_value() else {
                return Err(self.slots[index].missing(field.name()));
            };
            let op = field.on_update().modifier();
            self.slots[index].write(default, op);
        }
        self.slots[index]
            .value()
            .ok_or_else(|| MapperError::FieldNotSet(name.to_string()))
    }

    /// Reads a field without applying defaults.
    pub fn peek(&self, name: &str) -> Option<&Value> {
        let (index, _) = self.position(name).ok()?;
        self.slots[index].value()
    }

    /// Reads a field by value. Unset fields yield their default without storing it.
    pub fn value(&self, name: &str) -> MapperResult<Value> {
        let (index, field) = self.position(name)?;
        let slot = &self.slots[index];
        match slot.value() {
            Some(value) => Ok(value.clone()),
            None => field.default_value().ok_or_else(|| slot.missing(field.name())),
        }
    }

    /// The slot backing `name`.
    pub fn slot(&self, name: &str) -> Option<&ValueSlot> {
        let (index, _) = self.position(name).ok()?;
        self.slots.get(index)
    }

    /// Validates and stores a value. Names that are not fields become extra fields when
    /// the schema ignores extras.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> MapperResult<()> {
        let value = value.into();
        if self.schema.field(name).is_none() {
            return self.set_extra(name, value.to_bson()?);
        }
        let (index, field) = self.position(name)?;
        let value = field.validate_wrap(value)?;
        let op = field.on_update().modifier();
        self.slots[index].write(value, op);
        Ok(())
    }

    /// Schedules an `$unset` of the field.
    pub fn unset(&mut self, name: &str) -> MapperResult<()> {
        if self.schema.field(name).is_none() && self.extras.contains_key(name) {
            self.extras.remove(name);
            return Ok(());
        }
        let (index, field) = self.position(name)?;
        if !self.slots[index].is_set() {
            return Err(self.slots[index].missing(field.name()));
        }
        self.slots[index].delete();
        Ok(())
    }

    /// Mutable access to an embedded document. Changes made through it surface as
    /// prefixed dirty-ops of this entity.
    pub fn embedded_mut(&mut self, name: &str) -> MapperResult<&mut Entity> {
        let (index, field) = self.position(name)?;
        let field_name = field.name().to_string();
        let slot = &mut self.slots[index];
        if !slot.is_set() {
            return Err(slot.missing(&field_name));
        }
        match slot.value_mut() {
            Some(Value::Document(entity)) => Ok(&mut **entity),
            other => Err(MapperError::bad_value(field_name, other, "not an embedded document")),
        }
    }

    /// Whether the field holds a value or can produce one from a default.
    pub fn contains(&self, name: &str) -> bool {
        let Ok((index, field)) = self.position(name) else {
            return self.extras.contains_key(name);
        };
        let slot = &self.slots[index];
        slot.is_set() || (slot.is_retrieved() && field.has_default())
    }

    fn identity_index(&self) -> Option<(usize, &FieldDescriptor)> {
        self.schema
            .fields()
            .values()
            .enumerate()
            .find(|(_, field)| field.is_identity())
    }

    /// Native identity value.
    pub fn id(&self) -> Option<&Value> {
        let (index, _) = self.identity_index()?;
        self.slots[index].value()
    }

    pub fn has_id(&self) -> bool {
        self.id().is_some_and(|id| !id.is_null())
    }

    /// Wire form of the identity.
    pub fn wire_id(&self) -> MapperResult<Option<Bson>> {
        let Some((index, field)) = self.identity_index() else {
            return Ok(None);
        };
        match self.slots[index].value() {
            Some(value) if !value.is_null() => Ok(Some(field.wrap(value)?)),
            _ => Ok(None),
        }
    }

    pub fn set_id(&mut self, id: impl Into<Value>) -> MapperResult<()> {
        let name = self
            .identity_index()
            .map(|(_, field)| field.name().to_string())
            .ok_or_else(|| MapperError::InvalidConfig(format!("{} has no identity field", self.type_name())))?;
        self.set(&name, id)
    }

    /// Returns the wire identity, minting an ObjectId or UUID first when the identity
    /// field accepts one and is unset.
    pub(crate) fn ensure_id(&mut self) -> MapperResult<Bson> {
        if let Some(id) = self.wire_id()? {
            return Ok(id);
        }
        let Some((index, field)) = self.identity_index() else {
            return Err(MapperError::InvalidConfig(format!(
                "{} has no identity field",
                self.type_name()
            )));
        };
        let minted = field
            .validate_wrap(Value::ObjectId(ObjectId::new()))
            .or_else(|_| field.validate_wrap(Value::Uuid(uuid::Uuid::new_v4())))
            .map_err(|_| MapperError::MissingValue(field.name().to_string()))?;
        let wire = field.wrap(&minted)?;
        let op = field.on_update().modifier();
        self.slots[index].write(minted, op);
        Ok(wire)
    }

    /// A reference to this entity.
    pub fn to_ref(&self) -> MapperResult<Reference> {
        match self.wire_id()? {
            Some(id) => Ok(Reference::new(self.schema.collection(), id)),
            None => {
                let name = self
                    .identity_index()
                    .map(|(_, field)| field.name().to_string())
                    .unwrap_or_default();
                Err(MapperError::MissingValue(name))
            }
        }
    }

    /// Wire form of the whole entity. Required fields that were never retrieved are an
    /// error.
    pub fn wrap(&self) -> MapperResult<Document> {
        self.wrap_with(PartialWritePolicy::Error)
    }

    /// Wire form of the whole entity, extra fields first.
    pub fn wrap_with(&self, policy: PartialWritePolicy) -> MapperResult<Document> {
        let mut out = self.extras.clone();
        for (field, slot) in self.schema.fields().values().zip(&self.slots) {
            let value = match slot.value() {
                Some(value) => value.clone(),
                None => match field.default_value() {
                    Some(default) if slot.is_retrieved() => default,
                    _ if !field.is_required() => continue,
                    _ if !slot.is_retrieved() => match policy {
                        PartialWritePolicy::Error => {
                            return Err(MapperError::FieldNotRetrieved(field.name().to_string()));
                        }
                        PartialWritePolicy::SkipIfUnfetched => continue,
                    },
                    _ => return Err(MapperError::MissingValue(field.name().to_string())),
                },
            };
            out.insert(field.wire_name(), field.wrap(&value)?);
        }
        Ok(out)
    }

    /// Folds every field's pending operators into one update document. With
    /// `with_required`, required fields without a pending operator are written with their
    /// current value.
    pub fn get_dirty_ops(&self, with_required: bool) -> MapperResult<Document> {
        let mut ops = Document::new();
        for (field, slot) in self.schema.fields().values().zip(&self.slots) {
            if field.is_identity() {
                continue;
            }
            let mut field_ops = field.dirty_ops(slot)?;
            if field_ops.is_empty() && with_required && field.is_required() {
                let value = match slot.value() {
                    Some(value) => value.clone(),
                    None => field
                        .default_value()
                        .ok_or_else(|| MapperError::MissingValue(field.name().to_string()))?,
                };
                let op = field.on_update().modifier().unwrap_or(Modifier::Set);
                let mut fields = Document::new();
                fields.insert(field.wire_name(), field.wrap(&value)?);
                field_ops = doc! { op.as_str(): fields };
            }
            merge_ops(&mut ops, field_ops);
        }

        if self.schema.extra_fields() == ExtraFields::Ignore {
            let mut set = Document::new();
            let mut unset = Document::new();
            for (key, value) in &self.extras {
                if self.loaded_extras.get(key) != Some(value) {
                    set.insert(key.clone(), value.clone());
                }
            }
            for key in self.loaded_extras.keys() {
                if !self.extras.contains_key(key) {
                    unset.insert(key.clone(), true);
                }
            }
            let mut extra_ops = Document::new();
            if !set.is_empty() {
                extra_ops.insert("$set", set);
            }
            if !unset.is_empty() {
                extra_ops.insert("$unset", unset);
            }
            merge_ops(&mut ops, extra_ops);
        }

        Ok(ops)
    }

    /// Clears every slot's dirty state, embedded documents included. Values are untouched.
    pub fn mark_clean(&mut self) {
        for slot in &mut self.slots {
            slot.clear_dirty();
            if let Some(value) = slot.value_mut() {
                mark_nested_clean(value);
            }
        }
        self.loaded_extras = self.extras.clone();
    }

    /// Whether flushing the entity would produce any update operator.
    pub fn is_dirty(&self) -> bool {
        self.get_dirty_ops(false).map(|ops| !ops.is_empty()).unwrap_or(true)
    }

    pub fn extras(&self) -> &Document {
        &self.extras
    }

    pub fn extra(&self, name: &str) -> Option<&Bson> {
        self.extras.get(name)
    }

    /// Stores a value under a name that is not a field. Fails with `ExtraValue` unless the
    /// schema ignores extra fields.
    pub fn set_extra(&mut self, name: &str, value: impl Into<Bson>) -> MapperResult<()> {
        if self.schema.extra_fields() == ExtraFields::Error || self.schema.field(name).is_some() {
            return Err(MapperError::ExtraValue(name.to_string()));
        }
        self.extras.insert(name, value.into());
        Ok(())
    }

    pub fn remove_extra(&mut self, name: &str) -> Option<Bson> {
        self.extras.remove(name)
    }
}

fn mark_nested_clean(value: &mut Value) {
    match value {
        Value::Document(entity) => entity.mark_clean(),
        Value::List(items) | Value::Set(items) | Value::Tuple(items) => {
            items.iter_mut().for_each(mark_nested_clean);
        }
        Value::Map(map) => map.values_mut().for_each(mark_nested_clean),
        _ => {}
    }
}

/// Shared handle to an entity held by a session's identity cache.
///
/// Clones point at the same entity; [`SharedEntity::ptr_eq`] tells whether two handles
/// came from the same cache entry.
#[derive(Debug, Clone)]
pub struct SharedEntity(Arc<RwLock<Entity>>);

impl SharedEntity {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &SharedEntity) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A detached copy of the current state.
    pub fn snapshot(&self) -> Entity {
        self.read().clone()
    }
}

impl From<Entity> for SharedEntity {
    fn from(entity: Entity) -> Self {
        Self::new(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kind::{IntKind, StringKind},
        schema::DocumentSchema,
    };

    fn bot_schema(type_name: &str) -> Arc<DocumentSchema> {
        DocumentSchema::builder(type_name)
            .field(FieldDescriptor::new(
                "name",
                StringKind::new().max_length(255).uppercase().trim(),
            ))
            .field(FieldDescriptor::new("age", IntKind::new().max(100)))
            .build()
            .unwrap()
    }

    #[test]
    fn create_normalises_and_checks_required_fields() {
        let schema = bot_schema("EntityBot");

        let mut bot = Entity::create(
            Arc::clone(&schema),
            [("name", Value::from("Bot")), ("age", Value::from(5))],
        )
        .unwrap();
        assert_eq!(bot.get("name").unwrap(), &Value::from("BOT"));
        assert_eq!(bot.get("age").unwrap(), &Value::Int(5));

        match Entity::create(schema, [("age", 5)]) {
            Err(MapperError::MissingValue(name)) => assert_eq!(name, "name"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_names_are_rejected_by_default() {
        let schema = bot_schema("EntityStrict");
        let result = Entity::create(schema, [("colour", "red")]);
        assert!(matches!(result, Err(MapperError::ExtraValue(name)) if name == "colour"));
    }

    #[test]
    fn wrap_reports_missing_required_fields() {
        let schema = bot_schema("EntityWrapMissing");
        let mut entity = Entity::new(schema);
        entity.set("name", "bot").unwrap();

        assert!(matches!(entity.wrap(), Err(MapperError::MissingValue(name)) if name == "age"));
        assert!(matches!(
            entity.get_dirty_ops(true),
            Err(MapperError::MissingValue(name)) if name == "age"
        ));
    }

    #[test]
    fn dirty_ops_cover_only_written_fields() {
        let schema = bot_schema("EntityDirty");
        let wire = doc! { "_id": ObjectId::new(), "name": "BOT", "age": 5_i64 };
        let mut entity = schema.unwrap(wire, None).unwrap();
        assert!(entity.get_dirty_ops(false).unwrap().is_empty());

        entity.set("age", 6).unwrap();
        assert_eq!(entity.get_dirty_ops(false).unwrap(), doc! { "$set": { "age": 6_i64 } });
        assert_eq!(
            entity.get_dirty_ops(true).unwrap(),
            doc! { "$set": { "name": "BOT", "age": 6_i64 } }
        );
    }

    #[test]
    fn mark_clean_is_idempotent() {
        let schema = bot_schema("EntityClean");
        let mut entity = Entity::create(schema, [("name", Value::from("a")), ("age", Value::from(1))]).unwrap();

        entity.mark_clean();
        let once = entity.clone();
        entity.mark_clean();

        assert_eq!(entity, once);
        assert!(!entity.is_dirty());
        assert_eq!(entity.peek("age"), Some(&Value::Int(1)));
    }

    #[test]
    fn partial_loads_follow_the_write_policy() {
        let schema = bot_schema("EntityPartial");
        let wire = doc! { "_id": ObjectId::new(), "age": 5_i64 };
        let fields = vec!["age".to_string()];
        let mut entity = schema.unwrap(wire, Some(&fields)).unwrap();

        assert!(entity.is_partial());
        assert!(matches!(entity.get("name"), Err(MapperError::FieldNotRetrieved(_))));
        assert!(matches!(
            entity.wrap_with(PartialWritePolicy::Error),
            Err(MapperError::FieldNotRetrieved(name)) if name == "name"
        ));

        let wire = entity.wrap_with(PartialWritePolicy::SkipIfUnfetched).unwrap();
        assert!(!wire.contains_key("name"));
        assert_eq!(wire.get_i64("age").unwrap(), 5);
    }

    #[test]
    fn defaults_apply_on_first_read() {
        let schema = DocumentSchema::builder("EntityDefaults")
            .field(FieldDescriptor::int("count").with_default(3))
            .build()
            .unwrap();
        let mut entity = schema.unwrap(doc! { "_id": ObjectId::new() }, None).unwrap();

        assert!(entity.peek("count").is_none());
        assert_eq!(entity.value("count").unwrap(), Value::Int(3));
        assert_eq!(entity.get("count").unwrap(), &Value::Int(3));
        assert_eq!(entity.get_dirty_ops(false).unwrap(), doc! { "$set": { "count": 3_i64 } });
    }

    #[test]
    fn extra_fields_are_kept_and_diffed_when_ignored() {
        let schema = DocumentSchema::builder("EntityExtras")
            .field(FieldDescriptor::string("name"))
            .extra_fields(ExtraFields::Ignore)
            .build()
            .unwrap();
        let wire = doc! { "_id": ObjectId::new(), "name": "a", "legacy": 1, "old": true };
        let mut entity = schema.unwrap(wire, None).unwrap();
        assert_eq!(entity.extra("legacy"), Some(&Bson::Int32(1)));

        entity.set_extra("legacy", 2).unwrap();
        entity.remove_extra("old");
        assert_eq!(
            entity.get_dirty_ops(false).unwrap(),
            doc! { "$set": { "legacy": 2 }, "$unset": { "old": true } }
        );

        let wrapped = entity.wrap().unwrap();
        assert_eq!(wrapped.keys().next().map(String::as_str), Some("legacy"));
    }

    #[test]
    fn embedded_changes_surface_as_prefixed_ops() {
        let address = DocumentSchema::builder("EntityAddress")
            .field(FieldDescriptor::string("city"))
            .build()
            .unwrap();
        let person = DocumentSchema::builder("EntityPerson")
            .field(FieldDescriptor::document("address", Arc::clone(&address)).with_wire_name("addr"))
            .build()
            .unwrap();

        let wire = doc! { "_id": ObjectId::new(), "addr": { "_id": ObjectId::new(), "city": "Oslo" } };
        let mut entity = person.unwrap(wire, None).unwrap();
        entity.embedded_mut("address").unwrap().set("city", "Bergen").unwrap();

        assert_eq!(
            entity.get_dirty_ops(false).unwrap(),
            doc! { "$set": { "addr.city": "Bergen" } }
        );
        entity.mark_clean();
        assert!(entity.get_dirty_ops(false).unwrap().is_empty());
    }

    #[test]
    fn ensure_id_mints_an_object_id() {
        let schema = bot_schema("EntityMint");
        let mut entity = Entity::new(schema);
        assert!(!entity.has_id());

        let id = entity.ensure_id().unwrap();
        assert!(matches!(id, Bson::ObjectId(_)));
        assert_eq!(entity.ensure_id().unwrap(), id);
        assert_eq!(entity.to_ref().unwrap().collection, "EntityMint");
    }

    #[test]
    fn shared_handles_compare_by_identity() {
        let schema = bot_schema("EntityShared");
        let a = SharedEntity::new(Entity::new(schema));
        let b = a.clone();
        let c = SharedEntity::new(a.snapshot());

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        b.write().set("age", 4).unwrap();
        assert_eq!(a.read().peek("age"), Some(&Value::Int(4)));
    }
}
