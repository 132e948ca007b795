//! Native values and per-field mutation state.
//!
//! [`Value`] is the in-memory representation of a field value. Field kinds convert between
//! a [`Value`] and its wire form ([`Bson`]). [`ValueSlot`] tracks the state of one field on
//! one entity: whether it holds a value, whether that value is dirty, which update operator
//! is pending and whether the field was part of the retrieved projection.

use bson::{Binary, Bson, Document, oid::ObjectId, spec::BinarySubtype};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::{
    entity::Entity,
    error::{MapperError, MapperResult},
    field::Modifier,
};

/// A native field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Binary(Vec<u8>),
    ObjectId(ObjectId),
    Uuid(uuid::Uuid),
    List(Vec<Value>),
    /// Ordered collection without duplicates.
    Set(Vec<Value>),
    /// String-keyed mapping, stored as an embedded document.
    Map(IndexMap<String, Value>),
    /// Mapping with arbitrary keys, stored as a list of `{k, v}` documents.
    KeyValue(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
    Document(Box<Entity>),
    Reference(Reference),
    /// Free-form wire value passed through untouched.
    Raw(Bson),
}

impl Value {
    /// Short name of the variant, used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Binary(_) => "binary",
            Value::ObjectId(_) => "objectid",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::KeyValue(_) => "key-value",
            Value::Tuple(_) => "tuple",
            Value::Document(_) => "document",
            Value::Reference(_) => "reference",
            Value::Raw(_) => "raw",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Raw(Bson::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Document(entity) => Some(&**entity),
            _ => None,
        }
    }

    pub fn as_entity_mut(&mut self) -> Option<&mut Entity> {
        match self {
            Value::Document(entity) => Some(&mut **entity),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    /// Elements of a list, set or tuple.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Schema-less conversion to the wire form, used for free-form fields and extra fields.
    pub fn to_bson(&self) -> MapperResult<Bson> {
        Ok(match self {
            Value::Null => Bson::Null,
            Value::Bool(value) => Bson::Boolean(*value),
            Value::Int(value) => Bson::Int64(*value),
            Value::Float(value) => Bson::Double(*value),
            Value::String(value) => Bson::String(value.clone()),
            Value::DateTime(value) => Bson::DateTime(bson::DateTime::from_chrono(*value)),
            Value::Binary(bytes) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: bytes.clone(),
            }),
            Value::ObjectId(oid) => Bson::ObjectId(*oid),
            Value::Uuid(uuid) => uuid_to_bson(uuid),
            Value::List(items) | Value::Set(items) | Value::Tuple(items) => Bson::Array(
                items
                    .iter()
                    .map(Value::to_bson)
                    .collect::<MapperResult<Vec<_>>>()?,
            ),
            Value::Map(map) => {
                let mut doc = Document::new();
                for (key, value) in map {
                    doc.insert(key.clone(), value.to_bson()?);
                }
                Bson::Document(doc)
            }
            Value::KeyValue(pairs) => Bson::Array(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        let mut doc = Document::new();
                        doc.insert("k", k.to_bson()?);
                        doc.insert("v", v.to_bson()?);
                        Ok(Bson::Document(doc))
                    })
                    .collect::<MapperResult<Vec<_>>>()?,
            ),
            Value::Document(entity) => Bson::Document(entity.wrap()?),
            Value::Reference(reference) => reference.to_bson(),
            Value::Raw(raw) => raw.clone(),
        })
    }

    /// Schema-less conversion from the wire form. Scalars map onto their native variants,
    /// arrays become lists and embedded documents become maps.
    pub fn from_bson(wire: Bson) -> Value {
        match wire {
            Bson::Null | Bson::Undefined => Value::Null,
            Bson::Boolean(value) => Value::Bool(value),
            Bson::Int32(value) => Value::Int(value as i64),
            Bson::Int64(value) => Value::Int(value),
            Bson::Double(value) => Value::Float(value),
            Bson::String(value) => Value::String(value),
            Bson::DateTime(value) => Value::DateTime(value.to_chrono()),
            Bson::ObjectId(oid) => Value::ObjectId(oid),
            Bson::Binary(binary) => match bson_to_uuid(&binary) {
                Some(uuid) => Value::Uuid(uuid),
                None => Value::Binary(binary.bytes),
            },
            Bson::Array(items) => Value::List(items.into_iter().map(Value::from_bson).collect()),
            Bson::Document(doc) => match Reference::from_document(&doc) {
                Some(reference) => Value::Reference(reference),
                None => Value::Map(
                    doc.into_iter()
                        .map(|(k, v)| (k, Value::from_bson(v)))
                        .collect(),
                ),
            },
            other => Value::Raw(other),
        }
    }
}

pub(crate) fn uuid_to_bson(uuid: &uuid::Uuid) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Uuid,
        bytes: uuid.as_bytes().to_vec(),
    })
}

pub(crate) fn bson_to_uuid(binary: &Binary) -> Option<uuid::Uuid> {
    match binary.subtype {
        BinarySubtype::Uuid | BinarySubtype::UuidOld => uuid::Uuid::from_slice(&binary.bytes).ok(),
        _ => None,
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

impl From<ObjectId> for Value {
    fn from(value: ObjectId) -> Self {
        Value::ObjectId(value)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(value: uuid::Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<Entity> for Value {
    fn from(value: Entity) -> Self {
        Value::Document(Box::new(value))
    }
}

impl From<Reference> for Value {
    fn from(value: Reference) -> Self {
        Value::Reference(value)
    }
}

impl From<Bson> for Value {
    fn from(value: Bson) -> Self {
        Value::Raw(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<V: Into<Value>> From<IndexMap<String, V>> for Value {
    fn from(map: IndexMap<String, V>) -> Self {
        Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// Pointer to a document in another collection.
///
/// On the wire a reference is either a `{"$ref": collection, "$id": id}` document or,
/// for simple references, the bare identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub collection: String,
    pub id: Bson,
}

impl Reference {
    pub fn new(collection: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn to_bson(&self) -> Bson {
        let mut doc = Document::new();
        doc.insert("$ref", self.collection.clone());
        doc.insert("$id", self.id.clone());
        Bson::Document(doc)
    }

    pub fn from_document(doc: &Document) -> Option<Self> {
        let collection = doc.get_str("$ref").ok()?;
        let id = doc.get("$id")?;
        Some(Self::new(collection, id.clone()))
    }
}

/// Mutation state of one field on one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSlot {
    value: Option<Value>,
    dirty: bool,
    from_store: bool,
    retrieved: bool,
    update_op: Option<Modifier>,
}

impl Default for ValueSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueSlot {
    pub fn new() -> Self {
        Self {
            value: None,
            dirty: false,
            from_store: false,
            retrieved: true,
            update_op: None,
        }
    }

    /// A slot for a field that was left out of a partial projection.
    pub fn unretrieved() -> Self {
        Self {
            retrieved: false,
            ..Self::new()
        }
    }

    /// Records an external write. `op` is the pending operator, `None` when the field's
    /// on-update policy is `ignore`.
    pub fn write(&mut self, value: Value, op: Option<Modifier>) {
        self.value = Some(value);
        self.dirty = true;
        self.from_store = false;
        self.retrieved = true;
        if op.is_some() {
            self.update_op = op;
        }
    }

    /// Stores a value read from the store without marking the slot dirty.
    pub fn load(&mut self, value: Value) {
        self.value = Some(value);
        self.from_store = true;
        self.retrieved = true;
        self.dirty = false;
        self.update_op = None;
    }

    pub fn delete(&mut self) {
        self.value = None;
        self.dirty = true;
        self.from_store = false;
        self.update_op = Some(Modifier::Unset);
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
        self.update_op = None;
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub(crate) fn value_mut(&mut self) -> Option<&mut Value> {
        self.value.as_mut()
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_from_store(&self) -> bool {
        self.from_store
    }

    pub fn is_retrieved(&self) -> bool {
        self.retrieved
    }

    pub fn update_op(&self) -> Option<Modifier> {
        self.update_op
    }

    /// Message used when an unset slot is read.
    pub(crate) fn missing(&self, field: &str) -> MapperError {
        if self.retrieved {
            MapperError::FieldNotSet(field.to_string())
        } else {
            MapperError::FieldNotRetrieved(field.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_marks_slot_dirty_and_keeps_operator() {
        let mut slot = ValueSlot::new();
        slot.write(Value::Int(3), Some(Modifier::Set));

        assert!(slot.is_set());
        assert!(slot.is_dirty());
        assert_eq!(slot.update_op(), Some(Modifier::Set));

        slot.clear_dirty();
        assert!(!slot.is_dirty());
        assert_eq!(slot.update_op(), None);
        assert_eq!(slot.value(), Some(&Value::Int(3)));
    }

    #[test]
    fn delete_schedules_unset() {
        let mut slot = ValueSlot::new();
        slot.load(Value::from("x"));
        slot.delete();

        assert!(!slot.is_set());
        assert!(slot.is_dirty());
        assert_eq!(slot.update_op(), Some(Modifier::Unset));
    }

    #[test]
    fn unretrieved_slot_reports_not_retrieved() {
        let slot = ValueSlot::unretrieved();
        assert!(matches!(slot.missing("name"), MapperError::FieldNotRetrieved(name) if name == "name"));
        assert!(matches!(ValueSlot::new().missing("name"), MapperError::FieldNotSet(_)));
    }

    #[test]
    fn schema_less_conversion_keeps_references() {
        let oid = ObjectId::new();
        let reference = Reference::new("users", oid);
        let wire = Value::Reference(reference.clone()).to_bson().unwrap();

        assert_eq!(Value::from_bson(wire), Value::Reference(reference));
    }

    #[test]
    fn uuids_round_trip_through_binary() {
        let uuid = uuid::Uuid::new_v4();
        let wire = Value::Uuid(uuid).to_bson().unwrap();

        assert!(matches!(&wire, Bson::Binary(binary) if binary.subtype == BinarySubtype::Uuid));
        assert_eq!(Value::from_bson(wire), Value::Uuid(uuid));
    }
}
