//! Field kinds: one [`FieldKind`] implementation per value type.
//!
//! Kinds validate and convert non-null values. Validation follows a fixed order: the
//! type/shape check and normalisation happen first, then length, range or cardinality
//! checks, then per-element validation. Every failure is a [`MapperError::BadValue`]
//! naming the field, and element failures keep the element's error as their cause.

use std::sync::Arc;

use bson::{Binary, Bson, Document, oid::ObjectId, spec::BinarySubtype};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::{
    error::{MapperError, MapperResult},
    field::{FieldDescriptor, FieldKind, Modifier},
    registry,
    schema::DocumentSchema,
    value::{Reference, Value, bson_to_uuid, uuid_to_bson},
};

fn type_error(field: &str, value: &Value, expected: &str) -> MapperError {
    MapperError::bad_value(
        field,
        value,
        format!("Value is not an instance of {expected} (got: {})", value.type_name()),
    )
}

fn wire_type_error(field: &str, wire: &Bson, expected: &str) -> MapperError {
    MapperError::bad_value(
        field,
        wire,
        format!("Value is not an instance of {expected} (got: {:?})", wire.element_type()),
    )
}

fn check_capacity(
    field: &str,
    items: &[Value],
    min: Option<usize>,
    max: Option<usize>,
) -> MapperResult<()> {
    if min.is_some_and(|min| items.len() < min) {
        return Err(MapperError::bad_value(field, items, "Value has too few elements"));
    }
    if max.is_some_and(|max| items.len() > max) {
        return Err(MapperError::bad_value(field, items, "Value has too many elements"));
    }
    Ok(())
}

/// Unicode strings with optional length bounds and normalisation.
#[derive(Debug, Clone, Default)]
pub struct StringKind {
    min_length: Option<usize>,
    max_length: Option<usize>,
    uppercase: bool,
    lowercase: bool,
    trim: bool,
}

impl StringKind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn uppercase(mut self) -> Self {
        self.uppercase = true;
        self
    }

    pub fn lowercase(mut self) -> Self {
        self.lowercase = true;
        self
    }

    pub fn trim(mut self) -> Self {
        self.trim = true;
        self
    }

    /// Applies the configured trim and case policy.
    pub fn normalize(&self, value: &str) -> String {
        let value = if self.trim { value.trim() } else { value };
        if self.uppercase {
            value.to_uppercase()
        } else if self.lowercase {
            value.to_lowercase()
        } else {
            value.to_string()
        }
    }
}

impl FieldKind for StringKind {
    fn name(&self) -> &'static str {
        "string"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::String(s) => Ok(Value::String(self.normalize(&s))),
            other => Err(type_error(field, &other, "string")),
        }
    }

    fn check(&self, field: &str, value: &Value) -> MapperResult<()> {
        let len = value.as_str().map(|s| s.chars().count()).unwrap_or_default();
        if self.max_length.is_some_and(|max| len > max) {
            return Err(MapperError::bad_value(field, value, format!("Value too long ({len})")));
        }
        if self.min_length.is_some_and(|min| len < min) {
            return Err(MapperError::bad_value(field, value, format!("Value too short ({len})")));
        }
        Ok(())
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value {
            Value::String(s) => Ok(Bson::String(s.clone())),
            other => Err(type_error(field, other, "string")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        match wire {
            Bson::String(s) => {
                let value = Value::String(s);
                self.check(field, &value)?;
                Ok(value)
            }
            other => Err(wire_type_error(field, &other, "string")),
        }
    }
}

/// 64-bit integers with optional bounds.
#[derive(Debug, Clone, Default)]
pub struct IntKind {
    min: Option<i64>,
    max: Option<i64>,
}

impl IntKind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, min: i64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: i64) -> Self {
        self.max = Some(max);
        self
    }
}

impl FieldKind for IntKind {
    fn name(&self) -> &'static str {
        "int"
    }

    fn modifiers(&self) -> &'static [Modifier] {
        Modifier::NUMBER
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::Int(_) => Ok(value),
            other => Err(type_error(field, &other, "int")),
        }
    }

    fn check(&self, field: &str, value: &Value) -> MapperResult<()> {
        let Some(n) = value.as_i64() else {
            return Err(type_error(field, value, "int"));
        };
        if self.min.is_some_and(|min| n < min) {
            return Err(MapperError::bad_value(field, value, "Value too small"));
        }
        if self.max.is_some_and(|max| n > max) {
            return Err(MapperError::bad_value(field, value, "Value too large"));
        }
        Ok(())
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        value
            .as_i64()
            .map(Bson::Int64)
            .ok_or_else(|| type_error(field, value, "int"))
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let value = match wire {
            Bson::Int32(n) => Value::Int(n as i64),
            Bson::Int64(n) => Value::Int(n),
            other => return Err(wire_type_error(field, &other, "int")),
        };
        self.check(field, &value)?;
        Ok(value)
    }
}

/// Double-precision floats. Integers are accepted and widened.
#[derive(Debug, Clone, Default)]
pub struct FloatKind {
    min: Option<f64>,
    max: Option<f64>,
}

impl FloatKind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }
}

impl FieldKind for FloatKind {
    fn name(&self) -> &'static str {
        "float"
    }

    fn modifiers(&self) -> &'static [Modifier] {
        Modifier::NUMBER
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::Float(_) => Ok(value),
            Value::Int(n) => Ok(Value::Float(n as f64)),
            other => Err(type_error(field, &other, "float")),
        }
    }

    fn check(&self, field: &str, value: &Value) -> MapperResult<()> {
        let Some(n) = value.as_f64() else {
            return Err(type_error(field, value, "float"));
        };
        if self.min.is_some_and(|min| n < min) {
            return Err(MapperError::bad_value(field, value, "Value too small"));
        }
        if self.max.is_some_and(|max| n > max) {
            return Err(MapperError::bad_value(field, value, "Value too large"));
        }
        Ok(())
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        value
            .as_f64()
            .map(Bson::Double)
            .ok_or_else(|| type_error(field, value, "float"))
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let value = match wire {
            Bson::Double(n) => Value::Float(n),
            Bson::Int32(n) => Value::Float(n as f64),
            Bson::Int64(n) => Value::Float(n as f64),
            other => return Err(wire_type_error(field, &other, "float")),
        };
        self.check(field, &value)?;
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BoolKind;

impl FieldKind for BoolKind {
    fn name(&self) -> &'static str {
        "bool"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::Bool(_) => Ok(value),
            other => Err(type_error(field, &other, "bool")),
        }
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        value
            .as_bool()
            .map(Bson::Boolean)
            .ok_or_else(|| type_error(field, value, "bool"))
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        match wire {
            Bson::Boolean(b) => Ok(Value::Bool(b)),
            other => Err(wire_type_error(field, &other, "bool")),
        }
    }
}

/// UTC timestamps, truncated to the store's millisecond precision.
#[derive(Debug, Clone, Default)]
pub struct DateTimeKind {
    min: Option<DateTime<Utc>>,
    max: Option<DateTime<Utc>>,
}

impl DateTimeKind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, min: DateTime<Utc>) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: DateTime<Utc>) -> Self {
        self.max = Some(max);
        self
    }
}

impl FieldKind for DateTimeKind {
    fn name(&self) -> &'static str {
        "datetime"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::DateTime(dt) => DateTime::from_timestamp_millis(dt.timestamp_millis())
                .map(Value::DateTime)
                .ok_or_else(|| MapperError::bad_value(field, dt, "DateTime out of range")),
            other => Err(type_error(field, &other, "datetime")),
        }
    }

    fn check(&self, field: &str, value: &Value) -> MapperResult<()> {
        let Value::DateTime(dt) = value else {
            return Err(type_error(field, value, "datetime"));
        };
        if self.min.is_some_and(|min| *dt < min) {
            return Err(MapperError::bad_value(field, value, "DateTime too old"));
        }
        if self.max.is_some_and(|max| *dt > max) {
            return Err(MapperError::bad_value(field, value, "DateTime too new"));
        }
        Ok(())
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value {
            Value::DateTime(dt) => Ok(Bson::DateTime(bson::DateTime::from_chrono(*dt))),
            other => Err(type_error(field, other, "datetime")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        match wire {
            Bson::DateTime(dt) => {
                let value = Value::DateTime(dt.to_chrono());
                self.check(field, &value)?;
                Ok(value)
            }
            other => Err(wire_type_error(field, &other, "datetime")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryKind;

impl FieldKind for BinaryKind {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::Binary(_) => Ok(value),
            other => Err(type_error(field, &other, "binary")),
        }
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value {
            Value::Binary(bytes) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: bytes.clone(),
            })),
            other => Err(type_error(field, other, "binary")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        match wire {
            Bson::Binary(binary) => Ok(Value::Binary(binary.bytes)),
            other => Err(wire_type_error(field, &other, "binary")),
        }
    }
}

/// Store object ids. 24-character hex strings are accepted on write.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectIdKind;

impl FieldKind for ObjectIdKind {
    fn name(&self) -> &'static str {
        "objectid"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::ObjectId(_) => Ok(value),
            Value::Raw(Bson::ObjectId(oid)) => Ok(Value::ObjectId(oid)),
            Value::String(s) if s.len() == 24 => ObjectId::parse_str(&s)
                .map(Value::ObjectId)
                .map_err(|e| MapperError::bad_value(field, &s, format!("Invalid object id: {e}"))),
            other => Err(type_error(field, &other, "objectid")),
        }
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value {
            Value::ObjectId(oid) => Ok(Bson::ObjectId(*oid)),
            other => Err(type_error(field, other, "objectid")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        match wire {
            Bson::ObjectId(oid) => Ok(Value::ObjectId(oid)),
            other => Err(wire_type_error(field, &other, "objectid")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidKind;

impl FieldKind for UuidKind {
    fn name(&self) -> &'static str {
        "uuid"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::Uuid(_) => Ok(value),
            Value::String(s) => uuid::Uuid::parse_str(&s)
                .map(Value::Uuid)
                .map_err(|e| MapperError::bad_value(field, &s, format!("Invalid uuid: {e}"))),
            other => Err(type_error(field, &other, "uuid")),
        }
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value {
            Value::Uuid(uuid) => Ok(uuid_to_bson(uuid)),
            other => Err(type_error(field, other, "uuid")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        match &wire {
            Bson::Binary(binary) => bson_to_uuid(binary)
                .map(Value::Uuid)
                .ok_or_else(|| wire_type_error(field, &wire, "uuid")),
            Bson::String(s) => uuid::Uuid::parse_str(s)
                .map(Value::Uuid)
                .map_err(|e| MapperError::bad_value(field, &wire, format!("Invalid uuid: {e}"))),
            _ => Err(wire_type_error(field, &wire, "uuid")),
        }
    }
}

/// One value out of a fixed list, all of the item kind.
#[derive(Debug, Clone)]
pub struct EnumKind {
    item: FieldDescriptor,
    values: Vec<Value>,
}

impl EnumKind {
    pub fn new(item: FieldDescriptor, values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            item,
            values: values.into_iter().collect(),
        }
    }

    fn check_member(&self, field: &str, value: &Value) -> MapperResult<()> {
        if self.values.contains(value) {
            Ok(())
        } else {
            Err(MapperError::bad_value(field, value, "Value was not in the enum values"))
        }
    }
}

impl FieldKind for EnumKind {
    fn name(&self) -> &'static str {
        "enum"
    }

    fn coerce(&self, _field: &str, value: Value) -> MapperResult<Value> {
        self.item.validate_wrap(value)
    }

    fn check(&self, field: &str, value: &Value) -> MapperResult<()> {
        self.check_member(field, value)
    }

    fn to_wire(&self, _field: &str, value: &Value) -> MapperResult<Bson> {
        self.item.wrap(value)
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let value = self.item.unwrap(wire)?;
        self.check_member(field, &value)?;
        Ok(value)
    }
}

/// Fixed-size heterogeneous sequence, stored as an array.
#[derive(Debug, Clone)]
pub struct TupleKind {
    items: Vec<FieldDescriptor>,
}

impl TupleKind {
    pub fn new(items: impl IntoIterator<Item = FieldDescriptor>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

impl FieldKind for TupleKind {
    fn name(&self) -> &'static str {
        "tuple"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        let items = match value {
            Value::Tuple(items) | Value::List(items) => items,
            other => return Err(type_error(field, &other, "tuple")),
        };
        if items.len() != self.items.len() {
            return Err(MapperError::bad_value(
                field,
                &items,
                format!("Expected {} elements, got {}", self.items.len(), items.len()),
            ));
        }
        self.items
            .iter()
            .zip(items)
            .map(|(item, value)| item.validate_wrap(value))
            .collect::<MapperResult<Vec<_>>>()
            .map(Value::Tuple)
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        let Some(values) = value.as_slice() else {
            return Err(type_error(field, value, "tuple"));
        };
        self.items
            .iter()
            .zip(values)
            .map(|(item, value)| item.wrap(value))
            .collect::<MapperResult<Vec<_>>>()
            .map(Bson::Array)
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let Bson::Array(values) = wire else {
            return Err(wire_type_error(field, &wire, "array"));
        };
        if values.len() != self.items.len() {
            return Err(MapperError::bad_value(
                field,
                &values,
                format!("Expected {} elements, got {}", self.items.len(), values.len()),
            ));
        }
        self.items
            .iter()
            .zip(values)
            .map(|(item, wire)| item.unwrap(wire))
            .collect::<MapperResult<Vec<_>>>()
            .map(Value::Tuple)
    }
}

/// Free-form values, passed through without validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyKind;

impl FieldKind for AnyKind {
    fn name(&self) -> &'static str {
        "any"
    }

    fn modifiers(&self) -> &'static [Modifier] {
        Modifier::ANY
    }

    fn coerce(&self, _field: &str, value: Value) -> MapperResult<Value> {
        Ok(value)
    }

    fn to_wire(&self, _field: &str, value: &Value) -> MapperResult<Bson> {
        value.to_bson()
    }

    fn from_wire(&self, _field: &str, wire: Bson) -> MapperResult<Value> {
        Ok(Value::from_bson(wire))
    }

    fn subfield(&self, segment: &str) -> Option<FieldDescriptor> {
        Some(FieldDescriptor::anything(segment).optional())
    }
}

/// An embedded document of a given schema (or one of its registered subtypes).
#[derive(Debug, Clone)]
pub struct DocumentKind {
    schema: Arc<DocumentSchema>,
}

impl DocumentKind {
    pub fn new(schema: Arc<DocumentSchema>) -> Self {
        Self { schema }
    }
}

impl FieldKind for DocumentKind {
    fn name(&self) -> &'static str {
        "document"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        match value {
            Value::Document(entity) if entity.schema().is_a(&self.schema) => Ok(Value::Document(entity)),
            other => Err(type_error(field, &other, self.schema.type_name())),
        }
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value {
            Value::Document(entity) => Ok(Bson::Document(entity.wrap()?)),
            other => Err(type_error(field, other, self.schema.type_name())),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        match wire {
            Bson::Document(doc) => self
                .schema
                .unwrap(doc, None)
                .map(|entity| Value::Document(Box::new(entity)))
                .map_err(|e| {
                    MapperError::bad_value(field, self.schema.type_name(), "Bad embedded document")
                        .with_cause(e)
                }),
            other => Err(wire_type_error(field, &other, "document")),
        }
    }

    fn schema(&self) -> Option<&Arc<DocumentSchema>> {
        Some(&self.schema)
    }

    fn subfield(&self, segment: &str) -> Option<FieldDescriptor> {
        self.schema.field(segment).cloned()
    }

    fn nested_dirty_ops(&self, value: &Value) -> MapperResult<Document> {
        match value {
            Value::Document(entity) => entity.get_dirty_ops(false),
            _ => Ok(Document::new()),
        }
    }
}

/// Reference to a document of another registered type.
///
/// Full references are stored as `{"$ref": collection, "$id": id}`; simple references store
/// only the identity and take the collection from the target type.
#[derive(Debug, Clone)]
pub struct ReferenceKind {
    target: Option<String>,
    simple: bool,
}

impl ReferenceKind {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            simple: false,
        }
    }

    /// A reference to any collection.
    pub fn untyped() -> Self {
        Self {
            target: None,
            simple: false,
        }
    }

    /// Stores the bare identity instead of a `$ref` document.
    pub fn simple(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            simple: true,
        }
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn target_collection(&self, field: &str) -> MapperResult<Option<String>> {
        match &self.target {
            Some(target) => registry::lookup(target)
                .map(|schema| Some(schema.collection().to_string()))
                .ok_or_else(|| {
                    MapperError::bad_value(field, target, "Reference target type is not registered")
                        .with_cause(MapperError::UnknownType(target.clone()))
                }),
            None => Ok(None),
        }
    }

    fn check_collection(&self, field: &str, reference: &Reference) -> MapperResult<()> {
        if let Some(expected) = self.target_collection(field)?
            && expected != reference.collection
        {
            return Err(MapperError::bad_value(
                field,
                reference,
                format!(
                    "Wrong collection for reference: got \"{}\" instead of \"{}\"",
                    reference.collection, expected
                ),
            ));
        }
        Ok(())
    }
}

impl FieldKind for ReferenceKind {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        let reference = match value {
            Value::Reference(reference) => reference,
            Value::Document(entity) => entity.to_ref()?,
            other => return Err(type_error(field, &other, "reference")),
        };
        self.check_collection(field, &reference)?;
        Ok(Value::Reference(reference))
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value {
            Value::Reference(reference) if self.simple => Ok(reference.id.clone()),
            Value::Reference(reference) => Ok(reference.to_bson()),
            other => Err(type_error(field, other, "reference")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let reference = if self.simple {
            let collection = self.target_collection(field)?.unwrap_or_default();
            Reference::new(collection, wire)
        } else {
            match &wire {
                Bson::Document(doc) => Reference::from_document(doc)
                    .ok_or_else(|| wire_type_error(field, &wire, "reference"))?,
                _ => return Err(wire_type_error(field, &wire, "reference")),
            }
        };
        self.check_collection(field, &reference)?;
        Ok(Value::Reference(reference))
    }
}

fn coerce_items(
    field: &str,
    item: &FieldDescriptor,
    items: Vec<Value>,
) -> MapperResult<Vec<Value>> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let shown = format!("{value:?}");
            item.validate_wrap(value).map_err(|e| {
                MapperError::bad_value(field, shown, format!("Bad value at index {index}")).with_cause(e)
            })
        })
        .collect()
}

fn wrap_items(item: &FieldDescriptor, items: &[Value]) -> MapperResult<Bson> {
    items
        .iter()
        .map(|value| item.wrap(value))
        .collect::<MapperResult<Vec<_>>>()
        .map(Bson::Array)
}

fn unwrap_items(field: &str, item: &FieldDescriptor, wire: Bson) -> MapperResult<Vec<Value>> {
    let Bson::Array(values) = wire else {
        return Err(wire_type_error(field, &wire, "array"));
    };
    values.into_iter().map(|value| item.unwrap(value)).collect()
}

fn dedup(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

/// Ordered sequence of items of one kind.
#[derive(Debug, Clone)]
pub struct ListKind {
    item: FieldDescriptor,
    min_capacity: Option<usize>,
    max_capacity: Option<usize>,
}

impl ListKind {
    pub fn new(item: FieldDescriptor) -> Self {
        Self {
            item,
            min_capacity: None,
            max_capacity: None,
        }
    }

    pub fn min_capacity(mut self, min: usize) -> Self {
        self.min_capacity = Some(min);
        self
    }

    pub fn max_capacity(mut self, max: usize) -> Self {
        self.max_capacity = Some(max);
        self
    }
}

impl FieldKind for ListKind {
    fn name(&self) -> &'static str {
        "list"
    }

    fn modifiers(&self) -> &'static [Modifier] {
        Modifier::LIST
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        let items = match value {
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => items,
            other => return Err(type_error(field, &other, "list")),
        };
        check_capacity(field, &items, self.min_capacity, self.max_capacity)?;
        coerce_items(field, &self.item, items).map(Value::List)
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value.as_slice() {
            Some(items) => wrap_items(&self.item, items),
            None => Err(type_error(field, value, "list")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let items = unwrap_items(field, &self.item, wire)?;
        check_capacity(field, &items, self.min_capacity, self.max_capacity)?;
        Ok(Value::List(items))
    }

    fn item(&self) -> Option<&FieldDescriptor> {
        Some(&self.item)
    }

    fn is_sequence(&self) -> bool {
        true
    }

    fn schema(&self) -> Option<&Arc<DocumentSchema>> {
        self.item.kind().schema()
    }

    fn subfield(&self, segment: &str) -> Option<FieldDescriptor> {
        self.item.kind().subfield(segment)
    }
}

/// Unordered collection without duplicates, stored as an array.
#[derive(Debug, Clone)]
pub struct SetKind {
    item: FieldDescriptor,
    min_capacity: Option<usize>,
    max_capacity: Option<usize>,
}

impl SetKind {
    pub fn new(item: FieldDescriptor) -> Self {
        Self {
            item,
            min_capacity: None,
            max_capacity: None,
        }
    }

    pub fn min_capacity(mut self, min: usize) -> Self {
        self.min_capacity = Some(min);
        self
    }

    pub fn max_capacity(mut self, max: usize) -> Self {
        self.max_capacity = Some(max);
        self
    }
}

impl FieldKind for SetKind {
    fn name(&self) -> &'static str {
        "set"
    }

    fn modifiers(&self) -> &'static [Modifier] {
        Modifier::LIST
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        let items = match value {
            Value::Set(items) | Value::List(items) => dedup(items),
            other => return Err(type_error(field, &other, "set")),
        };
        check_capacity(field, &items, self.min_capacity, self.max_capacity)?;
        coerce_items(field, &self.item, items).map(|items| Value::Set(dedup(items)))
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        match value.as_slice() {
            Some(items) => wrap_items(&self.item, items),
            None => Err(type_error(field, value, "set")),
        }
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let items = dedup(unwrap_items(field, &self.item, wire)?);
        check_capacity(field, &items, self.min_capacity, self.max_capacity)?;
        Ok(Value::Set(items))
    }

    fn item(&self) -> Option<&FieldDescriptor> {
        Some(&self.item)
    }

    fn is_sequence(&self) -> bool {
        true
    }

    fn schema(&self) -> Option<&Arc<DocumentSchema>> {
        self.item.kind().schema()
    }

    fn subfield(&self, segment: &str) -> Option<FieldDescriptor> {
        self.item.kind().subfield(segment)
    }
}

fn check_key(field: &str, key: &str) -> MapperResult<()> {
    if key.contains('.') || key.contains('$') {
        return Err(MapperError::bad_value(
            field,
            key,
            "Dict keys cannot contain \".\" or \"$\". You may want a key/value field instead",
        ));
    }
    Ok(())
}

/// String-keyed mapping stored as an embedded document.
#[derive(Debug, Clone)]
pub struct DictKind {
    value: FieldDescriptor,
}

impl DictKind {
    pub fn new(value: FieldDescriptor) -> Self {
        Self { value }
    }
}

impl FieldKind for DictKind {
    fn name(&self) -> &'static str {
        "dict"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        let Value::Map(map) = value else {
            return Err(type_error(field, &value, "dict"));
        };
        let mut out = IndexMap::with_capacity(map.len());
        for (key, value) in map {
            check_key(field, &key)?;
            let value = self.value.validate_wrap(value).map_err(|e| {
                MapperError::bad_value(field, &key, format!("Bad value for key {key}")).with_cause(e)
            })?;
            out.insert(key, value);
        }
        Ok(Value::Map(out))
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        let Value::Map(map) = value else {
            return Err(type_error(field, value, "dict"));
        };
        let mut doc = Document::new();
        for (key, value) in map {
            doc.insert(key.clone(), self.value.wrap(value)?);
        }
        Ok(Bson::Document(doc))
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let Bson::Document(doc) = wire else {
            return Err(wire_type_error(field, &wire, "document"));
        };
        let mut out = IndexMap::with_capacity(doc.len());
        for (key, wire) in doc {
            check_key(field, &key)?;
            let value = self.value.unwrap(wire).map_err(|e| {
                MapperError::bad_value(field, &key, format!("Bad value for key {key}")).with_cause(e)
            })?;
            out.insert(key, value);
        }
        Ok(Value::Map(out))
    }

    fn subfield(&self, segment: &str) -> Option<FieldDescriptor> {
        Some(self.value.clone().renamed(segment).optional())
    }
}

/// Mapping with arbitrary keys, stored as `[{k: key, v: value}, ...]`.
///
/// Queries address keys and values through the `k` and `v` sub-paths.
#[derive(Debug, Clone)]
pub struct KeyValueKind {
    key: FieldDescriptor,
    value: FieldDescriptor,
}

impl KeyValueKind {
    pub fn new(key: FieldDescriptor, value: FieldDescriptor) -> Self {
        Self {
            key: key.renamed("k"),
            value: value.renamed("v"),
        }
    }
}

impl FieldKind for KeyValueKind {
    fn name(&self) -> &'static str {
        "key-value"
    }

    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value> {
        let pairs = match value {
            Value::KeyValue(pairs) => pairs,
            Value::Map(map) => map.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
            other => return Err(type_error(field, &other, "key-value mapping")),
        };
        let mut out: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let shown = format!("{key:?}");
            let key = self
                .key
                .validate_wrap(key)
                .map_err(|e| MapperError::bad_value(field, &shown, "Bad value for key").with_cause(e))?;
            let value = self.value.validate_wrap(value).map_err(|e| {
                MapperError::bad_value(field, &shown, format!("Bad value for key {shown}")).with_cause(e)
            })?;
            match out.iter_mut().find(|pair| pair.0 == key) {
                Some(existing) => existing.1 = value,
                None => out.push((key, value)),
            }
        }
        Ok(Value::KeyValue(out))
    }

    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson> {
        let Value::KeyValue(pairs) = value else {
            return Err(type_error(field, value, "key-value mapping"));
        };
        pairs
            .iter()
            .map(|(k, v)| {
                let mut doc = Document::new();
                doc.insert("k", self.key.wrap(k)?);
                doc.insert("v", self.value.wrap(v)?);
                Ok(Bson::Document(doc))
            })
            .collect::<MapperResult<Vec<_>>>()
            .map(Bson::Array)
    }

    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value> {
        let Bson::Array(entries) = wire else {
            return Err(wire_type_error(field, &wire, "array"));
        };
        let mut pairs = Vec::with_capacity(entries.len());
        for entry in entries {
            let Bson::Document(mut entry) = entry else {
                return Err(MapperError::bad_value(field, &entry, "Values in a key/value list must be documents"));
            };
            let key = match entry.remove("k") {
                None | Some(Bson::Null) => {
                    return Err(MapperError::bad_value(field, &entry, "Value had None for a key"));
                }
                Some(key) => key,
            };
            let shown = key.to_string();
            let key = self.key.unwrap(key).map_err(|e| {
                MapperError::bad_value(field, &shown, format!("Bad value for key {shown}")).with_cause(e)
            })?;
            let value = self
                .value
                .unwrap(entry.remove("v").unwrap_or(Bson::Null))
                .map_err(|e| {
                    MapperError::bad_value(field, &shown, format!("Bad value for key {shown}")).with_cause(e)
                })?;
            pairs.push((key, value));
        }
        Ok(Value::KeyValue(pairs))
    }

    fn subfield(&self, segment: &str) -> Option<FieldDescriptor> {
        match segment {
            "k" => Some(self.key.clone()),
            "v" => Some(self.value.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings() -> FieldDescriptor {
        FieldDescriptor::string("item")
    }

    #[test]
    fn string_length_is_checked_after_normalisation() {
        let field = FieldDescriptor::new("name", StringKind::new().max_length(3).trim());

        assert_eq!(field.wrap(&Value::from("  abc  ")).unwrap(), Bson::String("abc".into()));
        assert!(matches!(
            field.wrap(&Value::from("abcd")),
            Err(MapperError::BadValue { reason, .. }) if reason == "Value too long (4)"
        ));
    }

    #[test]
    fn ints_accept_both_wire_widths() {
        let field = FieldDescriptor::int("n");
        assert_eq!(field.unwrap(Bson::Int32(4)).unwrap(), Value::Int(4));
        assert_eq!(field.unwrap(Bson::Int64(4)).unwrap(), Value::Int(4));
        assert!(field.unwrap(Bson::String("4".into())).is_err());
    }

    #[test]
    fn floats_widen_integers() {
        let field = FieldDescriptor::float("f");
        assert_eq!(field.wrap(&Value::Int(2)).unwrap(), Bson::Double(2.0));
    }

    #[test]
    fn datetimes_are_truncated_to_millis() {
        let field = FieldDescriptor::datetime("at");
        let now = Utc::now();
        let wire = field.wrap(&Value::DateTime(now)).unwrap();
        let back = field.unwrap(wire).unwrap();

        let Value::DateTime(back) = back else {
            panic!("expected datetime");
        };
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn object_ids_accept_hex_strings() {
        let field = FieldDescriptor::object_id("id");
        let oid = ObjectId::new();

        assert_eq!(field.wrap(&Value::String(oid.to_hex())).unwrap(), Bson::ObjectId(oid));
        assert!(field.wrap(&Value::from("nope")).is_err());
    }

    #[test]
    fn enum_rejects_unknown_members() {
        let field = FieldDescriptor::enumeration("n", FieldDescriptor::int("n"), [Value::Int(4), Value::Int(6)]);

        assert!(field.wrap(&Value::Int(4)).is_ok());
        assert!(field.wrap(&Value::Int(5)).is_err());
        assert!(field.unwrap(Bson::Int64(5)).is_err());
    }

    #[test]
    fn tuples_have_fixed_size() {
        let field = FieldDescriptor::tuple("t", [FieldDescriptor::int("a"), FieldDescriptor::boolean("b")]);

        assert_eq!(
            field.wrap(&Value::Tuple(vec![Value::Int(19), Value::Bool(false)])).unwrap(),
            Bson::Array(vec![Bson::Int64(19), Bson::Boolean(false)])
        );
        assert!(field.wrap(&Value::Tuple(vec![Value::Int(19)])).is_err());
    }

    #[test]
    fn list_capacity_is_checked_before_elements() {
        let field = FieldDescriptor::new("l", ListKind::new(FieldDescriptor::int("i")).max_capacity(1));

        match field.wrap(&Value::from(vec![Value::from("x"), Value::from("y")])) {
            Err(MapperError::BadValue { reason, .. }) => assert_eq!(reason, "Value has too many elements"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn list_element_errors_keep_their_cause() {
        let field = FieldDescriptor::list("l", FieldDescriptor::int("i"));

        match field.wrap(&Value::from(vec![Value::Int(1), Value::from("x")])) {
            Err(MapperError::BadValue { reason, cause: Some(_), .. }) => assert_eq!(reason, "Bad value at index 1"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn sets_drop_duplicates() {
        let field = FieldDescriptor::set("s", strings());
        let wire = field.wrap(&Value::Set(vec!["a".into(), "b".into(), "a".into()])).unwrap();

        assert_eq!(wire, Bson::Array(vec![Bson::String("a".into()), Bson::String("b".into())]));
    }

    #[test]
    fn dict_keys_may_not_contain_dots_or_dollars() {
        let field = FieldDescriptor::dict("d", FieldDescriptor::int("v"));
        let mut map = IndexMap::new();
        map.insert("a.b".to_string(), Value::Int(1));

        match field.wrap(&Value::Map(map)) {
            Err(MapperError::BadValue { reason, .. }) => assert!(reason.contains("key/value")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn dict_value_errors_name_the_key() {
        let field = FieldDescriptor::dict("d", FieldDescriptor::new("v", IntKind::new().max(2)));
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Int(3));

        match field.wrap(&Value::Map(map)) {
            Err(MapperError::BadValue { reason, cause: Some(_), .. }) => assert_eq!(reason, "Bad value for key a"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn key_value_pairs_use_k_and_v() {
        let field = FieldDescriptor::key_value("kv", FieldDescriptor::int("key"), strings());
        let value = Value::KeyValue(vec![(Value::Int(1), Value::from("one"))]);
        let wire = field.wrap(&value).unwrap();

        assert_eq!(wire, Bson::Array(vec![Bson::Document(bson::doc! { "k": 1_i64, "v": "one" })]));
        assert_eq!(field.unwrap(wire).unwrap(), value);
        assert_eq!(field.kind().subfield("k").map(|f| f.wire_name().to_string()), Some("k".into()));
    }

    #[test]
    fn key_value_rejects_missing_keys() {
        let field = FieldDescriptor::key_value("kv", FieldDescriptor::int("key"), strings());
        let wire = Bson::Array(vec![Bson::Document(bson::doc! { "v": "one" })]);

        assert!(matches!(field.unwrap(wire), Err(MapperError::BadValue { reason, .. }) if reason == "Value had None for a key"));
    }

    #[test]
    fn untyped_references_round_trip() {
        let field = FieldDescriptor::new("r", ReferenceKind::untyped());
        let reference = Reference::new("things", ObjectId::new());
        let wire = field.wrap(&Value::Reference(reference.clone())).unwrap();

        assert_eq!(field.unwrap(wire).unwrap(), Value::Reference(reference));
    }
}
