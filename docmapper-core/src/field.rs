//! Field descriptors: typed, validating accessors bound to a schema attribute.
//!
//! A [`FieldDescriptor`] carries the attribute-level configuration shared by every field
//! (wire name, required flag, defaults, null policy, on-update operator, user validators,
//! identity role) and delegates everything type specific to a [`FieldKind`] strategy. The
//! null policy is checked by the descriptor before the kind ever sees a value, so kinds only
//! deal with non-null input.
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::field::FieldDescriptor;
//! use docmapper_core::kind::{IntKind, StringKind};
//!
//! let name = FieldDescriptor::new("name", StringKind::new().max_length(255).uppercase().trim());
//! let age = FieldDescriptor::new("age", IntKind::new().max(100));
//! ```

use std::{fmt, sync::Arc};

use bson::{Bson, Document, doc};

use crate::{
    error::{MapperError, MapperResult},
    kind::{
        AnyKind, BinaryKind, BoolKind, DateTimeKind, DictKind, DocumentKind, EnumKind,
        FloatKind, IntKind, KeyValueKind, ListKind, ObjectIdKind, ReferenceKind, SetKind,
        StringKind, TupleKind, UuidKind,
    },
    schema::DocumentSchema,
    value::{Value, ValueSlot},
};

/// Wire key of the store's reserved identity field.
pub const ID_KEY: &str = "_id";

/// Atomic update operators understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modifier {
    Set,
    Unset,
    Inc,
    Push,
    AddToSet,
    Pull,
    PushAll,
    PullAll,
    Pop,
}

impl Modifier {
    pub const SCALAR: &'static [Modifier] = &[Modifier::Set, Modifier::Unset];
    pub const NUMBER: &'static [Modifier] = &[Modifier::Set, Modifier::Unset, Modifier::Inc];
    pub const LIST: &'static [Modifier] = &[
        Modifier::Set,
        Modifier::Unset,
        Modifier::Push,
        Modifier::AddToSet,
        Modifier::Pull,
        Modifier::PushAll,
        Modifier::PullAll,
        Modifier::Pop,
    ];
    pub const ANY: &'static [Modifier] = &[
        Modifier::Set,
        Modifier::Unset,
        Modifier::Inc,
        Modifier::Push,
        Modifier::AddToSet,
        Modifier::Pull,
        Modifier::PushAll,
        Modifier::PullAll,
        Modifier::Pop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Set => "$set",
            Modifier::Unset => "$unset",
            Modifier::Inc => "$inc",
            Modifier::Push => "$push",
            Modifier::AddToSet => "$addToSet",
            Modifier::Pull => "$pull",
            Modifier::PushAll => "$pushAll",
            Modifier::PullAll => "$pullAll",
            Modifier::Pop => "$pop",
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        Self::ANY.iter().copied().find(|m| m.as_str() == op)
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator emitted for a field when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnUpdate {
    Modifier(Modifier),
    /// Writes are tracked but never produce a dirty-op.
    Ignore,
}

impl OnUpdate {
    pub fn modifier(&self) -> Option<Modifier> {
        match self {
            OnUpdate::Modifier(modifier) => Some(*modifier),
            OnUpdate::Ignore => None,
        }
    }
}

impl From<Modifier> for OnUpdate {
    fn from(modifier: Modifier) -> Self {
        OnUpdate::Modifier(modifier)
    }
}

/// Predicate over a native value.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
/// Predicate over a wire value, run before unwrapping.
pub type WireValidator = Arc<dyn Fn(&Bson) -> bool + Send + Sync>;
/// Produces a fresh default value.
pub type DefaultFactory = Arc<dyn Fn() -> Value + Send + Sync>;

/// Type-specific half of a field.
///
/// Implementations never see null input: the owning descriptor handles the null policy.
/// `field` is the descriptor's name and is only used to build error values.
pub trait FieldKind: Send + Sync + fmt::Debug {
    /// Name of the kind, used in messages.
    fn name(&self) -> &'static str;

    /// Operators the kind accepts.
    fn modifiers(&self) -> &'static [Modifier] {
        Modifier::SCALAR
    }

    /// Type/shape check and normalisation.
    fn coerce(&self, field: &str, value: Value) -> MapperResult<Value>;

    /// Cardinality, length and range checks plus per-element validation.
    fn check(&self, _field: &str, _value: &Value) -> MapperResult<()> {
        Ok(())
    }

    /// Converts a validated native value to its wire form.
    fn to_wire(&self, field: &str, value: &Value) -> MapperResult<Bson>;

    /// Converts a wire value to its native form, validating it on the way.
    fn from_wire(&self, field: &str, wire: Bson) -> MapperResult<Value>;

    /// Element descriptor of sequence kinds.
    fn item(&self) -> Option<&FieldDescriptor> {
        None
    }

    /// Whether `elem_match` may target the field.
    fn is_sequence(&self) -> bool {
        false
    }

    /// Embedded schema of document kinds (directly or through a sequence).
    fn schema(&self) -> Option<&Arc<DocumentSchema>> {
        None
    }

    /// Descriptor reached by a dotted path segment below this field.
    fn subfield(&self, _segment: &str) -> Option<FieldDescriptor> {
        None
    }

    /// Operators produced by a clean slot whose value tracks its own changes
    /// (embedded documents). Keys are relative to the field.
    fn nested_dirty_ops(&self, _value: &Value) -> MapperResult<Document> {
        Ok(Document::new())
    }
}

#[derive(Clone)]
enum FieldDefault {
    Value(Value),
    Factory(DefaultFactory),
}

/// A typed, validating field of a document schema.
#[derive(Clone)]
pub struct FieldDescriptor {
    name: String,
    wire_name: Option<String>,
    required: bool,
    default: Option<FieldDefault>,
    conflicting_defaults: bool,
    allow_null: bool,
    on_update: OnUpdate,
    validator: Option<Validator>,
    wrap_validator: Option<Validator>,
    unwrap_validator: Option<WireValidator>,
    identity: bool,
    kind: Arc<dyn FieldKind>,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("wire_name", &self.wire_name())
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("allow_null", &self.allow_null)
            .field("on_update", &self.on_update)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl FieldDescriptor {
    /// Creates a required field of the given kind, written with `$set`.
    pub fn new(name: impl Into<String>, kind: impl FieldKind + 'static) -> Self {
        Self::from_kind(name, Arc::new(kind))
    }

    pub fn from_kind(name: impl Into<String>, kind: Arc<dyn FieldKind>) -> Self {
        Self {
            name: name.into(),
            wire_name: None,
            required: true,
            default: None,
            conflicting_defaults: false,
            allow_null: false,
            on_update: OnUpdate::Modifier(Modifier::Set),
            validator: None,
            wrap_validator: None,
            unwrap_validator: None,
            identity: false,
            kind,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, StringKind::new())
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, IntKind::new())
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FloatKind::new())
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, BoolKind)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, DateTimeKind::new())
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, BinaryKind)
    }

    pub fn object_id(name: impl Into<String>) -> Self {
        Self::new(name, ObjectIdKind)
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::new(name, UuidKind)
    }

    pub fn enumeration(
        name: impl Into<String>,
        item: FieldDescriptor,
        values: impl IntoIterator<Item = Value>,
    ) -> Self {
        Self::new(name, EnumKind::new(item, values))
    }

    pub fn tuple(name: impl Into<String>, items: impl IntoIterator<Item = FieldDescriptor>) -> Self {
        Self::new(name, TupleKind::new(items))
    }

    /// A `(x, y)` float pair, the shape used by the geo operators.
    pub fn geo(name: impl Into<String>) -> Self {
        Self::tuple(name, [Self::float("x"), Self::float("y")])
    }

    pub fn anything(name: impl Into<String>) -> Self {
        Self::new(name, AnyKind)
    }

    pub fn document(name: impl Into<String>, schema: Arc<DocumentSchema>) -> Self {
        Self::new(name, DocumentKind::new(schema))
    }

    /// A `{"$ref", "$id"}` reference to documents of the named registered type.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, ReferenceKind::new(target))
    }

    pub fn list(name: impl Into<String>, item: FieldDescriptor) -> Self {
        Self::new(name, ListKind::new(item))
    }

    pub fn set(name: impl Into<String>, item: FieldDescriptor) -> Self {
        Self::new(name, SetKind::new(item))
    }

    pub fn dict(name: impl Into<String>, value: FieldDescriptor) -> Self {
        Self::new(name, DictKind::new(value))
    }

    pub fn key_value(name: impl Into<String>, key: FieldDescriptor, value: FieldDescriptor) -> Self {
        Self::new(name, KeyValueKind::new(key, value))
    }

    /// The default identity field (`mongo_id`, stored under `_id`).
    pub fn mongo_id() -> Self {
        Self::object_id("mongo_id")
            .identity()
            .optional()
            .with_on_update(OnUpdate::Ignore)
    }

    pub fn with_wire_name(mut self, wire_name: impl Into<String>) -> Self {
        self.wire_name = Some(wire_name.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets a static default. A `Null` default implies [`nullable`](Self::nullable).
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        if value.is_null() {
            self.allow_null = true;
        }
        if matches!(self.default, Some(FieldDefault::Factory(_))) {
            self.conflicting_defaults = true;
        }
        self.default = Some(FieldDefault::Value(value));
        self
    }

    pub fn with_default_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        if matches!(self.default, Some(FieldDefault::Value(_))) {
            self.conflicting_defaults = true;
        }
        self.default = Some(FieldDefault::Factory(Arc::new(factory)));
        self
    }

    pub fn nullable(mut self) -> Self {
        self.allow_null = true;
        self
    }

    pub fn with_on_update(mut self, on_update: impl Into<OnUpdate>) -> Self {
        self.on_update = on_update.into();
        self
    }

    /// Validator run on both wrap and unwrap.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_wrap_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.wrap_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_unwrap_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Bson) -> bool + Send + Sync + 'static,
    {
        self.unwrap_validator = Some(Arc::new(validator));
        self
    }

    /// Marks the field as the document identity, stored under `_id`.
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    /// Rejects contradictory declarations. Called when a schema is built.
    pub fn validate_config(&self) -> MapperResult<()> {
        if self.identity && self.wire_name.as_deref().is_some_and(|w| w != ID_KEY) {
            return Err(MapperError::InvalidConfig(format!(
                "field {} cannot declare both an identity role and a wire name",
                self.name
            )));
        }
        if self.conflicting_defaults {
            return Err(MapperError::InvalidConfig(format!(
                "field {}: only one of default and default factory is allowed",
                self.name
            )));
        }
        if let OnUpdate::Modifier(modifier) = self.on_update
            && !self.kind.modifiers().contains(&modifier)
        {
            return Err(MapperError::InvalidConfig(format!(
                "field {}: unsupported update operation {}",
                self.name, modifier
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_name(&self) -> &str {
        if self.identity {
            return ID_KEY;
        }
        self.wire_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn allows_null(&self) -> bool {
        self.allow_null
    }

    pub fn on_update(&self) -> OnUpdate {
        self.on_update
    }

    pub fn kind(&self) -> &dyn FieldKind {
        self.kind.as_ref()
    }

    pub fn valid_modifiers(&self) -> &'static [Modifier] {
        self.kind.modifiers()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Computes the default value, calling the factory if one is configured.
    pub fn default_value(&self) -> Option<Value> {
        match &self.default {
            Some(FieldDefault::Value(value)) => Some(value.clone()),
            Some(FieldDefault::Factory(factory)) => Some(factory()),
            None => None,
        }
    }

    pub(crate) fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Validates a native value for writing and returns its normalised form.
    pub fn validate_wrap(&self, value: Value) -> MapperResult<Value> {
        if value.is_null() {
            if self.allow_null {
                return Ok(Value::Null);
            }
            return Err(MapperError::bad_value(&self.name, &value, "Value may not be null"));
        }

        let value = self.kind.coerce(&self.name, value)?;
        self.kind.check(&self.name, &value)?;

        if let Some(validator) = &self.validator
            && !validator(&value)
        {
            return Err(MapperError::bad_value(&self.name, &value, "user-supplied validator failed"));
        }
        if let Some(validator) = &self.wrap_validator
            && !validator(&value)
        {
            return Err(MapperError::bad_value(
                &self.name,
                &value,
                "user-supplied wrap_validator failed",
            ));
        }

        Ok(value)
    }

    /// Runs the wire-side validators ahead of unwrapping.
    pub fn validate_unwrap(&self, wire: &Bson) -> MapperResult<()> {
        if matches!(wire, Bson::Null) {
            if self.allow_null {
                return Ok(());
            }
            return Err(MapperError::bad_value(&self.name, wire, "Value may not be null"));
        }
        if let Some(validator) = &self.unwrap_validator
            && !validator(wire)
        {
            return Err(MapperError::bad_value(
                &self.name,
                wire,
                "user-supplied unwrap_validator failed",
            ));
        }
        Ok(())
    }

    /// Validates `value` and converts it to its wire form.
    pub fn wrap(&self, value: &Value) -> MapperResult<Bson> {
        let value = self.validate_wrap(value.clone())?;
        if value.is_null() {
            return Ok(Bson::Null);
        }
        self.kind.to_wire(&self.name, &value)
    }

    /// Converts a wire value back to its native form.
    pub fn unwrap(&self, wire: Bson) -> MapperResult<Value> {
        self.validate_unwrap(&wire)?;
        if matches!(wire, Bson::Null) {
            return Ok(Value::Null);
        }
        let value = self.kind.from_wire(&self.name, wire)?;
        if let Some(validator) = &self.validator
            && !validator(&value)
        {
            return Err(MapperError::bad_value(&self.name, &value, "user-supplied validator failed"));
        }
        Ok(value)
    }

    /// Wraps a query operand. Sequence fields accept either one element or a whole sequence.
    pub fn wrap_value(&self, value: &Value) -> MapperResult<Bson> {
        let Some(item) = self.kind.item() else {
            return self.wrap(value);
        };
        match item.wrap_value(value) {
            Ok(wire) => Ok(wire),
            Err(item_err) => self.wrap(value).map_err(|_| {
                MapperError::bad_value(
                    &self.name,
                    value,
                    format!(
                        "Could not wrap value as the correct type. Tried {} and {}",
                        item.kind.name(),
                        self.kind.name()
                    ),
                )
                .with_cause(item_err)
            }),
        }
    }

    /// Computes this field's dirty-op fragment from its slot.
    ///
    /// A clean slot yields `{}` unless its value tracks nested changes, `$unset` yields
    /// `{"$unset": {wire: true}}` and any other pending operator yields `{op: {wire: wrap(value)}}`.
    pub fn dirty_ops(&self, slot: &ValueSlot) -> MapperResult<Document> {
        let wire_name = self.wire_name();

        if slot.update_op() == Some(Modifier::Unset) {
            return Ok(doc! { "$unset": { wire_name: true } });
        }

        match (slot.update_op(), slot.value()) {
            (Some(op), Some(value)) if slot.is_dirty() => {
                let mut fields = Document::new();
                fields.insert(wire_name, self.wrap(value)?);
                Ok(doc! { op.as_str(): fields })
            }
            (_, Some(value)) if !slot.is_dirty() => {
                let nested = self.kind.nested_dirty_ops(value)?;
                Ok(prefix_ops(nested, wire_name))
            }
            _ => Ok(Document::new()),
        }
    }
}

/// Prefixes every path of an operator document with `prefix.`.
pub(crate) fn prefix_ops(ops: Document, prefix: &str) -> Document {
    let mut out = Document::new();
    for (op, fields) in ops {
        let Bson::Document(fields) = fields else {
            continue;
        };
        let mut prefixed = Document::new();
        for (path, value) in fields {
            prefixed.insert(format!("{prefix}.{path}"), value);
        }
        out.insert(op, prefixed);
    }
    out
}

/// Folds `ops` into `target`, grouping by operator then path. Later paths win.
pub(crate) fn merge_ops(target: &mut Document, ops: Document) {
    for (op, fields) in ops {
        let Bson::Document(fields) = fields else {
            continue;
        };
        match target.get_mut(&op) {
            Some(Bson::Document(existing)) => {
                for (path, value) in fields {
                    existing.insert(path, value);
                }
            }
            _ => {
                target.insert(op, fields);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{IntKind, StringKind};

    #[test]
    fn identity_and_wire_name_are_exclusive() {
        let field = FieldDescriptor::object_id("key").identity().with_wire_name("key");
        assert!(matches!(field.validate_config(), Err(MapperError::InvalidConfig(_))));
    }

    #[test]
    fn default_and_factory_are_exclusive() {
        let field = FieldDescriptor::int("n")
            .with_default(1)
            .with_default_factory(|| Value::Int(2));
        assert!(matches!(field.validate_config(), Err(MapperError::InvalidConfig(_))));
    }

    #[test]
    fn on_update_must_be_valid_for_the_kind() {
        let field = FieldDescriptor::string("s").with_on_update(Modifier::Inc);
        assert!(matches!(field.validate_config(), Err(MapperError::InvalidConfig(_))));

        let field = FieldDescriptor::int("n").with_on_update(Modifier::Inc);
        assert!(field.validate_config().is_ok());
    }

    #[test]
    fn null_default_implies_nullable() {
        let field = FieldDescriptor::string("s").with_default(Value::Null);
        assert!(field.allows_null());
        assert_eq!(field.wrap(&Value::Null).unwrap(), Bson::Null);
    }

    #[test]
    fn null_is_rejected_unless_allowed() {
        let field = FieldDescriptor::int("n");
        assert!(matches!(field.wrap(&Value::Null), Err(MapperError::BadValue { .. })));
    }

    #[test]
    fn round_trip_applies_normalisation() {
        let field = FieldDescriptor::new("name", StringKind::new().max_length(10).uppercase().trim());
        let wire = field.wrap(&Value::from("  bot ")).unwrap();

        assert_eq!(wire, Bson::String("BOT".into()));
        assert_eq!(field.unwrap(wire).unwrap(), Value::from("BOT"));
    }

    #[test]
    fn user_validator_runs_after_kind_checks() {
        let field = FieldDescriptor::new("n", IntKind::new().max(10)).with_validator(|v| v.as_i64() != Some(7));

        match field.wrap(&Value::Int(11)) {
            Err(MapperError::BadValue { reason, .. }) => assert_eq!(reason, "Value too large"),
            other => panic!("unexpected result: {other:?}"),
        }
        match field.wrap(&Value::Int(7)) {
            Err(MapperError::BadValue { reason, .. }) => assert_eq!(reason, "user-supplied validator failed"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn dirty_ops_follow_the_slot() {
        let field = FieldDescriptor::int("age").with_wire_name("a");
        let mut slot = ValueSlot::new();
        assert!(field.dirty_ops(&slot).unwrap().is_empty());

        slot.write(Value::Int(4), Some(Modifier::Set));
        assert_eq!(field.dirty_ops(&slot).unwrap(), doc! { "$set": { "a": 4_i64 } });

        slot.delete();
        assert_eq!(field.dirty_ops(&slot).unwrap(), doc! { "$unset": { "a": true } });

        slot.clear_dirty();
        assert!(field.dirty_ops(&slot).unwrap().is_empty());
    }

    #[test]
    fn sequence_operands_try_the_item_first() {
        let field = FieldDescriptor::list("tags", FieldDescriptor::string("tag"));

        assert_eq!(field.wrap_value(&Value::from("a")).unwrap(), Bson::String("a".into()));
        assert_eq!(
            field.wrap_value(&Value::from(vec!["a", "b"])).unwrap(),
            Bson::Array(vec![Bson::String("a".into()), Bson::String("b".into())])
        );
        assert!(field.wrap_value(&Value::Int(3)).is_err());
    }

    #[test]
    fn merge_groups_by_operator() {
        let mut target = doc! { "$set": { "a": 1 } };
        merge_ops(&mut target, doc! { "$set": { "b": 2 }, "$unset": { "c": true } });

        assert_eq!(target, doc! { "$set": { "a": 1, "b": 2 }, "$unset": { "c": true } });
    }
}
