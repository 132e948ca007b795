//! Process-wide registry of document schemas.
//!
//! Registration is append-only and idempotent per type name. A collection name maps to
//! the most ancestral registered type stored in it, whatever the registration order.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

use bson::Bson;
use tracing::debug;

use crate::schema::DocumentSchema;

#[derive(Default)]
struct Registry {
    types: HashMap<String, Arc<DocumentSchema>>,
    collections: HashMap<String, Arc<DocumentSchema>>,
    /// Every registered descendant of a type, in registration order.
    subclasses: HashMap<String, Vec<Arc<DocumentSchema>>>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(Default::default);

/// Registers `schema`, returning the schema already registered under the same type name
/// when there is one.
pub fn register(schema: Arc<DocumentSchema>) -> Arc<DocumentSchema> {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = registry.types.get(schema.type_name()) {
        return Arc::clone(existing);
    }

    debug!(
        type_name = schema.type_name(),
        collection = schema.collection(),
        "registering document schema"
    );

    registry
        .types
        .insert(schema.type_name().to_string(), Arc::clone(&schema));

    let mut ancestor = schema.parent().cloned();
    while let Some(parent) = ancestor {
        registry
            .subclasses
            .entry(parent.type_name().to_string())
            .or_default()
            .push(Arc::clone(&schema));
        ancestor = parent.parent().cloned();
    }

    let replace = match registry.collections.get(schema.collection()) {
        Some(current) => current.is_a(&schema) && current.type_name() != schema.type_name(),
        None => true,
    };
    if replace {
        registry
            .collections
            .insert(schema.collection().to_string(), Arc::clone(&schema));
    }

    schema
}

pub fn lookup(type_name: &str) -> Option<Arc<DocumentSchema>> {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    registry.types.get(type_name).cloned()
}

/// The most ancestral type stored in `collection`.
pub fn lookup_collection(collection: &str) -> Option<Arc<DocumentSchema>> {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    registry.collections.get(collection).cloned()
}

/// Every registered descendant of `type_name`.
pub fn subclasses_of(type_name: &str) -> Vec<Arc<DocumentSchema>> {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    registry.subclasses.get(type_name).cloned().unwrap_or_default()
}

/// The type whose discriminator value is `value`, searching `type_name` and its
/// descendants.
pub(crate) fn subclass_for(type_name: &str, value: &Bson) -> Option<Arc<DocumentSchema>> {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    if let Some(schema) = registry.types.get(type_name)
        && schema.identity_value() == Some(value)
    {
        return Some(Arc::clone(schema));
    }
    registry
        .subclasses
        .get(type_name)?
        .iter()
        .find(|sub| sub.identity_value() == Some(value))
        .cloned()
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::field::FieldDescriptor;

    #[test]
    fn registration_is_idempotent_per_type_name() {
        let first = DocumentSchema::builder("RegistryIdempotent").register().unwrap();
        let second = DocumentSchema::builder("RegistryIdempotent")
            .field(FieldDescriptor::string("ignored"))
            .register()
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(lookup("RegistryIdempotent").is_some());
    }

    #[test]
    fn collection_maps_to_the_root_whatever_the_order() {
        let root = DocumentSchema::builder("RegistryRoot")
            .field(FieldDescriptor::string("kind"))
            .polymorphic_on("kind")
            .identity_value("root")
            .build()
            .unwrap();
        let child = DocumentSchema::builder("RegistryChild")
            .extends(&root)
            .identity_value("child")
            .build()
            .unwrap();

        register(Arc::clone(&child));
        assert_eq!(
            lookup_collection("RegistryRoot").map(|s| s.type_name().to_string()),
            Some("RegistryChild".to_string())
        );

        register(root);
        assert_eq!(
            lookup_collection("RegistryRoot").map(|s| s.type_name().to_string()),
            Some("RegistryRoot".to_string())
        );
        assert_eq!(subclasses_of("RegistryRoot").len(), 1);
    }

    #[test]
    fn polymorphic_unwrap_picks_the_most_specific_type() {
        let animal = DocumentSchema::builder("RegistryAnimal")
            .field(FieldDescriptor::string("kind"))
            .polymorphic_on("kind")
            .identity_value("animal")
            .register()
            .unwrap();
        let dog = DocumentSchema::builder("RegistryDog")
            .extends(&animal)
            .identity_value("dog")
            .register()
            .unwrap();
        let puppy = DocumentSchema::builder("RegistryPuppy")
            .extends(&dog)
            .identity_value("puppy")
            .register()
            .unwrap();

        let wire = doc! { "kind": "puppy" };
        let found = animal.get_subclass(&wire).unwrap();
        assert_eq!(found.type_name(), puppy.type_name());
        assert!(puppy.get_subclass(&wire).is_none());

        assert_eq!(
            animal.base_query(false),
            doc! { "kind": { "$in": ["dog", "puppy", "animal"] } }
        );
        assert_eq!(dog.base_query(true), doc! { "kind": "dog" });
    }
}
