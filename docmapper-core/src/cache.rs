//! Session identity cache.
//!
//! Maps `(collection, identity)` to the live entity handle so two lookups of the same
//! stored document in one session return the same instance. Reads do not refresh an
//! entry's position: eviction follows insertion order.

use std::num::NonZeroUsize;

use bson::Bson;
use lru::LruCache;

use crate::entity::SharedEntity;

#[derive(Debug)]
pub(crate) struct IdentityCache {
    entries: Option<LruCache<String, SharedEntity>>,
}

impl IdentityCache {
    /// A cache holding at most `capacity` entities. A capacity of zero disables caching.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    fn key(collection: &str, id: &Bson) -> String {
        format!("{collection}:{id}")
    }

    pub(crate) fn read(&self, collection: &str, id: &Bson) -> Option<SharedEntity> {
        self.entries.as_ref()?.peek(&Self::key(collection, id)).cloned()
    }

    /// Inserts or replaces the entry, evicting the oldest one when full.
    pub(crate) fn write(&mut self, collection: &str, id: &Bson, entity: SharedEntity) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(Self::key(collection, id), entity);
        }
    }

    pub(crate) fn remove(&mut self, collection: &str, id: &Bson) {
        if let Some(entries) = self.entries.as_mut() {
            entries.pop(&Self::key(collection, id));
        }
    }

    pub(crate) fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map(LruCache::len).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;

    use super::*;
    use crate::{entity::Entity, schema::DocumentSchema};

    fn entity() -> SharedEntity {
        let schema = DocumentSchema::builder("CacheEntry").build().unwrap();
        SharedEntity::new(Entity::new(schema))
    }

    #[test]
    fn reads_return_the_cached_handle() {
        let mut cache = IdentityCache::new(4);
        let id = Bson::ObjectId(ObjectId::new());
        let handle = entity();

        cache.write("c", &id, handle.clone());

        assert!(cache.read("c", &id).unwrap().ptr_eq(&handle));
        assert!(cache.read("other", &id).is_none());
    }

    #[test]
    fn eviction_follows_insertion_order() {
        let mut cache = IdentityCache::new(2);
        let ids: Vec<Bson> = (0..3).map(|n| Bson::Int64(n)).collect();

        cache.write("c", &ids[0], entity());
        cache.write("c", &ids[1], entity());
        assert!(cache.read("c", &ids[0]).is_some());
        cache.write("c", &ids[2], entity());

        assert!(cache.read("c", &ids[0]).is_none());
        assert!(cache.read("c", &ids[1]).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn string_and_numeric_ids_do_not_collide() {
        let mut cache = IdentityCache::new(4);
        let number = Bson::Int32(1);
        let text = Bson::String("1".into());
        let handle = entity();

        cache.write("c", &number, handle.clone());

        assert!(cache.read("c", &text).is_none());
        assert!(cache.read("c", &number).unwrap().ptr_eq(&handle));
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let mut cache = IdentityCache::new(0);
        let id = Bson::Int32(1);
        cache.write("c", &id, entity());

        assert!(cache.read("c", &id).is_none());
        assert_eq!(cache.len(), 0);
    }
}
