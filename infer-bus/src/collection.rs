use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::CollectionError;

pub const FRAME_TAG: &str = "frame";
pub const OBJECTS_TAG: &str = "objects";

type Payload = Arc<dyn Any + Send + Sync>;

/// Type-erased payloads keyed by static tags.
#[derive(Default)]
pub struct Collection {
    inner: RwLock<HashMap<&'static str, Payload>>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `tag`, replacing what was there.
    pub fn add<T: Any + Send + Sync>(&self, tag: &'static str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.add_shared(tag, Arc::clone(&value));
        value
    }

    pub fn add_shared<T: Any + Send + Sync>(&self, tag: &'static str, value: Arc<T>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag, value);
    }

    pub fn get<T: Any + Send + Sync>(&self, tag: &'static str) -> Result<Arc<T>, CollectionError> {
        let payload = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
            .ok_or(CollectionError::Missing(tag))?;
        payload
            .downcast::<T>()
            .map_err(|_| CollectionError::TypeMismatch {
                tag,
                expected: type_name::<T>(),
            })
    }

    pub fn has(&self, tag: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tag)
    }

    pub fn remove(&self, tag: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag)
            .is_some()
    }
}

impl Debug for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(inner.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_typed_value() {
        let collection = Collection::new();
        collection.add("count", 7u32);
        assert_eq!(*collection.get::<u32>("count").unwrap(), 7);
        assert!(collection.has("count"));
    }

    #[test]
    fn test_type_mismatch_and_missing() {
        let collection = Collection::new();
        collection.add("name", String::from("cam0"));
        assert_eq!(
            collection.get::<u32>("name").unwrap_err(),
            CollectionError::TypeMismatch {
                tag: "name",
                expected: "u32"
            }
        );
        assert_eq!(collection.get::<u32>("other").unwrap_err(), CollectionError::Missing("other"));
        assert!(collection.remove("name"));
        assert!(!collection.has("name"));
    }
}
