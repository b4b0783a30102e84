//! Inference result containers attached to frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::collection::Collection;

/// Box in normalized `[0, 1]` image coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// Clips the box to the unit square.
    pub fn clamp(&self) -> Self {
        let unit = |v: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        let x = unit(self.x);
        let y = unit(self.y);
        let w = unit(self.w).min(1.0 - x);
        let h = unit(self.h).min(1.0 - y);
        Self { x, y, w, h }
    }

    pub fn is_valid(&self) -> bool {
        self.w > 0.0 && self.h > 0.0
    }

    /// Maps a box relative to `self` back into image coordinates.
    pub fn project(&self, inner: &BoundingBox) -> Self {
        Self {
            x: self.x + inner.x * self.w,
            y: self.y + inner.y * self.h,
            w: inner.w * self.w,
            h: inner.h * self.h,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: i32,
    pub value: i32,
    pub score: f32,
}

/// One detected (or classified) object.
#[derive(Debug, Default)]
pub struct InferObject {
    pub id: String,
    pub label: i32,
    pub score: f32,
    pub bbox: BoundingBox,
    attributes: Mutex<HashMap<String, Attribute>>,
    extra: Mutex<HashMap<String, String>>,
    features: Mutex<HashMap<String, Vec<f32>>>,
    pub collection: Collection,
}

impl InferObject {
    pub fn new(id: impl Into<String>, label: i32, score: f32, bbox: BoundingBox) -> Self {
        Self {
            id: id.into(),
            label,
            score,
            bbox,
            ..Default::default()
        }
    }

    pub fn add_attribute(&self, key: impl Into<String>, value: Attribute) {
        lock(&self.attributes).insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Attribute> {
        lock(&self.attributes).get(key).cloned()
    }

    pub fn add_extra(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.extra).insert(key.into(), value.into());
    }

    pub fn extra(&self, key: &str) -> Option<String> {
        lock(&self.extra).get(key).cloned()
    }

    pub fn extras(&self) -> HashMap<String, String> {
        lock(&self.extra).clone()
    }

    pub fn add_feature(&self, key: impl Into<String>, feature: Vec<f32>) {
        lock(&self.features).insert(key.into(), feature);
    }

    pub fn feature(&self, key: &str) -> Option<Vec<f32>> {
        lock(&self.features).get(key).cloned()
    }
}

/// Ordered per-frame result list, shared between postprocessors.
#[derive(Debug, Default)]
pub struct InferObjects {
    objects: Mutex<Vec<Arc<InferObject>>>,
}

impl InferObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, object: InferObject) -> Arc<InferObject> {
        let object = Arc::new(object);
        lock(&self.objects).push(Arc::clone(&object));
        object
    }

    pub fn snapshot(&self) -> Vec<Arc<InferObject>> {
        lock(&self.objects).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.objects).is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_and_project() {
        let bbox = BoundingBox::new(-0.1, 0.5, 0.5, 0.8).clamp();
        assert_eq!(bbox, BoundingBox::new(0.0, 0.5, 0.5, 0.5));
        assert!(bbox.is_valid());
        assert!(!BoundingBox::new(0.2, 0.2, 0.0, 0.1).is_valid());

        let roi = BoundingBox::new(0.5, 0.5, 0.5, 0.5);
        let inner = roi.project(&BoundingBox::new(0.0, 0.0, 0.5, 0.5));
        assert_eq!(inner, BoundingBox::new(0.5, 0.5, 0.25, 0.25));
    }

    #[test]
    fn test_object_attributes() {
        let objects = InferObjects::new();
        let car = objects.push(InferObject::new("0", 2, 0.9, BoundingBox::full()));
        car.add_attribute("color", Attribute { id: 1, value: 4, score: 0.7 });
        car.add_extra("plate", "ABC123");
        car.add_feature("embedding", vec![0.1, 0.2]);

        assert_eq!(objects.len(), 1);
        let stored = &objects.snapshot()[0];
        assert_eq!(stored.attribute("color").map(|a| a.value), Some(4));
        assert_eq!(stored.extra("plate").as_deref(), Some("ABC123"));
        assert_eq!(stored.feature("embedding"), Some(vec![0.1, 0.2]));
    }
}
