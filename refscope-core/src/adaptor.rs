//! Adaptors turn raw backend entities into display items.

use serde_json::Value;

use crate::{entity_id, RawEntity, ReferenceItem};

/// Pure mapping from a raw entity to a reference item.
///
/// Returning `None` treats the entity as unusable for display, which
/// consumers observe exactly like an unresolved id.
pub trait ReferenceAdaptor<T>: Send + Sync {
    fn adapt(&self, raw: &RawEntity) -> Option<ReferenceItem<T>>;
}

impl<T, F> ReferenceAdaptor<T> for F
where
    F: Fn(&RawEntity) -> Option<ReferenceItem<T>> + Send + Sync,
{
    fn adapt(&self, raw: &RawEntity) -> Option<ReferenceItem<T>> {
        self(raw)
    }
}

/// Generic adaptor reading the label from one field and keeping the raw
/// entity as data.
#[derive(Debug, Clone)]
pub struct FieldAdaptor {
    id_key: String,
    label_key: String,
}

impl FieldAdaptor {
    pub fn new(id_key: impl Into<String>, label_key: impl Into<String>) -> Self {
        Self {
            id_key: id_key.into(),
            label_key: label_key.into(),
        }
    }
}

impl ReferenceAdaptor<Value> for FieldAdaptor {
    fn adapt(&self, raw: &RawEntity) -> Option<ReferenceItem<Value>> {
        let id = entity_id(raw, &self.id_key)?;
        // Fall back to the id so an unnamed entity still renders something.
        let label = raw
            .get(&self.label_key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        Some(ReferenceItem::new(id, label.clone(), label, raw.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_adaptor() {
        let adaptor = FieldAdaptor::new("id", "name");
        let raw = json!({"id": "p-1", "name": "Alpha"});
        let item = adaptor.adapt(&raw).unwrap();
        assert_eq!(item.key, "p-1");
        assert_eq!(item.label, "Alpha");
        assert_eq!(item.name, "Alpha");
        assert_eq!(item.data, raw);
    }

    #[test]
    fn test_field_adaptor_label_falls_back_to_id() {
        let adaptor = FieldAdaptor::new("id", "name");
        let item = adaptor.adapt(&json!({"id": "p-9"})).unwrap();
        assert_eq!(item.label, "p-9");
    }

    #[test]
    fn test_field_adaptor_rejects_entity_without_id() {
        let adaptor = FieldAdaptor::new("id", "name");
        assert!(adaptor.adapt(&json!({"name": "orphan"})).is_none());
    }

    #[test]
    fn test_closure_adaptor() {
        let adaptor = |raw: &RawEntity| {
            let id = entity_id(raw, "region_code")?;
            Some(ReferenceItem::new(id.clone(), id.to_uppercase(), id, ()))
        };
        let item = adaptor.adapt(&json!({"region_code": "ap-1"})).unwrap();
        assert_eq!(item.label, "AP-1");
    }
}
