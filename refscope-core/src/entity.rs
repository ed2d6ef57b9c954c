//! Raw backend entities, display-oriented reference items, and the query
//! shapes exchanged with the transport layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ScopeTier;

/// A backend-shaped record. Its id lives under the resource type's `id_key`.
pub type RawEntity = Value;

/// Read an entity's id from its `id_key` field.
///
/// String ids are returned as-is, numeric ids in their canonical textual
/// form. Any other shape (or a missing field) yields `None`.
pub fn entity_id(entity: &RawEntity, id_key: &str) -> Option<String> {
    match entity.get(id_key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A minimal display item derived from one raw entity.
///
/// Items are replaced wholesale on each derivation, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem<T> {
    /// The entity id.
    pub key: String,
    /// Human-readable label.
    pub label: String,
    /// Entity name (often equal to the label).
    pub name: String,
    /// Resource-specific display data.
    pub data: T,
}

impl<T> ReferenceItem<T> {
    pub fn new(key: impl Into<String>, label: impl Into<String>, name: impl Into<String>, data: T) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            name: name.into(),
            data,
        }
    }
}

/// Static description of a referenceable resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Stable resource key, e.g. `"project"`.
    pub resource_key: String,
    /// The field carrying each entity's id, e.g. `"project_id"`.
    pub id_key: String,
    /// Display name of the resource type, e.g. `"Project"`.
    pub name: String,
    /// Scope tiers that namespace this resource's cached data.
    pub required_tiers: Vec<ScopeTier>,
    /// Params sent with every fetch (field projection and the like).
    pub base_params: Map<String, Value>,
}

impl ResourceDescriptor {
    pub fn new(resource_key: impl Into<String>, id_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            id_key: id_key.into(),
            name: name.into(),
            required_tiers: Vec::new(),
            base_params: Map::new(),
        }
    }

    /// Set the required scope tiers.
    pub fn with_tiers(mut self, tiers: &[ScopeTier]) -> Self {
        self.required_tiers = tiers.to_vec();
        self
    }

    /// Add one base param.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.base_params.insert(key.into(), value);
        self
    }

    /// Summary exposed to consumers alongside a reference map.
    pub fn type_info(&self) -> ReferenceTypeInfo {
        ReferenceTypeInfo {
            resource_type: self.resource_key.clone(),
            id_key: self.id_key.clone(),
            name: self.name.clone(),
        }
    }
}

/// Consumer-facing summary of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTypeInfo {
    pub resource_type: String,
    pub id_key: String,
    pub name: String,
}

/// One filter clause: field `k` must be one of `v`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub k: String,
    pub v: Vec<String>,
}

/// Params handed to a fetch function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceQuery {
    /// Empty for a full preload, otherwise restricted to an id set.
    pub filter: Vec<QueryFilter>,
    /// The resource type's base params.
    pub params: Map<String, Value>,
}

impl ReferenceQuery {
    /// A query restricted to exactly `ids`.
    pub fn for_ids(id_key: &str, ids: Vec<String>, params: Map<String, Value>) -> Self {
        Self {
            filter: vec![QueryFilter {
                k: id_key.to_string(),
                v: ids,
            }],
            params,
        }
    }

    /// A query over every entity visible to the base params.
    pub fn all(params: Map<String, Value>) -> Self {
        Self {
            filter: Vec::new(),
            params,
        }
    }

    /// Ids this query is restricted to, if any.
    pub fn requested_ids(&self) -> Option<&[String]> {
        self.filter.first().map(|f| f.v.as_slice())
    }
}

/// Response of a fetch function. Missing entities are simply omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub results: Vec<RawEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

impl ListResponse {
    pub fn new(results: Vec<RawEntity>) -> Self {
        Self {
            results,
            total_count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_id_string_and_number() {
        assert_eq!(entity_id(&json!({"id": "p-1"}), "id"), Some("p-1".to_string()));
        assert_eq!(entity_id(&json!({"id": 42}), "id"), Some("42".to_string()));
    }

    #[test]
    fn test_entity_id_missing_or_invalid() {
        assert_eq!(entity_id(&json!({"name": "x"}), "id"), None);
        assert_eq!(entity_id(&json!({"id": ""}), "id"), None);
        assert_eq!(entity_id(&json!({"id": null}), "id"), None);
        assert_eq!(entity_id(&json!("scalar"), "id"), None);
    }

    #[test]
    fn test_query_for_ids_shape() {
        let mut params = Map::new();
        params.insert("only".to_string(), json!(["project_id", "name"]));
        let query = ReferenceQuery::for_ids("project_id", vec!["p-1".to_string()], params);
        let encoded = serde_json::to_value(&query).unwrap();
        assert_eq!(
            encoded,
            json!({
                "filter": [{"k": "project_id", "v": ["p-1"]}],
                "params": {"only": ["project_id", "name"]}
            })
        );
        assert_eq!(query.requested_ids(), Some(&["p-1".to_string()][..]));
    }

    #[test]
    fn test_query_all_has_no_filter() {
        assert!(ReferenceQuery::all(Map::new()).requested_ids().is_none());
    }

    #[test]
    fn test_list_response_tolerates_missing_results() {
        let response: ListResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.results.is_empty());
    }

    #[test]
    fn test_descriptor_type_info() {
        let descriptor = ResourceDescriptor::new("project", "project_id", "Project")
            .with_tiers(&[ScopeTier::Domain])
            .with_param("only", json!(["project_id", "name"]));
        let info = descriptor.type_info();
        assert_eq!(info.resource_type, "project");
        assert_eq!(info.id_key, "project_id");
        assert_eq!(info.name, "Project");
        assert_eq!(descriptor.base_params.len(), 1);
    }
}
