//! Scope-namespaced cache keys.
//!
//! `CacheKey` can only be built through [`build_scoped_key`], which reads
//! exactly the tiers a resource type requires from the session's
//! [`ScopeContext`]. Tiers that are not required never reach the key, so two
//! sessions that differ only in an irrelevant tier share cached data, and two
//! sessions that differ in a required tier never do.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::{ScopeContext, ScopeTier};

/// One structurally comparable component of a cache key.
///
/// Object components keep their fields in sorted order, so keys built from
/// the same logical params compare equal regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    Null,
    Bool(bool),
    /// Numbers keep their canonical textual form to stay `Eq + Hash`.
    Number(String),
    Str(String),
    List(Vec<KeyPart>),
    Map(BTreeMap<String, KeyPart>),
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Number(n) => KeyPart::Number(n.to_string()),
            Value::String(s) => KeyPart::Str(s.clone()),
            Value::Array(items) => KeyPart::List(items.iter().map(KeyPart::from).collect()),
            Value::Object(map) => KeyPart::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), KeyPart::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for KeyPart {
    fn from(value: Value) -> Self {
        KeyPart::from(&value)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "null"),
            KeyPart::Bool(b) => write!(f, "{}", b),
            KeyPart::Number(n) => write!(f, "{}", n),
            KeyPart::Str(s) => write!(f, "{}", s),
            KeyPart::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            KeyPart::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A hierarchical cache key: scope values in tier order, resource key, verb,
/// then optional context parts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    /// Private inner data - cannot be constructed externally
    inner: CacheKeyInner,
}

/// Private inner struct - prevents external construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct CacheKeyInner {
    scope: Vec<(ScopeTier, String)>,
    resource_key: String,
    verb: String,
    context: Vec<KeyPart>,
}

impl CacheKey {
    /// Scope values this key is namespaced by, in tier order.
    pub fn scope(&self) -> &[(ScopeTier, String)] {
        &self.inner.scope
    }

    /// The resource key, e.g. `"project"`.
    pub fn resource_key(&self) -> &str {
        &self.inner.resource_key
    }

    /// The verb, e.g. `"list"`.
    pub fn verb(&self) -> &str {
        &self.inner.verb
    }

    /// Context parts following the verb.
    pub fn context(&self) -> &[KeyPart] {
        &self.inner.context
    }

    /// Derive a related key by appending one more context part.
    ///
    /// Used to address queries that hang off this one, e.g. the item-load
    /// key of a list key.
    pub fn with_suffix(&self, part: impl Into<KeyPart>) -> CacheKey {
        let mut inner = self.inner.clone();
        inner.context.push(part.into());
        CacheKey { inner }
    }

    /// Same scope and resource key, different verb, no context.
    pub fn with_verb(&self, verb: impl Into<String>) -> CacheKey {
        CacheKey {
            inner: CacheKeyInner {
                scope: self.inner.scope.clone(),
                resource_key: self.inner.resource_key.clone(),
                verb: verb.into(),
                context: Vec::new(),
            },
        }
    }

    /// True if both keys address the same resource type under the same scope.
    pub fn shares_resource_scope(&self, other: &CacheKey) -> bool {
        self.inner.scope == other.inner.scope && self.inner.resource_key == other.inner.resource_key
    }

    /// True if `other` equals this key or extends it with further context parts.
    pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
        self.inner.scope == other.inner.scope
            && self.inner.resource_key == other.inner.resource_key
            && self.inner.verb == other.inner.verb
            && other.inner.context.starts_with(&self.inner.context)
    }

    /// The flat tuple view of this key.
    pub fn parts(&self) -> Vec<KeyPart> {
        let mut parts: Vec<KeyPart> = self
            .inner
            .scope
            .iter()
            .map(|(_, v)| KeyPart::Str(v.clone()))
            .collect();
        parts.push(KeyPart::Str(self.inner.resource_key.clone()));
        parts.push(KeyPart::Str(self.inner.verb.clone()));
        parts.extend(self.inner.context.iter().cloned());
        parts
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.parts();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

/// Outcome of building a key from the current scope context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopedKey {
    Resolved(CacheKey),
    /// A required scope value is absent; every request against this key
    /// must be suppressed.
    Unresolved { missing: ScopeTier },
}

impl ScopedKey {
    /// The key, if every required tier was present.
    pub fn resolved(&self) -> Option<&CacheKey> {
        match self {
            ScopedKey::Resolved(key) => Some(key),
            ScopedKey::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ScopedKey::Resolved(_))
    }

    /// Derive a suffixed key; an unresolved key stays unresolved.
    pub fn with_suffix(&self, part: impl Into<KeyPart>) -> ScopedKey {
        match self {
            ScopedKey::Resolved(key) => ScopedKey::Resolved(key.with_suffix(part)),
            ScopedKey::Unresolved { missing } => ScopedKey::Unresolved { missing: *missing },
        }
    }
}

/// Build a cache key for a resource type.
///
/// Only the `required` tiers are read from `ctx`, in tier order regardless of
/// the order they are declared in. Never fails: a missing required value
/// yields [`ScopedKey::Unresolved`] naming the broadest missing tier.
pub fn build_scoped_key(
    required: &[ScopeTier],
    ctx: &ScopeContext,
    resource_key: &str,
    verb: &str,
    context: Option<KeyPart>,
) -> ScopedKey {
    let mut tiers = required.to_vec();
    tiers.sort();
    tiers.dedup();

    let mut scope = Vec::with_capacity(tiers.len());
    for tier in tiers {
        match ctx.value(tier) {
            Some(value) => scope.push((tier, value.to_string())),
            None => return ScopedKey::Unresolved { missing: tier },
        }
    }

    ScopedKey::Resolved(CacheKey {
        inner: CacheKeyInner {
            scope,
            resource_key: resource_key.to_string(),
            verb: verb.to_string(),
            context: context.into_iter().collect(),
        },
    })
}
