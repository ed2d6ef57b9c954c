//! refscope Core - Data Types and Collaborator Seams
//!
//! Scope tiers, cache keys, raw entities, reference items, errors and
//! configuration, plus the traits through which the cache talks to its
//! external collaborators (fetch functions, adaptors, error reporting).
//! Every other refscope crate depends on this one; it holds no caching
//! behavior of its own.

pub mod adaptor;
pub mod config;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod key;
pub mod scope;

pub use adaptor::{FieldAdaptor, ReferenceAdaptor};
pub use config::ReferenceConfig;
pub use entity::{
    entity_id, ListResponse, QueryFilter, RawEntity, ReferenceItem, ReferenceQuery,
    ReferenceTypeInfo, ResourceDescriptor,
};
pub use error::{ConfigError, MutationError, RefError, RefResult, ScopeError, TransportError};
pub use fetch::{ErrorReporter, FnFetcher, ReferenceFetcher, TracingErrorReporter};
pub use key::{build_scoped_key, CacheKey, KeyPart, ScopedKey};
pub use scope::{ScopeContext, ScopeTier};

/// Verb of the per-id reference query.
pub const REFERENCE_VERB: &str = "reference";
