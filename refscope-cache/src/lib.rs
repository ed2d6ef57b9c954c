//! refscope Cache - Reference Resolution
//!
//! Resolves foreign-key ids into display items for many independent
//! consumers at once, fetching each id at most once per scope:
//!
//! - [`ReferenceMap`] hands out a reactive [`ReferenceSlot`] per id
//! - reads of uncached ids wake the owning [`Repository`] over the event bus
//! - the repository coalesces every id requested within one scheduler tick
//!   into a single batched fetch and upserts the results by id
//! - [`ReferenceProjection`] re-derives slots through the adaptor whenever the
//!   cache entry changes
//! - [`ReferenceMutations`] patches the entry after writes and marks derived
//!   list and count queries stale
//!
//! Cache keys carry only the scope tiers a resource type requires, so data
//! is shared exactly as widely as it is valid. When a required tier is
//! missing, maps are disabled and nothing is fetched.

pub mod client;
pub mod mutation;
pub mod projection;
pub mod proxy;
pub mod registry;
pub mod repository;
pub mod store;
pub mod subscription;
pub mod telemetry;

pub use client::{ReferenceClient, ReferenceHandle};
pub use mutation::ReferenceMutations;
pub use projection::{ReferenceProjection, ReferenceSlot, SlotSubscription};
pub use proxy::ReferenceMap;
pub use registry::{RepositoryRegistry, Resolver};
pub use repository::{Repository, RepositoryDeps, RepositoryPhase};
pub use store::{CacheStore, InMemoryCacheStore, StoreEvent, StoreListener, StoreStats, StoreSubscriptionId};
pub use subscription::{ConsumerGuard, ConsumerHandle, SubscriptionManager, Teardown};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
