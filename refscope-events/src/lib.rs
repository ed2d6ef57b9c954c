//! refscope Events - Event Bus
//!
//! A minimal per-topic publish/subscribe bus. Repositories use it to receive
//! "fetch this id" wake-ups from the reference maps that front them.
//!
//! # Topics
//!
//! A [`Topic`] is an opaque token compared by identity, not by name: two
//! topics created with the same label are still distinct, so independently
//! constructed buses and repositories can never cross-talk.
//!
//! ```text
//! ReferenceMap::get(id) ──emit(topic, id)──▶ EventBus ──▶ Repository::request_item(id)
//! ```

mod bus;

pub use bus::{EventBus, Listener, Topic};
