//! cloudproxy-state — the fleet state store.
//!
//! Holds every instance group's proxy set, lifecycle state, and scaling
//! target, plus the destroy queue. The store is the single source of
//! truth for the controller, the API, and the destroy worker.
//!
//! # Concurrency
//!
//! Each group sits behind its own lock. Mutations to different groups
//! never contend; mutations to the same group serialize. A mutation runs
//! against a draft copy and only commits when it returns `Ok`, so readers
//! never observe a half-applied change.
//!
//! # Persistence
//!
//! `FleetStore::open` mirrors every committed group and queue entry into
//! [redb](https://docs.rs/redb) as JSON and reloads it on restart.
//! `FleetStore::open_in_memory` keeps everything in process memory.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{FleetSnapshot, FleetStore};
pub use types::*;
