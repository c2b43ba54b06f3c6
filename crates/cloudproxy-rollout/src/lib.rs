//! cloudproxy-rollout — rolling recycle of proxy fleets.
//!
//! Replaces active proxies a few at a time without dropping any group
//! below its availability floor.
//!
//! # Components
//!
//! - **`policy`** — operator limits (`enabled`, `min_available`,
//!   `batch_size`) behind an atomically swapped, versioned handle
//! - **`scheduler`** — pure selection of proxies to rotate, round-robin
//!   across groups
//! - **`pipeline`** — store transitions for selected proxies, their
//!   replacements, and failure handling
//!
//! # Invariants
//!
//! While the policy and a group are enabled:
//!
//! ```text
//! active_count(group) >= min(min_available, group.scaling.max)
//! rotating(fleet)     <= batch_size
//! ```

pub mod pipeline;
pub mod policy;
pub mod scheduler;

pub use pipeline::{
    begin_replacement, commit_selections, due_retries, release_stalled, replacement_failed,
    replacement_ready,
};
pub use policy::{PolicyError, PolicyHandle, PolicyPatch, RollingPolicy, VersionedPolicy};
pub use scheduler::{RecyclePlan, RecycleScheduler, Selection};
