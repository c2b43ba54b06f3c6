//! cloudproxy-autoscale — closes the gap between desired and live scale.
//!
//! # Reconciliation
//!
//! ```text
//! n = active + retiring-awaiting-replacement + provisioning
//!
//! if !enabled:          MarkExcessForRemoval(every active proxy)
//! else if n < min:      Provision(min - n)
//! else if n > max:      MarkExcessForRemoval(n - max newest active proxies)
//! else:                 NoChange
//! ```
//!
//! Newest proxies go first so long-lived, already-warmed instances are
//! kept. Ties on creation time break toward the lowest IP.

pub mod reconciler;

pub use reconciler::{ScaleAction, reconcile, reconcile_all};
