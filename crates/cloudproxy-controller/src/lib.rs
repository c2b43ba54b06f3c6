//! cloudproxy-controller — drives the fleet toward its targets.
//!
//! - **`controller`** — the reconciliation loop: scaling, rolling recycle,
//!   replacement retries, and folding provider outcomes into the store
//! - **`destroy`** — the destroy queue worker
//! - **`backoff`** — exponential retry delays shared by both

pub mod backoff;
pub mod controller;
pub mod destroy;
pub mod error;

pub use backoff::Backoff;
pub use controller::{Controller, ProvisionOutcome, Purpose, TickSummary};
pub use destroy::{DestroyWorker, DrainSummary};
pub use error::{ControllerError, ControllerResult};
