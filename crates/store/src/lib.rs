//! Transactional persistence for jobs, events, workers, dataset locks and
//! the webhook outbox.
//!
//! The store exclusively owns all durable state. Every operation is a single
//! serializable transaction; components above it never hold authoritative
//! in-memory state, so restarts rebuild everything from here.
//!
//! Two implementations exist behind the same trait: [`MemoryStore`] for
//! tests and single-node dev runs, and [`PgStore`] for production.

mod error;
mod in_memory;
mod postgres;
mod r#trait;

pub use error::StoreError;
pub use in_memory::MemoryStore;
pub use postgres::PgStore;
pub use r#trait::{ExpiryOutcome, LeaseBeat, LeaseExpiry, QueueCounts, Store};
