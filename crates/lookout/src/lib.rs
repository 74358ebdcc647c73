//! Lookout control-plane engine.
//!
//! The relational store (Postgres) is authoritative for groups,
//! subscriptions and alert instances; the command cache (Redis) carries
//! derived membership sets and reverse indices for O(1) event routing.
//! Mutations commit to the store first and then push incremental deltas to
//! the cache. Cache writes are best-effort: failures are logged and healed
//! by the reconciliation pass, never retried inline and never allowed to
//! fail the owning mutation.

pub mod cache;
pub mod cache_sync;
mod error;
pub mod indexer;
pub mod materialize;
pub mod reconcile;
pub mod resolver;
pub mod store;
pub mod subscriptions;

#[cfg(test)]
pub mod testutil;

pub use error::{Error, Result, ValidationError};
