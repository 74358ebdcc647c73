//! Thin query layer over the control-plane Postgres schema.
//!
//! Modules map one-to-one onto tables. Functions take an executor or an open
//! transaction and contain no business logic; validation and cache side
//! effects live in the `lookout` engine crate.

pub mod groups;
pub mod instances;
pub mod subscriptions;
