//! Entitlement & subscription billing engine.
//!
//! Leaves first: `tiers` and `period` are pure; `store` is the persistence
//! seam; `credits` and `subscriptions` own their records; `arbiter` decides
//! and debits; `webhook` reconciles provider events; `sweeper` drives
//! scheduled renewal and retries.

pub mod arbiter;
pub mod audit;
pub mod credits;
pub mod handlers;
pub mod memory_store;
pub mod period;
pub mod pg_store;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod sweeper;
pub mod tiers;
pub mod webhook;
