//! Storage layer for Tessera
//!
//! This crate provides the in-memory keyed storage engine:
//! - LocalStore: DashMap-backed `CacheImpl` with per-key critical sections
//! - Key dependency registration (parent → dependents)
//! - TtlIndex: expiry timestamp → keys, for the expiration cleaner
//! - Optional entry-count capacity and a shutdown write allow-list

#![warn(clippy::all)]

pub mod local;
pub mod ttl;

pub use local::LocalStore;
pub use ttl::TtlIndex;
