//! Lock and version control for Tessera
//!
//! This crate decides whether a write may proceed against the entry currently
//! stored for a key:
//! - LockController: access-type evaluation, lock grants, group checks
//! - VersionStamper: version assignment for fresh keys and overwrites
//! - LockIdGenerator: unique `pid-host-key-counter` lock handles
//!
//! Nothing here takes a lock of its own. Callers evaluate inside whatever
//! per-key critical section their storage provides.

#![warn(clippy::all)]

pub mod controller;
pub mod lock_id;
pub mod version;

pub use controller::{Decision, LockAttempt, LockController, ReadDecision};
pub use lock_id::LockIdGenerator;
pub use version::{VersionStamper, DEFAULT_REFERENCE_EPOCH};
