//! Client connectivity tracking for Tessera
//!
//! - [`ConnectedClientsLedger`]: which nodes each client is reachable through,
//!   with deferred, cancellable death notifications
//! - [`TimeScheduler`]: the timer thread those notifications run on
//! - [`ManualScheduler`]: a clock-driven scheduler for deterministic tests

#![warn(clippy::all)]

pub mod address;
pub mod ledger;
pub mod scheduler;

pub use address::{ClientInfo, ConnectivityStatus, NodeAddress};
pub use ledger::{
    ClientDeath, ConnectOutcome, ConnectedClientsLedger, DeathCallback, NotificationKind,
    NotificationSpec,
};
pub use scheduler::{ManualScheduler, ScheduledTask, TaskScheduler, TimeScheduler};

#[cfg(test)]
mod send_sync {
    use super::*;
    static_assertions::assert_impl_all!(ConnectedClientsLedger: Send, Sync);
    static_assertions::assert_impl_all!(TimeScheduler: Send, Sync);
    static_assertions::assert_impl_all!(ManualScheduler: Send, Sync);
}
