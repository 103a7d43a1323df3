//! Request execution: timeout policy, executor, and hard-cancel watchdog.

pub mod executor;
pub mod timeout;
pub mod watchdog;

pub use executor::{CallError, Executor};
pub use timeout::TimeoutPolicy;
pub use watchdog::{arm, ArmedWatchdog};
