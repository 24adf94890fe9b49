//! Push-mode concurrent dispatch.
//!
//! A [`DispatchPool`] drains broker push deliveries through a fixed pool
//! of worker threads, while a watchdog thread escalates messages stuck in
//! processing beyond the configured budget.

mod pool;
mod ring;
mod watchdog;

pub use pool::{DispatchPool, WatchdogStats, MIN_PROCESSING_BUDGET};
pub use ring::Ring;
