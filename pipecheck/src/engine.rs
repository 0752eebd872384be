//! Machinery the checks run on: protocol clients, targets and the scheduler.

pub mod http;
pub mod scheduler;
pub mod target;
