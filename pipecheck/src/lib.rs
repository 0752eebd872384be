pub mod cfg;
pub mod check;
pub mod cmd;
pub mod engine;
mod humanize;
pub mod logging;
pub mod oneshot;
mod payload;
pub mod protocol;
pub mod report;
pub mod runtime;
mod shaper;
