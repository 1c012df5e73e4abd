//! Wattson Library
//!
//! Samples energy and resource sensors while an application runs, gathers the samples from every rank
//! to a collector and reduces them into a persisted APP -> MULTI_RUN -> RUN -> NODE -> DEVICE -> SENSOR tree.

pub mod transaction;
pub mod utils;
#[macro_use]
pub mod macros;
pub mod assignment;
pub mod backends;
pub mod catalog;
pub mod clock;
pub mod comm;
pub mod config;
pub mod continuation;
pub mod data;
pub mod logging;
pub mod monitor;
pub mod monitor_config;
pub mod processing;
pub mod rpc;
pub mod sampler;
pub mod session;
pub mod storage;
pub mod units;
