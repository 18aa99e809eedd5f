//! notify-scheduler library crate.
//!
//! A persistent, cron-driven notification scheduler: scheduled jobs fire into
//! a durable priority queue, a worker fans each queued notification out to
//! its delivery endpoints, and every outcome is recorded as metrics.

pub mod config;
pub mod database;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod queue;
pub mod scheduler;
pub mod services;
pub mod template;
pub mod worker;

pub use error::{Error, Result};
