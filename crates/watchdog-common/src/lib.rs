//! Common types and utilities for the cluster watchdog

pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod ticks;
pub mod types;

pub use config::{Settings, SettingsHandle};
pub use error::{Error, Result};
pub use health::{is_success_code, HealthState};
pub use ticks::Ticks;
pub use types::{HealthCheck, MetricCheck, ScheduledItem};
