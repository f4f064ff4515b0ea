//! gilliam-core — shared vocabulary for the Gilliam scheduler.
//!
//! Identifiers, the resource vector used for capacity accounting, the
//! scheduler clock, and the `gilliam.toml` configuration.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, LogicalClock, SystemClock};
pub use config::{
    ConfigError, DispatchLimit, GilliamConfig, HeartbeatConfig, PackingPolicy, SchedulerConfig,
    ServerConfig,
};
pub use types::*;
