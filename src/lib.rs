//! linkshaper -- keeps RouterOS queue limits tracking a DSL line's
//! attainable rate.
//!
//! One invocation reads the modem's downstream/upstream attainable-rate
//! counters over SNMP, derives margined shaping limits, and reconciles two
//! RouterOS queue-tree entries against them. Scheduling is external (cron or
//! a systemd timer); each run is self-contained.

pub mod config;
pub mod limits;
pub mod pipeline;
pub mod rate;
pub mod routeros;
pub mod shaping;
pub mod snmp;

pub use config::ShaperConfig;
pub use pipeline::{adjust, inspect, CycleError, CycleReport};
