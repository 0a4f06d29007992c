//! Library for the node-local adaptive I/O weight controller.
//!
//! This crate provides the core functionality for:
//! - Discovering HP/LP pods on the local node
//! - Reading an HP latency signal from a time-series backend
//! - Computing a weight setpoint from that signal
//! - Applying the setpoint to cgroup v2 `io.weight`/`io.max` control files
//! - Health checks and observability

pub mod blockdev;
pub mod cgroup;
pub mod cluster;
pub mod control_law;
pub mod control_loop;
pub mod errors;
pub mod health;
pub mod latency;
pub mod observability;
pub mod types;

pub use errors::{BlockDevError, CgroupError, ErrorKind};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use observability::{ControllerMetrics, StructuredLogger};
pub use types::{CgroupHandle, DeviceId, Policy, PodRef, Priority, Setpoint};
