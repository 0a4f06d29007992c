//! Core domain types shared across the controller.
//!
//! These are plain, serde-derived structs in the same spirit as the
//! collector's `ContainerMetrics`/`ContainerInfo`: no behavior, just
//! shape, with constructors where invariants need enforcing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Priority class a pod is classified into by its label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Hp,
    Lp,
    Unmanaged,
}

/// A pod discovered on the local node during one cluster-view sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodRef {
    /// Opaque, stable pod identifier (the pod UID).
    pub pod_id: String,
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub priority: Priority,
    /// Runtime-scheme-stripped container identifiers (docker://, containerd://, cri-o://).
    pub container_ids: Vec<String>,
}

/// A resolved cgroup v2 directory for a pod, plus the per-container
/// subdirectories that also carry the relevant control file.
///
/// Never cached across ticks: re-resolved every time (see `cgroup::resolve_pod_cgroup`).
#[derive(Debug, Clone)]
pub struct CgroupHandle {
    pub pod_dir: PathBuf,
    pub container_dirs: Vec<PathBuf>,
}

impl CgroupHandle {
    /// All directories (pod + containers) that should receive a write.
    pub fn targets(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.pod_dir).chain(self.container_dirs.iter())
    }
}

/// A `major:minor` block device identifier, resolved once at startup
/// and cached for process lifetime (see `blockdev::BlockDeviceResolver`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// The (HP weight, LP weight) pair currently driving the kernel I/O
/// controller, as produced by the control law.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    pub hp_weight: u32,
    pub lp_weight: u32,
    /// The latency sample (ms) this setpoint was derived from.
    pub source_latency_ms: f64,
}

impl Setpoint {
    /// The setpoint reported before the first successful tick.
    pub fn initial() -> Self {
        Self {
            hp_weight: 500,
            lp_weight: 500,
            source_latency_ms: 0.0,
        }
    }

    /// Setpoints compare equal by weight only; the sample that produced
    /// them does not participate in the skip-if-unchanged tick rule.
    pub fn weights_eq(&self, other: &Setpoint) -> bool {
        self.hp_weight == other.hp_weight && self.lp_weight == other.lp_weight
    }
}

/// Back-end apply strategy. `weight` mode writes `io.weight`; `bandwidth`
/// mode writes `io.max` against a single resolved device.
#[derive(Debug, Clone, Copy)]
pub enum Policy {
    Weight,
    Bandwidth { device: DeviceId },
}
