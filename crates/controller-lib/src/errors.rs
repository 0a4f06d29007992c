//! Classified error kinds shared between the control loop and the
//! telemetry surface's error counter.

use std::fmt;

/// Error kinds counted in `/metrics` and surfaced in `/status.last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PodDiscovery,
    PrometheusQuery,
    PrometheusParse,
    CgroupNotFound,
    NoTargets,
    PermissionDenied,
    IoWeightWrite,
    ControlLoop,
    Startup,
}

impl ErrorKind {
    /// Label value used on the Prometheus counter.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::PodDiscovery => "pod_discovery",
            ErrorKind::PrometheusQuery => "prometheus_query",
            ErrorKind::PrometheusParse => "prometheus_parse",
            ErrorKind::CgroupNotFound => "cgroup_not_found",
            ErrorKind::NoTargets => "no_targets",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::IoWeightWrite => "io_weight_write",
            ErrorKind::ControlLoop => "control_loop",
            ErrorKind::Startup => "startup",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Typed errors from the Cgroup Driver. Per-file failures inside
/// `apply_weight`/`apply_bandwidth_cap` are tallied rather than
/// propagated; this type is for resolution/whole-operation failures.
#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("no cgroup directory found for pod")]
    NotFound,
    #[error("cgroup handle carries no candidate directories to write")]
    NoTargets,
    #[error("permission denied writing control file")]
    PermissionDenied,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid weight value: {0}")]
    InvalidWeight(u32),
}

impl From<&CgroupError> for ErrorKind {
    fn from(e: &CgroupError) -> Self {
        match e {
            CgroupError::NotFound => ErrorKind::CgroupNotFound,
            CgroupError::NoTargets => ErrorKind::NoTargets,
            CgroupError::PermissionDenied => ErrorKind::PermissionDenied,
            CgroupError::Io(_) => ErrorKind::IoWeightWrite,
            CgroupError::InvalidWeight(_) => ErrorKind::IoWeightWrite,
        }
    }
}

/// Typed errors from the Block-Device Resolver.
#[derive(Debug, thiserror::Error)]
pub enum BlockDevError {
    #[error("mount path not found in mount table")]
    NotFound,
    #[error("resolved device node is not a block device")]
    NotABlockDevice,
    #[error("failed to parse mount table: {0}")]
    ParseError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
