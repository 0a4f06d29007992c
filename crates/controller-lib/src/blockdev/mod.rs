//! Block-Device Resolver: maps a host mount path to a `major:minor` pair.
//!
//! Grounded on `drc_io_agent/cgroup_utils.py::discover_block_device`: parse
//! `/proc/self/mountinfo`, match the mount point, and either take the
//! `major:minor` field directly or resolve a device-node path via `stat`,
//! falling back to `/proc/partitions` by basename.

use crate::errors::BlockDevError;
use crate::types::DeviceId;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::RwLock;

/// How long a negative resolution result is cached before being retried.
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct BlockDeviceResolver {
    mountinfo_path: std::path::PathBuf,
    partitions_path: std::path::PathBuf,
    dev_root: std::path::PathBuf,
    negative_cache: RwLock<Option<(Instant, BlockDevErrorKind)>>,
}

/// Cheaply cloneable mirror of `BlockDevError` for the negative cache (the
/// underlying `thiserror` variant carries an `io::Error` in one arm that
/// isn't `Clone`, so the cache stores the classification, not the error).
#[derive(Debug, Clone, Copy)]
enum BlockDevErrorKind {
    NotFound,
    NotABlockDevice,
    ParseError,
    Io,
}

impl From<BlockDevErrorKind> for BlockDevError {
    fn from(kind: BlockDevErrorKind) -> Self {
        match kind {
            BlockDevErrorKind::NotFound => BlockDevError::NotFound,
            BlockDevErrorKind::NotABlockDevice => BlockDevError::NotABlockDevice,
            BlockDevErrorKind::ParseError => BlockDevError::ParseError("cached failure".into()),
            BlockDevErrorKind::Io => {
                BlockDevError::Io(std::io::Error::other("cached failure"))
            }
        }
    }
}

impl From<&BlockDevError> for BlockDevErrorKind {
    fn from(e: &BlockDevError) -> Self {
        match e {
            BlockDevError::NotFound => BlockDevErrorKind::NotFound,
            BlockDevError::NotABlockDevice => BlockDevErrorKind::NotABlockDevice,
            BlockDevError::ParseError(_) => BlockDevErrorKind::ParseError,
            BlockDevError::Io(_) => BlockDevErrorKind::Io,
        }
    }
}

impl BlockDeviceResolver {
    pub fn new() -> Self {
        Self {
            mountinfo_path: "/proc/self/mountinfo".into(),
            partitions_path: "/proc/partitions".into(),
            dev_root: "/dev".into(),
            negative_cache: RwLock::new(None),
        }
    }

    /// Construct with custom paths, for tests.
    pub fn with_paths(
        mountinfo_path: impl Into<std::path::PathBuf>,
        partitions_path: impl Into<std::path::PathBuf>,
        dev_root: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            mountinfo_path: mountinfo_path.into(),
            partitions_path: partitions_path.into(),
            dev_root: dev_root.into(),
            negative_cache: RwLock::new(None),
        }
    }

    /// Resolve `mount_path` to a `major:minor` device id.
    pub async fn resolve(&self, mount_path: &str) -> Result<DeviceId, BlockDevError> {
        if let Some((at, kind)) = *self.negative_cache.read().await {
            if at.elapsed() < NEGATIVE_CACHE_TTL {
                return Err(kind.into());
            }
        }

        let result = self.resolve_uncached(mount_path).await;
        if let Err(ref e) = result {
            *self.negative_cache.write().await = Some((Instant::now(), e.into()));
        }
        result
    }

    async fn resolve_uncached(&self, mount_path: &str) -> Result<DeviceId, BlockDevError> {
        let content = fs::read_to_string(&self.mountinfo_path).await?;

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 {
                continue;
            }
            // mountinfo: <id> <parent> <major:minor> <root> <mount_point> ...
            let device_field = parts[2];
            let mount_point = parts[4];
            if mount_point != mount_path {
                continue;
            }

            if let Some(id) = parse_major_minor(device_field) {
                return Ok(id);
            }

            if let Some(id) = self.resolve_device_node(device_field).await {
                return Ok(id);
            }

            if let Some(id) = self.resolve_via_partitions(device_field).await? {
                return Ok(id);
            }

            return Err(BlockDevError::NotABlockDevice);
        }

        Err(BlockDevError::NotFound)
    }

    async fn resolve_device_node(&self, device_field: &str) -> Option<DeviceId> {
        let candidates: Vec<std::path::PathBuf> = if device_field.starts_with('/') {
            vec![device_field.into()]
        } else {
            vec![
                self.dev_root.join(device_field),
                self.dev_root.join("disk/by-id").join(device_field),
            ]
        };

        for candidate in candidates {
            if let Ok(metadata) = fs::metadata(&candidate).await {
                if metadata.file_type().is_block_device() {
                    let rdev = metadata.rdev();
                    return Some(DeviceId::new(major(rdev), minor(rdev)));
                }
            }
        }
        None
    }

    async fn resolve_via_partitions(
        &self,
        device_field: &str,
    ) -> Result<Option<DeviceId>, BlockDevError> {
        let basename = Path::new(device_field)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| device_field.to_string());

        let content = match fs::read_to_string(&self.partitions_path).await {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };

        for line in content.lines().skip(2) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                continue;
            }
            if parts[3] == basename {
                let major = parts[0]
                    .parse::<u32>()
                    .map_err(|_| BlockDevError::ParseError(line.to_string()))?;
                let minor = parts[1]
                    .parse::<u32>()
                    .map_err(|_| BlockDevError::ParseError(line.to_string()))?;
                return Ok(Some(DeviceId::new(major, minor)));
            }
        }
        Ok(None)
    }
}

impl Default for BlockDeviceResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_major_minor(field: &str) -> Option<DeviceId> {
    let (maj, min) = field.split_once(':')?;
    if maj.chars().all(|c| c.is_ascii_digit()) && min.chars().all(|c| c.is_ascii_digit()) {
        Some(DeviceId::new(maj.parse().ok()?, min.parse().ok()?))
    } else {
        None
    }
}

/// `major(3)`/`minor(3)` equivalents for the packed `dev_t` glibc returns
/// from `stat`, matching the encoding `os.major`/`os.minor` use in Python.
fn major(rdev: u64) -> u32 {
    (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)) as u32
}

fn minor(rdev: u64) -> u32 {
    ((rdev & 0xff) | ((rdev >> 12) & !0xff)) as u32
}
