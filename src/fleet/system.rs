//! Host resource counters for status reports

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// System-wide counters shared by every camera's status entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    /// Free space on the volume holding the recordings directory
    pub disk_free_gb: Option<f64>,
    pub memory_free_mb: u64,
    pub memory_total_mb: u64,
}

/// Take a fresh snapshot for `recordings_dir`
pub fn snapshot(recordings_dir: &Path) -> SystemSnapshot {
    let mut sys = System::new();
    sys.refresh_memory();

    SystemSnapshot {
        disk_free_gb: disk_free_gb(recordings_dir),
        memory_free_mb: sys.available_memory() / 1024 / 1024,
        memory_total_mb: sys.total_memory() / 1024 / 1024,
    }
}

/// Free space on the mount that contains `path`.
///
/// Picks the longest mount point that prefixes the path, so nested mounts
/// win over `/`.
fn disk_free_gb(path: &Path) -> Option<f64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() as f64 / BYTES_PER_GB)
}
