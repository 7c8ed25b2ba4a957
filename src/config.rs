//! Sandbox configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Default size of the per-project writable data disk.
const DEFAULT_DATA_DISK_GB: u64 = 20;

/// Minimum guest memory when host memory cannot be determined.
const MIN_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

const GIB: u64 = 1024 * 1024 * 1024;

/// Configuration for the VM sandbox subsystem.
///
/// Loaded by the embedding server from its config file; every field has a
/// workable default except `image_ref` and `sandbox_image`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    /// Registry reference of the boot image carrying `vmlinuz` and
    /// `rootfs.squashfs`.
    pub image_ref: String,

    /// Explicit kernel path. When set together with `root_disk_path`, no
    /// download is scheduled.
    pub kernel_path: Option<PathBuf>,

    /// Explicit root disk path.
    pub root_disk_path: Option<PathBuf>,

    /// Directory holding the artifact cache and per-project data disks.
    pub data_dir: PathBuf,

    /// Directory holding per-project console logs.
    pub console_log_dir: PathBuf,

    /// Guest vCPU count. Defaults to all host cores.
    pub cpu_count: Option<usize>,

    /// Guest memory in MiB. Defaults to half of host physical memory
    /// rounded down to the nearest GiB, with an 8 GiB floor.
    pub memory_mb: Option<u64>,

    /// Size of the per-project writable data disk, in GiB.
    pub data_disk_gb: u64,

    /// Idle shutdown timeout for session-less VMs. Zero disables reaping.
    #[serde(deserialize_with = "duration_from_str")]
    pub idle_timeout: Duration,

    /// Host directory shared read-only into the guest (mounted under the
    /// `homedir` tag). `None` disables the share.
    pub host_homedir_share: Option<PathBuf>,

    /// Image run for session containers and the per-VM proxy container.
    /// A `sha256:`-prefixed content digest refers to a locally-built image
    /// that is exported from the host engine instead of pulled.
    pub sandbox_image: String,

    /// Socket of the host container engine, used only to export
    /// locally-built images into VMs.
    pub host_engine_socket: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image_ref: String::new(),
            kernel_path: None,
            root_disk_path: None,
            data_dir: PathBuf::from("data"),
            console_log_dir: PathBuf::from("logs"),
            cpu_count: None,
            memory_mb: None,
            data_disk_gb: DEFAULT_DATA_DISK_GB,
            idle_timeout: Duration::from_secs(30 * 60),
            host_homedir_share: None,
            sandbox_image: String::new(),
            host_engine_socket: PathBuf::from("/var/run/docker.sock"),
        }
    }
}

impl SandboxConfig {
    /// Both artifact paths when explicitly configured, bypassing download.
    pub fn explicit_artifacts(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.kernel_path, &self.root_disk_path) {
            (Some(k), Some(r)) => Some((k.clone(), r.clone())),
            _ => None,
        }
    }

    /// vCPU count for new VMs.
    pub fn resolved_cpu_count(&self) -> usize {
        self.cpu_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Guest memory in bytes for new VMs.
    pub fn resolved_memory_bytes(&self) -> u64 {
        if let Some(mb) = self.memory_mb {
            return mb * 1024 * 1024;
        }
        let total = host_physical_memory();
        let half_gib = (total / 2) / GIB;
        if half_gib == 0 {
            MIN_MEMORY_BYTES
        } else {
            (half_gib * GIB).max(MIN_MEMORY_BYTES)
        }
    }

    /// Data disk size in bytes.
    pub fn data_disk_bytes(&self) -> u64 {
        self.data_disk_gb * GIB
    }

    /// Per-project writable disk: `{data_dir}/project-{id}-data.img`.
    pub fn data_disk_path(&self, project_id: &str) -> PathBuf {
        self.data_dir.join(format!("project-{}-data.img", project_id))
    }

    /// Per-project console log: `{console_log_dir}/project-{id}/console.log`.
    pub fn console_log_path(&self, project_id: &str) -> PathBuf {
        self.console_log_dir
            .join(format!("project-{}", project_id))
            .join("console.log")
    }
}

/// Total physical memory of the host in bytes.
fn host_physical_memory() -> u64 {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    sys.total_memory()
}

/// Deserialize a duration from a humantime string ("90s", "5m", "0s").
fn duration_from_str<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}
