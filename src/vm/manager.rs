//! VM manager: creates, caches, and reaps project VMs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::images::{AcquirePhase, BootImageAcquirer};
use crate::status::{SandboxState, SandboxStatus, StatusSink, VmConfigInfo};
use crate::vm::{MachineFactory, ProjectVm, VmLaunchSpec};

/// Idle reaper wake interval.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// The capability set the rest of the system expects from a VM manager.
///
/// The Virtualization-framework-backed [`VmManager`] is one implementation;
/// platforms without it supply [`UnavailableVms`], whose status reports
/// `not_available` and whose operations fail.
#[async_trait::async_trait]
pub trait ProjectVms: Send + Sync {
    /// Return the project's VM, booting one if none exists, and record the
    /// session reference. Blocks on artifact acquisition until ready.
    async fn get_or_create(&self, project_id: &str, session_id: &str) -> Result<Arc<ProjectVm>>;

    /// Pre-create a session-less VM, exempt from idle reaping until it
    /// hosts its first session.
    async fn warm(&self, project_id: &str) -> Result<Arc<ProjectVm>>;

    /// The project's VM, if one is running.
    fn get(&self, project_id: &str) -> Option<Arc<ProjectVm>>;

    /// Return a session reference. Unknown projects and sessions are
    /// ignored.
    fn remove_session(&self, project_id: &str, session_id: &str);

    /// Stop every VM and all background work. Best-effort.
    async fn shutdown(&self);

    /// Resolves once artifact acquisition reached a terminal state
    /// (success or permanent failure). Callers then consult [`Self::error`].
    async fn ready(&self);

    /// The terminal acquisition error, if any.
    fn error(&self) -> Option<String>;

    /// Composite status for the status endpoint.
    fn status(&self) -> SandboxStatus;

    /// Snapshot of projects with a running VM.
    fn list_project_ids(&self) -> Vec<String>;
}

enum ArtifactSource {
    /// Kernel and root disk paths configured explicitly; nothing to
    /// download.
    Explicit {
        kernel: std::path::PathBuf,
        root_disk: std::path::PathBuf,
    },
    Download(Arc<BootImageAcquirer>),
}

/// The VZ-backed manager. Generic over the machine factory so the
/// hypervisor can be faked out in tests.
pub struct VmManager {
    config: SandboxConfig,
    artifacts: ArtifactSource,
    factory: MachineFactory,
    /// The only map of project VMs; at most one entry per project.
    vms: Mutex<HashMap<String, Arc<ProjectVm>>>,
    /// Per-project boot gates so concurrent creates boot exactly one VM
    /// without holding the map mutex across the boot.
    boot_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ready_rx: watch::Receiver<bool>,
    error: Mutex<Option<String>>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VmManager {
    /// Construct the manager. Without explicit artifact paths, schedules
    /// the boot image download on a background task; `ready()` resolves
    /// when it finishes either way.
    pub fn new(
        config: SandboxConfig,
        factory: MachineFactory,
        sink: Option<Arc<dyn StatusSink>>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);

        let artifacts = match config.explicit_artifacts() {
            Some((kernel, root_disk)) => {
                let _ = ready_tx.send(true);
                ArtifactSource::Explicit { kernel, root_disk }
            }
            None => {
                let acquirer =
                    BootImageAcquirer::new(config.image_ref.clone(), config.data_dir.clone(), sink);
                acquirer.start();
                ArtifactSource::Download(acquirer)
            }
        };

        let manager = Arc::new(Self {
            config,
            artifacts,
            factory,
            vms: Mutex::new(HashMap::new()),
            boot_gates: Mutex::new(HashMap::new()),
            ready_rx,
            error: Mutex::new(None),
            reaper: Mutex::new(None),
        });

        if let ArtifactSource::Download(acquirer) = &manager.artifacts {
            let acquirer = Arc::clone(acquirer);
            let weak = Arc::downgrade(&manager);
            tokio::spawn(async move {
                let result = acquirer.wait().await;
                if let Some(manager) = weak.upgrade() {
                    if let Err(e) = result {
                        *manager.error.lock().unwrap() = Some(e.to_string());
                    }
                }
                // Resolve readiness either way so callers unblock.
                let _ = ready_tx.send(true);
            });
        }

        manager.spawn_reaper();
        manager
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.reap_idle().await;
            }
        });
        *self.reaper.lock().unwrap() = Some(handle);
    }

    /// One reaper pass: shut down and unmap every VM whose reaping
    /// conditions hold. The map entry is removed before shutdown starts.
    async fn reap_idle(&self) {
        let idle_timeout = self.config.idle_timeout;
        let candidates: Vec<Arc<ProjectVm>> = {
            let vms = self.vms.lock().unwrap();
            vms.values()
                .filter(|vm| vm.reapable(idle_timeout))
                .cloned()
                .collect()
        };

        for vm in candidates {
            // Re-check under the lock; a session may have arrived since.
            let removed = {
                let mut vms = self.vms.lock().unwrap();
                if vm.reapable(idle_timeout) {
                    vms.remove(vm.project_id())
                } else {
                    None
                }
            };
            if let Some(vm) = removed {
                info!(project = %vm.project_id(), "idle-reaping project VM");
                vm.shutdown().await;
            }
        }
    }

    async fn ensure_ready(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            rx.changed()
                .await
                .map_err(|_| Error::Invariant("readiness channel closed".to_string()))?;
        }
        if let Some(err) = self.error.lock().unwrap().clone() {
            return Err(Error::Download(err));
        }
        Ok(())
    }

    fn artifact_paths(&self) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
        match &self.artifacts {
            ArtifactSource::Explicit { kernel, root_disk } => {
                Ok((kernel.clone(), root_disk.clone()))
            }
            ArtifactSource::Download(acquirer) => acquirer
                .paths()
                .map(|p| (p.kernel, p.root_disk))
                .ok_or(Error::NotReady),
        }
    }

    fn launch_spec(&self, project_id: &str) -> Result<VmLaunchSpec> {
        let (kernel, root_disk) = self.artifact_paths()?;
        Ok(VmLaunchSpec {
            project_id: project_id.to_string(),
            kernel,
            initrd: None,
            root_disk,
            data_disk: self.config.data_disk_path(project_id),
            data_disk_bytes: self.config.data_disk_bytes(),
            memory_bytes: self.config.resolved_memory_bytes(),
            cpu_count: self.config.resolved_cpu_count(),
            console_log: self.config.console_log_path(project_id),
            homedir_share: self.config.host_homedir_share.clone(),
        })
    }

    fn boot_gate(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.boot_gates.lock().unwrap();
        Arc::clone(
            gates
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Shared create path. `session_id` is `None` for warm VMs.
    async fn acquire_vm(
        &self,
        project_id: &str,
        session_id: Option<&str>,
    ) -> Result<Arc<ProjectVm>> {
        self.ensure_ready().await?;

        if let Some(vm) = self.get(project_id) {
            if let Some(session) = session_id {
                vm.add_session(session);
            } else {
                vm.mark_used();
            }
            return Ok(vm);
        }

        let gate = self.boot_gate(project_id);
        let _guard = gate.lock().await;

        // Double-check: another caller may have finished booting while we
        // waited on the gate.
        if let Some(vm) = self.get(project_id) {
            if let Some(session) = session_id {
                vm.add_session(session);
            } else {
                vm.mark_used();
            }
            return Ok(vm);
        }

        let spec = self.launch_spec(project_id)?;
        let vm = ProjectVm::boot(spec, &self.factory, session_id.is_none()).await?;
        if let Some(session) = session_id {
            vm.add_session(session);
        }
        self.vms
            .lock()
            .unwrap()
            .insert(project_id.to_string(), Arc::clone(&vm));
        Ok(vm)
    }

    fn config_info(&self, kernel: &std::path::Path, root_disk: &std::path::Path) -> VmConfigInfo {
        VmConfigInfo {
            kernel_path: kernel.to_path_buf(),
            root_disk_path: root_disk.to_path_buf(),
            memory_mb: self.config.resolved_memory_bytes() / (1024 * 1024),
            cpu_count: self.config.resolved_cpu_count(),
            data_disk_gb: self.config.data_disk_gb,
        }
    }
}

#[async_trait::async_trait]
impl ProjectVms for VmManager {
    async fn get_or_create(&self, project_id: &str, session_id: &str) -> Result<Arc<ProjectVm>> {
        self.acquire_vm(project_id, Some(session_id)).await
    }

    async fn warm(&self, project_id: &str) -> Result<Arc<ProjectVm>> {
        self.acquire_vm(project_id, None).await
    }

    fn get(&self, project_id: &str) -> Option<Arc<ProjectVm>> {
        self.vms.lock().unwrap().get(project_id).cloned()
    }

    fn remove_session(&self, project_id: &str, session_id: &str) {
        if let Some(vm) = self.get(project_id) {
            vm.remove_session(session_id);
        }
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }
        if let ArtifactSource::Download(acquirer) = &self.artifacts {
            acquirer.abort();
        }
        let vms: Vec<Arc<ProjectVm>> = {
            let mut map = self.vms.lock().unwrap();
            map.drain().map(|(_, vm)| vm).collect()
        };
        for vm in vms {
            vm.shutdown().await;
        }
    }

    async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                warn!("readiness channel closed before resolving");
                return;
            }
        }
    }

    fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    fn status(&self) -> SandboxStatus {
        if let Some(err) = self.error() {
            return SandboxStatus::failed(err);
        }
        match &self.artifacts {
            ArtifactSource::Explicit { kernel, root_disk } => {
                SandboxStatus::ready(self.config_info(kernel, root_disk))
            }
            ArtifactSource::Download(acquirer) => {
                let snap = acquirer.snapshot();
                match snap.phase {
                    AcquirePhase::Pending => SandboxStatus {
                        available: false,
                        state: SandboxState::Initializing,
                        message: "scheduling boot image download".to_string(),
                        download: None,
                        config: None,
                    },
                    AcquirePhase::Downloading | AcquirePhase::Extracting => SandboxStatus {
                        available: false,
                        state: if snap.phase == AcquirePhase::Downloading {
                            SandboxState::Downloading
                        } else {
                            SandboxState::Extracting
                        },
                        message: "downloading boot image".to_string(),
                        download: snap.download_progress(),
                        config: None,
                    },
                    AcquirePhase::Ready => {
                        let paths = snap.paths.expect("ready snapshot carries paths");
                        SandboxStatus::ready(self.config_info(&paths.kernel, &paths.root_disk))
                    }
                    AcquirePhase::Failed => SandboxStatus::failed(
                        snap.error
                            .unwrap_or_else(|| "boot image download failed".to_string()),
                    ),
                }
            }
        }
    }

    fn list_project_ids(&self) -> Vec<String> {
        self.vms.lock().unwrap().keys().cloned().collect()
    }
}

/// Stub manager for platforms without a supported hypervisor.
pub struct UnavailableVms {
    reason: String,
}

impl UnavailableVms {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(Error::Engine(format!(
            "VM sandbox not available: {}",
            self.reason
        )))
    }
}

#[async_trait::async_trait]
impl ProjectVms for UnavailableVms {
    async fn get_or_create(&self, _project_id: &str, _session_id: &str) -> Result<Arc<ProjectVm>> {
        self.fail()
    }

    async fn warm(&self, _project_id: &str) -> Result<Arc<ProjectVm>> {
        self.fail()
    }

    fn get(&self, _project_id: &str) -> Option<Arc<ProjectVm>> {
        None
    }

    fn remove_session(&self, _project_id: &str, _session_id: &str) {}

    async fn shutdown(&self) {}

    async fn ready(&self) {}

    fn error(&self) -> Option<String> {
        Some(self.reason.clone())
    }

    fn status(&self) -> SandboxStatus {
        SandboxStatus::not_available(self.reason.clone())
    }

    fn list_project_ids(&self) -> Vec<String> {
        Vec::new()
    }
}
