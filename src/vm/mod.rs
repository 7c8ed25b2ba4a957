//! Per-project virtual machines.
//!
//! A [`ProjectVm`] owns the shared read-only boot artifacts, its private
//! writable data disk, a serial console sink, and a vsock device, and
//! tracks the set of sessions currently using it. The hypervisor itself is
//! behind the [`MachineBackend`] trait: macOS supplies the
//! Virtualization.framework implementation, tests supply fakes.

pub mod manager;

#[cfg(target_os = "macos")]
pub mod vz;

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::transport::{empty_body, vsock_dialer, EngineTransport};
use crate::engine::{EngineClient, HostEngine};
use crate::error::{Error, Result};
use crate::vsock::{VsockConnect, VsockDialer, ENGINE_PORT};

/// How long the in-VM engine gets to answer its first ping.
const READY_DEADLINE: Duration = Duration::from_secs(60);

/// Readiness poll cadence.
const READY_TICK: Duration = Duration::from_secs(1);

/// Grace window between requesting a guest stop and forcing it.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Longest console excerpt mirrored into host logs.
const CONSOLE_EXCERPT_CHARS: usize = 160;

/// Everything needed to configure and boot one guest.
#[derive(Debug, Clone)]
pub struct VmLaunchSpec {
    pub project_id: String,
    /// Uncompressed kernel, shared read-only across VMs.
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    /// Squashfs root, opened read-only and shared across VMs.
    pub root_disk: PathBuf,
    /// Per-project writable disk; created at `data_disk_bytes` on first
    /// use and never deleted implicitly.
    pub data_disk: PathBuf,
    pub data_disk_bytes: u64,
    pub memory_bytes: u64,
    pub cpu_count: usize,
    pub console_log: PathBuf,
    /// Host directory shared read-only into the guest under the `homedir`
    /// tag.
    pub homedir_share: Option<PathBuf>,
}

impl VmLaunchSpec {
    /// The guest kernel command line.
    pub fn kernel_cmdline(&self) -> String {
        let mut cmdline = "console=hvc0 root=/dev/vda rootfstype=squashfs ro".to_string();
        if let Some(ref homedir) = self.homedir_share {
            cmdline.push_str(&format!(" discobot.homedir={}", homedir.display()));
        }
        cmdline
    }
}

/// A booted (or bootable) guest machine.
#[async_trait::async_trait]
pub trait MachineBackend: Send + Sync {
    /// Boot the guest.
    async fn start(&self) -> Result<()>;

    /// Ask the guest OS to shut down. Errors when the guest does not
    /// support stop requests.
    async fn request_stop(&self) -> Result<()>;

    /// Resolve once the guest has powered off.
    async fn wait_stopped(&self) -> Result<()>;

    /// Tear the machine down immediately.
    async fn force_stop(&self) -> Result<()>;

    /// Connector for fresh vsock connections into this guest.
    fn connector(&self) -> Arc<dyn VsockConnect>;

    /// The guest console output stream. Yields `Some` exactly once.
    fn take_console(&self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Builds machines from launch specs. The manager is generic over this so
/// tests can substitute fakes for the hypervisor.
pub type MachineFactory = Arc<
    dyn Fn(VmLaunchSpec) -> Pin<Box<dyn Future<Output = Result<Arc<dyn MachineBackend>>> + Send>>
        + Send
        + Sync,
>;

struct VmState {
    sessions: HashSet<String>,
    last_used: Instant,
    warm: bool,
}

/// One project's VM.
pub struct ProjectVm {
    project_id: String,
    data_disk: PathBuf,
    created_at: Instant,
    machine: Arc<dyn MachineBackend>,
    /// Dropped on shutdown so outstanding dialers fail instead of keeping
    /// the machine reachable.
    connector: Mutex<Option<Arc<dyn VsockConnect>>>,
    state: Mutex<VmState>,
    console_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    engine: tokio::sync::RwLock<Option<Arc<EngineClient>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ProjectVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectVm")
            .field("project_id", &self.project_id)
            .field("data_disk", &self.data_disk)
            .field("created_at", &self.created_at)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProjectVm {
    /// Create the data disk if needed, boot the machine, and wait for the
    /// in-VM engine to answer. A VM that fails readiness is stopped and
    /// discarded; no half-booted state escapes.
    pub(crate) async fn boot(
        spec: VmLaunchSpec,
        factory: &MachineFactory,
        warm: bool,
    ) -> Result<Arc<Self>> {
        ensure_data_disk(&spec.data_disk, spec.data_disk_bytes).await?;
        if let Some(parent) = spec.console_log.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(
            project = %spec.project_id,
            memory_mb = spec.memory_bytes / (1024 * 1024),
            cpus = spec.cpu_count,
            warm,
            "booting project VM",
        );

        let machine = factory(spec.clone()).await?;
        machine
            .start()
            .await
            .map_err(|e| Error::Boot(format!("starting VM for {}: {}", spec.project_id, e)))?;

        let console = machine.take_console();
        let vm = Arc::new(Self {
            project_id: spec.project_id.clone(),
            data_disk: spec.data_disk.clone(),
            created_at: Instant::now(),
            connector: Mutex::new(Some(machine.connector())),
            machine,
            state: Mutex::new(VmState {
                sessions: HashSet::new(),
                last_used: Instant::now(),
                warm,
            }),
            console_task: Mutex::new(None),
            engine: tokio::sync::RwLock::new(None),
            shut_down: AtomicBool::new(false),
        });

        if let Some(reader) = console {
            vm.spawn_console_drain(reader, spec.console_log.clone());
        }

        match vm.wait_engine_ready().await {
            Ok(()) => Ok(vm),
            Err(e) => {
                vm.shutdown().await;
                Err(e)
            }
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn data_disk(&self) -> &Path {
        &self.data_disk
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // -- dialers ------------------------------------------------------------

    /// Dialer for the in-VM container engine socket.
    pub fn docker_dialer(&self) -> Result<VsockDialer> {
        self.port_dialer(ENGINE_PORT)
    }

    /// Dialer for an arbitrary guest vsock port.
    pub fn port_dialer(&self, port: u32) -> Result<VsockDialer> {
        let guard = self.connector.lock().unwrap();
        let connector = guard
            .as_ref()
            .ok_or_else(|| Error::Transport("VM is shut down".to_string()))?;
        Ok(VsockDialer::new(connector, port))
    }

    fn connector_weak(&self) -> Result<Weak<dyn VsockConnect>> {
        let guard = self.connector.lock().unwrap();
        let connector = guard
            .as_ref()
            .ok_or_else(|| Error::Transport("VM is shut down".to_string()))?;
        Ok(Arc::downgrade(connector))
    }

    // -- engine client ------------------------------------------------------

    /// The project's engine client, created on first use.
    ///
    /// Read-lock peek first, then write-lock double-check: concurrent
    /// callers serialise on the slot, and a creation failure caches
    /// nothing so the next call retries.
    pub async fn engine_client(
        &self,
        sandbox_image: &str,
        host_engine: Option<&HostEngine>,
    ) -> Result<Arc<EngineClient>> {
        if let Some(client) = self.engine.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }
        let mut slot = self.engine.write().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(
            EngineClient::connect(
                &self.project_id,
                self.docker_dialer()?,
                self.connector_weak()?,
                sandbox_image,
                host_engine,
            )
            .await?,
        );
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// The engine client if one has already been created.
    pub async fn engine_if_created(&self) -> Option<Arc<EngineClient>> {
        self.engine.read().await.as_ref().cloned()
    }

    // -- session bookkeeping ------------------------------------------------

    pub fn add_session(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session_id.to_string());
        state.last_used = Instant::now();
        // A warm VM stops being reap-exempt once it has hosted a session.
        state.warm = false;
    }

    pub fn remove_session(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(session_id);
        state.last_used = Instant::now();
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn is_warm(&self) -> bool {
        self.state.lock().unwrap().warm
    }

    pub fn mark_used(&self) {
        self.state.lock().unwrap().last_used = Instant::now();
    }

    /// Whether the idle reaper may shut this VM down.
    pub fn reapable(&self, idle_timeout: Duration) -> bool {
        if idle_timeout.is_zero() {
            return false;
        }
        let state = self.state.lock().unwrap();
        state.sessions.is_empty() && !state.warm && state.last_used.elapsed() >= idle_timeout
    }

    // -- lifecycle ----------------------------------------------------------

    async fn wait_engine_ready(&self) -> Result<()> {
        let transport = EngineTransport::new(vsock_dialer(self.docker_dialer()?));
        let deadline = Instant::now() + READY_DEADLINE;
        loop {
            match transport
                .request(Method::GET, "/_ping", empty_body(), None)
                .await
            {
                Ok(resp) => {
                    let _ = EngineTransport::collect_bytes(resp).await;
                    debug!(project = %self.project_id, "in-VM engine is ready");
                    return Ok(());
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Boot(format!(
                            "in-VM engine for {} not ready within {:?}: {}",
                            self.project_id, READY_DEADLINE, e
                        )));
                    }
                    tokio::time::sleep(READY_TICK).await;
                }
            }
        }
    }

    fn spawn_console_drain(
        self: &Arc<Self>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        log_path: PathBuf,
    ) {
        let project_id = self.project_id.clone();
        let handle = tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!(
                        project = %project_id,
                        path = %log_path.display(),
                        error = %e,
                        "cannot open console log",
                    );
                    return;
                }
            };

            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if file.write_all(&line).await.is_err() {
                            break;
                        }
                        let text = String::from_utf8_lossy(&line);
                        let excerpt: String =
                            text.trim_end().chars().take(CONSOLE_EXCERPT_CHARS).collect();
                        if !excerpt.is_empty() {
                            debug!(project = %project_id, console = %excerpt);
                        }
                    }
                }
            }
        });
        *self.console_task.lock().unwrap() = Some(handle);
    }

    /// Stop the VM: graceful request first, force after a grace window.
    /// Best-effort and idempotent; the data disk is preserved.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(project = %self.project_id, "shutting down project VM");

        match self.machine.request_stop().await {
            Ok(()) => {
                if tokio::time::timeout(STOP_GRACE, self.machine.wait_stopped())
                    .await
                    .is_err()
                {
                    warn!(project = %self.project_id, "graceful stop timed out");
                }
            }
            Err(e) => debug!(project = %self.project_id, error = %e, "graceful stop unavailable"),
        }
        if let Err(e) = self.machine.force_stop().await {
            debug!(project = %self.project_id, error = %e, "force stop: {}", e);
        }

        if let Some(task) = self.console_task.lock().unwrap().take() {
            task.abort();
        }
        *self.engine.write().await = None;
        self.connector.lock().unwrap().take();
    }
}

/// Create the writable data disk at its configured size on first use.
/// An existing disk is left untouched.
async fn ensure_data_disk(path: &Path, size_bytes: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(());
    }
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size_bytes).await?;
    debug!(path = %path.display(), size_bytes, "created data disk");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(homedir: Option<&str>) -> VmLaunchSpec {
        VmLaunchSpec {
            project_id: "p1".to_string(),
            kernel: PathBuf::from("/cache/vmlinuz"),
            initrd: None,
            root_disk: PathBuf::from("/cache/rootfs.squashfs"),
            data_disk: PathBuf::from("/data/project-p1-data.img"),
            data_disk_bytes: 1024,
            memory_bytes: 8 << 30,
            cpu_count: 4,
            console_log: PathBuf::from("/logs/project-p1/console.log"),
            homedir_share: homedir.map(PathBuf::from),
        }
    }

    #[test]
    fn cmdline_without_homedir() {
        assert_eq!(
            spec(None).kernel_cmdline(),
            "console=hvc0 root=/dev/vda rootfstype=squashfs ro"
        );
    }

    #[test]
    fn cmdline_with_homedir() {
        assert_eq!(
            spec(Some("/Users/me")).kernel_cmdline(),
            "console=hvc0 root=/dev/vda rootfstype=squashfs ro discobot.homedir=/Users/me"
        );
    }

    #[tokio::test]
    async fn data_disk_created_once_and_preserved() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("project-p1-data.img");

        ensure_data_disk(&path, 4096).await.unwrap();
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 4096);

        // Shrink it out-of-band; a second ensure must not resize or
        // recreate.
        tokio::fs::write(&path, b"user data").await.unwrap();
        ensure_data_disk(&path, 4096).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"user data");
    }
}
