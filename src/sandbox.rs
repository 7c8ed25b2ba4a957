//! The uniform sandbox interface consumed by the outer HTTP server.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::SandboxConfig;
use crate::engine::api::ImageInspect;
use crate::engine::{SessionHttpClient, SessionInfo};
use crate::error::{Error, Result};
use crate::router::{SessionRouter, SessionResolver};
use crate::status::{SandboxState, SandboxStatus, StatusSink};
use crate::vm::manager::{ProjectVms, UnavailableVms, VmManager};
use crate::{ExecOutput, ExecStream, PtySession};

/// Options for creating a session container.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Command override; the image default runs otherwise.
    pub cmd: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
}

impl CreateOptions {
    pub(crate) fn env_strings(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Session lifecycle states broadcast to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Stopped,
    Removed,
}

/// One state transition of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub project_id: String,
    pub state: SessionState,
}

/// Everything the embedding server needs from the sandbox subsystem.
#[async_trait::async_trait]
pub trait Sandbox: Send + Sync {
    /// Whether the image is present in the host engine's store.
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Host-side image metadata.
    async fn image(&self, reference: &str) -> Result<ImageInspect>;

    async fn create(&self, session_id: &str, opts: CreateOptions) -> Result<SessionInfo>;
    async fn start(&self, session_id: &str) -> Result<()>;
    async fn stop(&self, session_id: &str) -> Result<()>;
    async fn remove(&self, session_id: &str, remove_volumes: bool) -> Result<()>;
    async fn get(&self, session_id: &str) -> Result<SessionInfo>;
    async fn list(&self) -> Result<Vec<SessionInfo>>;

    async fn exec(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecOutput>;

    /// Interactive PTY exec.
    async fn attach(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
        user: Option<String>,
    ) -> Result<PtySession>;

    /// Streamed exec without a TTY.
    async fn exec_stream(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecStream>;

    /// HTTP client reaching the session's published port over vsock.
    async fn http_client(&self, session_id: &str) -> Result<SessionHttpClient>;

    /// Best-effort session event fan-out; slow subscribers drop events.
    fn watch(&self) -> broadcast::Receiver<SessionEvent>;

    fn status(&self) -> SandboxStatus;

    fn is_ready(&self) -> bool;

    /// Wait for artifact acquisition to finish, failing if it failed.
    async fn wait_for_ready(&self) -> Result<()>;

    /// Pre-boot a VM for the project before any session exists.
    async fn warm_vm(&self, project_id: &str) -> Result<()>;

    /// Stop everything. Best-effort; only logs.
    async fn close(&self);
}

/// The VM-backed sandbox: a session router over a VM manager.
pub struct VmSandbox {
    vms: Arc<dyn ProjectVms>,
    router: SessionRouter,
}

impl VmSandbox {
    /// Assemble from parts. `vms` is the platform manager: the VZ-backed
    /// [`VmManager`] on macOS, [`UnavailableVms`] elsewhere.
    pub fn new(config: SandboxConfig, resolver: SessionResolver, vms: Arc<dyn ProjectVms>) -> Self {
        let router = SessionRouter::new(config, resolver, Arc::clone(&vms));
        Self { vms, router }
    }

    /// The platform-default sandbox for this host.
    #[cfg(target_os = "macos")]
    pub fn for_host(
        config: SandboxConfig,
        resolver: SessionResolver,
        sink: Option<Arc<dyn StatusSink>>,
    ) -> Self {
        use crate::vm::vz;
        let vms: Arc<dyn ProjectVms> = if vz::virtualization_supported() {
            VmManager::new(config.clone(), vz::vz_machine_factory(), sink)
        } else {
            Arc::new(UnavailableVms::new(
                "Virtualization.framework is not supported on this host",
            ))
        };
        Self::new(config, resolver, vms)
    }

    /// The platform-default sandbox for this host.
    #[cfg(not(target_os = "macos"))]
    pub fn for_host(
        config: SandboxConfig,
        resolver: SessionResolver,
        _sink: Option<Arc<dyn StatusSink>>,
    ) -> Self {
        let vms: Arc<dyn ProjectVms> = Arc::new(UnavailableVms::new(
            "VM sandboxes require macOS Virtualization.framework",
        ));
        Self::new(config, resolver, vms)
    }
}

#[async_trait::async_trait]
impl Sandbox for VmSandbox {
    async fn image_exists(&self, reference: &str) -> Result<bool> {
        self.router.host_engine().image_exists(reference).await
    }

    async fn image(&self, reference: &str) -> Result<ImageInspect> {
        self.router.host_engine().image_inspect(reference).await
    }

    async fn create(&self, session_id: &str, opts: CreateOptions) -> Result<SessionInfo> {
        self.router.create(session_id, opts).await
    }

    async fn start(&self, session_id: &str) -> Result<()> {
        self.router.start(session_id).await
    }

    async fn stop(&self, session_id: &str) -> Result<()> {
        self.router.stop(session_id).await
    }

    async fn remove(&self, session_id: &str, remove_volumes: bool) -> Result<()> {
        self.router.remove(session_id, remove_volumes).await
    }

    async fn get(&self, session_id: &str) -> Result<SessionInfo> {
        self.router.get(session_id).await
    }

    async fn list(&self) -> Result<Vec<SessionInfo>> {
        self.router.list().await
    }

    async fn exec(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecOutput> {
        self.router.exec(session_id, cmd, env).await
    }

    async fn attach(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
        user: Option<String>,
    ) -> Result<PtySession> {
        self.router
            .attach(session_id, rows, cols, cmd, env, user)
            .await
    }

    async fn exec_stream(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecStream> {
        self.router.exec_stream(session_id, cmd, env).await
    }

    async fn http_client(&self, session_id: &str) -> Result<SessionHttpClient> {
        self.router.http_client(session_id).await
    }

    fn watch(&self) -> broadcast::Receiver<SessionEvent> {
        self.router.subscribe()
    }

    fn status(&self) -> SandboxStatus {
        self.vms.status()
    }

    fn is_ready(&self) -> bool {
        self.vms.status().state == SandboxState::Ready
    }

    async fn wait_for_ready(&self) -> Result<()> {
        self.vms.ready().await;
        match self.vms.error() {
            Some(err) => Err(Error::Download(err)),
            None => Ok(()),
        }
    }

    async fn warm_vm(&self, project_id: &str) -> Result<()> {
        self.vms.warm(project_id).await.map(|_| ())
    }

    async fn close(&self) {
        self.vms.shutdown().await;
    }
}
