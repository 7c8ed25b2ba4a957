//! Session routing: `sessionID → projectID → VM → engine client`.
//!
//! The router owns no session state. Every operation re-resolves the
//! session through the injected resolver and dispatches to whatever VM the
//! resolved project currently has; if a later resolve maps the same
//! session to a different project, operations simply follow it there.

use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::SandboxConfig;
use crate::engine::{EngineClient, HostEngine, SessionHttpClient, SessionInfo};
use crate::error::{Error, Result};
use crate::sandbox::{CreateOptions, SessionEvent, SessionState};
use crate::vm::manager::ProjectVms;
use crate::{ExecOutput, ExecStream, PtySession};

/// Resolves a session id to its owning project id. Supplied by the caller;
/// the core never inspects session storage.
pub type SessionResolver =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Capacity of the session event fan-out. Delivery is best-effort; slow
/// subscribers drop events.
const EVENT_CAPACITY: usize = 64;

pub struct SessionRouter {
    resolver: SessionResolver,
    vms: Arc<dyn ProjectVms>,
    config: SandboxConfig,
    host_engine: OnceLock<HostEngine>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRouter {
    pub fn new(config: SandboxConfig, resolver: SessionResolver, vms: Arc<dyn ProjectVms>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resolver,
            vms,
            config,
            host_engine: OnceLock::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The lazily-created, single-initialised host engine client.
    pub fn host_engine(&self) -> &HostEngine {
        self.host_engine
            .get_or_init(|| HostEngine::new(&self.config.host_engine_socket))
    }

    fn emit(&self, session_id: &str, project_id: &str, state: SessionState) {
        let _ = self.events.send(SessionEvent {
            session_id: session_id.to_string(),
            project_id: project_id.to_string(),
            state,
        });
    }

    async fn resolve(&self, session_id: &str) -> Result<String> {
        (self.resolver)(session_id.to_string())
            .await
            .map_err(|e| Error::NotFound(format!("session {}: {}", session_id, e)))
    }

    /// Project and engine client for an existing session. A project
    /// without a VM (or without an engine client yet) is a not-found
    /// failure: only `create` boots VMs.
    async fn engine_for(&self, session_id: &str) -> Result<(String, Arc<EngineClient>)> {
        let project_id = self.resolve(session_id).await?;
        let vm = self
            .vms
            .get(&project_id)
            .ok_or_else(|| Error::NotFound(format!("no VM for project {}", project_id)))?;
        vm.mark_used();
        let engine = vm
            .engine_if_created()
            .await
            .ok_or_else(|| Error::NotFound(format!("no VM for project {}", project_id)))?;
        Ok((project_id, engine))
    }

    // -- operations ---------------------------------------------------------

    /// Create a session: acquire the project's VM (booting it and its
    /// engine client on demand), record the session reference, delegate.
    pub async fn create(&self, session_id: &str, opts: CreateOptions) -> Result<SessionInfo> {
        let project_id = self.resolve(session_id).await?;
        let vm = self.vms.get_or_create(&project_id, session_id).await?;

        let result = async {
            let engine = vm
                .engine_client(&self.config.sandbox_image, Some(self.host_engine()))
                .await?;
            let env_strings = opts.env_strings();
            engine
                .create_session(session_id, opts.cmd, env_strings)
                .await
        }
        .await;

        match result {
            Ok(info) => {
                debug!(session = %session_id, project = %project_id, "session created");
                self.emit(session_id, &project_id, SessionState::Created);
                Ok(info)
            }
            // The container already exists: an earlier create recorded the
            // reference; keep it.
            Err(e @ Error::AlreadyExists(_)) => Err(e),
            Err(e) => {
                // Nothing was created; return the reference we just took.
                self.vms.remove_session(&project_id, session_id);
                Err(e)
            }
        }
    }

    pub async fn start(&self, session_id: &str) -> Result<()> {
        let (project_id, engine) = self.engine_for(session_id).await?;
        engine.start_session(session_id).await?;
        self.emit(session_id, &project_id, SessionState::Running);
        Ok(())
    }

    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let (project_id, engine) = self.engine_for(session_id).await?;
        engine.stop_session(session_id).await?;
        self.emit(session_id, &project_id, SessionState::Stopped);
        Ok(())
    }

    /// Remove a session. Idempotent: unknown sessions (including ones the
    /// resolver no longer knows) succeed. The session reference is always
    /// returned to the VM manager.
    pub async fn remove(&self, session_id: &str, remove_volumes: bool) -> Result<()> {
        let project_id = match self.resolve(session_id).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        self.vms.remove_session(&project_id, session_id);

        if let Some(vm) = self.vms.get(&project_id) {
            if let Some(engine) = vm.engine_if_created().await {
                engine.remove_session(session_id, remove_volumes).await?;
            }
        }
        self.emit(session_id, &project_id, SessionState::Removed);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionInfo> {
        let (_, engine) = self.engine_for(session_id).await?;
        engine.get_session(session_id).await
    }

    /// Sessions across every project with a running VM.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for project_id in self.vms.list_project_ids() {
            let Some(vm) = self.vms.get(&project_id) else {
                continue;
            };
            let Some(engine) = vm.engine_if_created().await else {
                continue;
            };
            sessions.extend(engine.list_sessions().await?);
        }
        Ok(sessions)
    }

    pub async fn exec(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecOutput> {
        let (_, engine) = self.engine_for(session_id).await?;
        engine
            .exec(session_id, cmd, join_env(env))
            .await
    }

    pub async fn exec_stream(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecStream> {
        let (_, engine) = self.engine_for(session_id).await?;
        engine
            .exec_stream(session_id, cmd, join_env(env))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn attach(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
        user: Option<String>,
    ) -> Result<PtySession> {
        let (_, engine) = self.engine_for(session_id).await?;
        engine
            .attach(session_id, rows, cols, cmd, join_env(env), user)
            .await
    }

    pub async fn http_client(&self, session_id: &str) -> Result<SessionHttpClient> {
        let (_, engine) = self.engine_for(session_id).await?;
        engine.session_http_client(session_id).await
    }
}

fn join_env(env: Vec<(String, String)>) -> Vec<String> {
    env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::manager::UnavailableVms;

    fn fixed_resolver(project: &'static str) -> SessionResolver {
        Arc::new(move |_session| Box::pin(async move { Ok(project.to_string()) }))
    }

    fn failing_resolver() -> SessionResolver {
        Arc::new(|session| {
            Box::pin(async move { Err(Error::NotFound(format!("unknown session {}", session))) })
        })
    }

    fn router(resolver: SessionResolver) -> SessionRouter {
        SessionRouter::new(
            SandboxConfig::default(),
            resolver,
            Arc::new(UnavailableVms::new("test")),
        )
    }

    #[tokio::test]
    async fn operations_on_unresolved_sessions_are_not_found() {
        let router = router(failing_resolver());
        assert!(router.get("s1").await.unwrap_err().is_not_found());
        assert!(router.start("s1").await.unwrap_err().is_not_found());
        assert!(router
            .exec("s1", vec!["true".into()], vec![])
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn remove_unknown_session_is_idempotent() {
        let router = router(failing_resolver());
        router.remove("never-created", false).await.unwrap();
    }

    #[tokio::test]
    async fn ops_without_vm_are_not_found() {
        // Resolver knows the session, but no VM exists for the project.
        let router = router(fixed_resolver("p1"));
        let err = router.get("s1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("p1"));
    }

    #[tokio::test]
    async fn remove_with_resolved_project_but_no_vm_succeeds() {
        let router = router(fixed_resolver("p1"));
        router.remove("s1", true).await.unwrap();
    }

    #[test]
    fn env_join() {
        assert_eq!(
            join_env(vec![("A".into(), "1".into()), ("B".into(), "x=y".into())]),
            vec!["A=1".to_string(), "B=x=y".to_string()],
        );
    }
}
