//! Client to the container engine running inside a Project VM.
//!
//! One [`EngineClient`] exists per project, built over the VM's vsock
//! dialer. Construction makes the configured sandbox image reachable inside
//! the VM (pulling it, or streaming a locally-built image over from the
//! host engine) and brings up the proxy container that bridges published
//! session ports onto vsock ports. Session operations are thin wrappers
//! over the Engine HTTP API.

pub mod api;
pub mod transport;

use std::path::Path;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::vsock::{VsockConnect, VsockDialer};
use crate::ExecOutput;
use api::{
    ContainerCreateRequest, ContainerInspect, ContainerSummary, CreatedResponse,
    ExecCreateRequest, ExecInspect, ExecStartRequest, HostConfig, ImageInspect, RestartPolicy,
    StdioChunk,
};
use transport::{
    body_reader, empty_body, full_body, reader_body, unix_dialer, vsock_dialer, EngineTransport,
    Outgoing,
};

/// Label carrying the owning project id on every created resource.
pub const PROJECT_LABEL: &str = "discobot.project";

/// Label carrying the session id on session containers.
pub const SESSION_LABEL: &str = "discobot.session";

/// Entry point of the proxy binary baked into the sandbox image.
const PROXY_COMMAND: &str = "/usr/local/bin/discobot-proxy";

/// Transfer-log granularity for image loads.
const LOAD_LOG_STEP: u64 = 100 * 1024 * 1024;

/// Interval for polling an exec's exit status.
const EXEC_WAIT_TICK: Duration = Duration::from_millis(100);

/// A session container as seen by API callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub project_id: String,
    pub container_id: String,
    pub state: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_port: Option<u16>,
}

/// Per-project client to the in-VM container engine.
pub struct EngineClient {
    project_id: String,
    sandbox_image: String,
    transport: EngineTransport,
    connector: Weak<dyn VsockConnect>,
}

impl EngineClient {
    /// Build a client and make the project's VM able to run sessions:
    /// the sandbox image is loaded or pulled, and the proxy container is
    /// brought up. Any failure leaves nothing cached; the next call
    /// retries from scratch.
    pub async fn connect(
        project_id: &str,
        docker_dialer: VsockDialer,
        connector: Weak<dyn VsockConnect>,
        sandbox_image: &str,
        host_engine: Option<&HostEngine>,
    ) -> Result<Self> {
        let client = Self {
            project_id: project_id.to_string(),
            sandbox_image: sandbox_image.to_string(),
            transport: EngineTransport::new(vsock_dialer(docker_dialer)),
            connector,
        };
        client.ensure_sandbox_image(host_engine).await?;
        client.ensure_proxy().await?;
        Ok(client)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Liveness probe of the in-VM engine.
    pub async fn ping(&self) -> Result<()> {
        let resp = self
            .transport
            .request(Method::GET, "/_ping", empty_body(), None)
            .await?;
        let _ = EngineTransport::collect_bytes(resp).await?;
        Ok(())
    }

    // -- images -------------------------------------------------------------

    pub async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self
            .transport
            .get_json::<ImageInspect>(&format!("/images/{}/json", reference))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pull a registry image from inside the VM.
    async fn pull_image(&self, reference: &str) -> Result<()> {
        info!(image = %reference, project = %self.project_id, "pulling image in VM");
        let resp = self
            .transport
            .request(
                Method::POST,
                &format!("/images/create?fromImage={}", reference),
                empty_body(),
                None,
            )
            .await?;
        // The body is a progress stream; the pull completes when it ends.
        let _ = EngineTransport::collect_bytes(resp).await?;
        Ok(())
    }

    /// Stream an image tarball into the VM's engine.
    async fn load_image(&self, tar: impl AsyncRead + Send + Unpin + 'static) -> Result<()> {
        let reader = TransferLogReader::new(tar, "image load");
        let resp = self
            .transport
            .request(
                Method::POST,
                "/images/load?quiet=1",
                reader_body(reader),
                Some("application/x-tar"),
            )
            .await?;
        let _ = EngineTransport::collect_bytes(resp).await?;
        Ok(())
    }

    /// Make the configured sandbox image available inside the VM.
    ///
    /// A `sha256:` content digest names a locally-built image that no
    /// registry serves; it is exported from the host engine and streamed
    /// through the VM engine's load endpoint instead.
    async fn ensure_sandbox_image(&self, host_engine: Option<&HostEngine>) -> Result<()> {
        if self.image_exists(&self.sandbox_image).await? {
            debug!(image = %self.sandbox_image, "sandbox image already present in VM");
            return Ok(());
        }

        if self.sandbox_image.starts_with("sha256:") {
            let host = host_engine.ok_or_else(|| {
                Error::Engine(format!(
                    "sandbox image {} is a local build but no host engine is configured",
                    self.sandbox_image
                ))
            })?;
            info!(
                image = %self.sandbox_image,
                project = %self.project_id,
                "exporting local image into VM",
            );
            let tar = host.export_image(&self.sandbox_image).await?;
            self.load_image(tar).await
        } else {
            self.pull_image(&self.sandbox_image).await
        }
    }

    // -- proxy container ----------------------------------------------------

    fn proxy_name(&self) -> String {
        let short: String = self.project_id.chars().take(8).collect();
        format!("discobot-proxy-{}", short)
    }

    /// Bring up (or repair) the per-VM proxy container.
    ///
    /// The proxy watches for session containers that publish TCP ports and
    /// opens one socat vsock listener per published port, so the host can
    /// reach any session port by dialing the same-numbered vsock port. The
    /// engine allocates published ports from its ephemeral range, making
    /// them unique within the VM; a duplicate publish replaces the
    /// listener. It needs host network and IPC plus privileged mode for
    /// vsock device access, and the engine socket bind-mounted to observe
    /// container events.
    async fn ensure_proxy(&self) -> Result<()> {
        let name = self.proxy_name();

        match self.inspect_container(&name).await {
            Ok(existing) => {
                let image_matches = existing.config.image == self.sandbox_image;
                if image_matches && existing.host_config.privileged {
                    if !existing.state.running {
                        self.start_container(&existing.id).await?;
                    }
                    return Ok(());
                }
                info!(
                    proxy = %name,
                    image = %existing.config.image,
                    privileged = existing.host_config.privileged,
                    "proxy container drifted from configuration; recreating",
                );
                self.remove_container(&existing.id, true, false).await?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let request = ContainerCreateRequest {
            image: self.sandbox_image.clone(),
            cmd: Some(vec![PROXY_COMMAND.to_string()]),
            env: None,
            labels: [(PROJECT_LABEL.to_string(), self.project_id.clone())].into(),
            host_config: HostConfig {
                binds: Some(vec![
                    "/var/run/docker.sock:/var/run/docker.sock".to_string()
                ]),
                privileged: true,
                network_mode: Some("host".to_string()),
                ipc_mode: Some("host".to_string()),
                publish_all_ports: false,
                restart_policy: Some(RestartPolicy::always()),
            },
        };
        let created = self.create_container(&name, &request).await?;
        self.start_container(&created.id).await?;
        info!(proxy = %name, project = %self.project_id, "proxy container started");
        Ok(())
    }

    // -- containers ---------------------------------------------------------

    async fn create_container(
        &self,
        name: &str,
        request: &ContainerCreateRequest,
    ) -> Result<CreatedResponse> {
        self.transport
            .post_json(&format!("/containers/create?name={}", name), request)
            .await
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerInspect> {
        self.transport
            .get_json(&format!("/containers/{}/json", id_or_name))
            .await
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.transport
            .post_unit(&format!("/containers/{}/start", id))
            .await
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.transport
            .post_unit(&format!("/containers/{}/stop", id))
            .await
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<()> {
        self.transport
            .delete(&format!(
                "/containers/{}?force={}&v={}",
                id, force, volumes
            ))
            .await
    }

    // -- sessions -----------------------------------------------------------

    fn session_info(&self, session_id: &str, inspect: &ContainerInspect) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            project_id: self.project_id.clone(),
            container_id: inspect.id.clone(),
            state: inspect.state.status.clone(),
            running: inspect.state.running,
            published_port: inspect.network_settings.first_tcp_host_port(),
        }
    }

    /// Create a session container. The container is named after the
    /// session and publishes all of its exposed ports so the proxy can
    /// bridge them onto vsock.
    pub async fn create_session(
        &self,
        session_id: &str,
        cmd: Option<Vec<String>>,
        env: Vec<String>,
    ) -> Result<SessionInfo> {
        let request = ContainerCreateRequest {
            image: self.sandbox_image.clone(),
            cmd,
            env: if env.is_empty() { None } else { Some(env) },
            labels: [
                (PROJECT_LABEL.to_string(), self.project_id.clone()),
                (SESSION_LABEL.to_string(), session_id.to_string()),
            ]
            .into(),
            host_config: HostConfig {
                publish_all_ports: true,
                ..Default::default()
            },
        };
        let created = self.create_container(session_id, &request).await?;
        debug!(session = %session_id, container = %created.id, "session container created");
        let inspect = self.inspect_container(&created.id).await?;
        Ok(self.session_info(session_id, &inspect))
    }

    pub async fn start_session(&self, session_id: &str) -> Result<()> {
        self.start_container(session_id).await
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        self.stop_container(session_id).await
    }

    /// Remove a session container. Unknown sessions succeed: removal is
    /// idempotent.
    pub async fn remove_session(&self, session_id: &str, remove_volumes: bool) -> Result<()> {
        match self.remove_container(session_id, true, remove_volumes).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionInfo> {
        let inspect = self.inspect_container(session_id).await?;
        Ok(self.session_info(session_id, &inspect))
    }

    /// All session containers of this project, including stopped ones.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let filter = api::label_filter(PROJECT_LABEL, &self.project_id);
        let summaries: Vec<ContainerSummary> = self
            .transport
            .get_json(&format!("/containers/json?all=true&filters={}", filter))
            .await?;
        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let session_id = s.labels.get(SESSION_LABEL)?.clone();
                Some(SessionInfo {
                    session_id,
                    project_id: self.project_id.clone(),
                    container_id: s.id,
                    state: s.state,
                    running: s.status.starts_with("Up"),
                    published_port: None,
                })
            })
            .collect())
    }

    // -- exec ---------------------------------------------------------------

    async fn exec_create(&self, session_id: &str, request: &ExecCreateRequest) -> Result<String> {
        let created: CreatedResponse = self
            .transport
            .post_json(&format!("/containers/{}/exec", session_id), request)
            .await?;
        Ok(created.id)
    }

    async fn exec_start(
        &self,
        exec_id: &str,
        tty: bool,
    ) -> Result<TokioIo<hyper::upgrade::Upgraded>> {
        let body = serde_json::to_vec(&ExecStartRequest { detach: false, tty })?;
        self.transport
            .upgrade(
                Method::POST,
                &format!("/exec/{}/start", exec_id),
                full_body(body),
            )
            .await
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect> {
        self.transport
            .get_json(&format!("/exec/{}/json", exec_id))
            .await
    }

    async fn exec_wait(&self, exec_id: &str) -> Result<i64> {
        loop {
            let inspect = self.exec_inspect(exec_id).await?;
            if !inspect.running {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(EXEC_WAIT_TICK).await;
        }
    }

    /// Run a command to completion, buffering its output.
    pub async fn exec(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput> {
        let exec_id = self
            .exec_create(
                session_id,
                &ExecCreateRequest {
                    attach_stdout: true,
                    attach_stderr: true,
                    cmd,
                    env: if env.is_empty() { None } else { Some(env) },
                    ..Default::default()
                },
            )
            .await?;

        let io = self.exec_start(&exec_id, false).await?;
        let (mut reader, _writer) = tokio::io::split(io);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = api::read_stdio_frame(&mut reader).await? {
            match chunk {
                StdioChunk::Stdout(b) => stdout.extend_from_slice(&b),
                StdioChunk::Stderr(b) => stderr.extend_from_slice(&b),
            }
        }

        let exit_code = self.exec_wait(&exec_id).await?;
        Ok(ExecOutput::new(stdout, stderr, exit_code as i32))
    }

    /// Run a command with streamed stdio and no TTY.
    pub async fn exec_stream(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecStream> {
        let exec_id = self
            .exec_create(
                session_id,
                &ExecCreateRequest {
                    attach_stdin: true,
                    attach_stdout: true,
                    attach_stderr: true,
                    cmd,
                    env: if env.is_empty() { None } else { Some(env) },
                    ..Default::default()
                },
            )
            .await?;

        let io = self.exec_start(&exec_id, false).await?;
        let (reader, writer) = tokio::io::split(io);
        Ok(ExecStream {
            exec_id,
            transport: self.transport.clone(),
            reader,
            writer,
        })
    }

    /// Run a command under a PTY (interactive terminal).
    pub async fn attach(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
        cmd: Vec<String>,
        env: Vec<String>,
        user: Option<String>,
    ) -> Result<PtySession> {
        let exec_id = self
            .exec_create(
                session_id,
                &ExecCreateRequest {
                    attach_stdin: true,
                    attach_stdout: true,
                    attach_stderr: true,
                    tty: true,
                    cmd,
                    env: if env.is_empty() { None } else { Some(env) },
                    user,
                },
            )
            .await?;

        let io = self.exec_start(&exec_id, true).await?;
        let transport = self.transport.clone();
        transport
            .post_unit(&format!("/exec/{}/resize?h={}&w={}", exec_id, rows, cols))
            .await?;
        Ok(PtySession {
            exec_id,
            transport,
            io,
        })
    }

    // -- session HTTP -------------------------------------------------------

    /// HTTP client whose dialer targets the session's published port over
    /// vsock. The guest's own loopback is unreachable from the host, so
    /// `http://localhost/…` requests ride the proxy's vsock listener
    /// instead.
    pub async fn session_http_client(&self, session_id: &str) -> Result<SessionHttpClient> {
        let inspect = self.inspect_container(session_id).await?;
        let port = inspect
            .network_settings
            .first_tcp_host_port()
            .ok_or_else(|| {
                Error::Engine(format!("session {} has no published port", session_id))
            })?;
        let dialer = VsockDialer::from_weak(self.connector.clone(), u32::from(port));
        Ok(SessionHttpClient {
            transport: EngineTransport::new(vsock_dialer(dialer)),
        })
    }
}

// ---------------------------------------------------------------------------
// Exec streams
// ---------------------------------------------------------------------------

type HijackIo = TokioIo<hyper::upgrade::Upgraded>;

/// A no-TTY exec with streamed stdio.
///
/// Output arrives as demultiplexed stdout/stderr chunks. Closing stdin is
/// the vsock logical half-close: the guest sees end-of-input through the
/// exec protocol's framing while output keeps flowing.
pub struct ExecStream {
    exec_id: String,
    transport: EngineTransport,
    reader: ReadHalf<HijackIo>,
    writer: WriteHalf<HijackIo>,
}

impl ExecStream {
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| Error::Transport(format!("writing stdin: {}", e)))
    }

    /// Signal stdin EOF. The read side stays open.
    pub async fn close_stdin(&mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| Error::Transport(format!("closing stdin: {}", e)))
    }

    /// Next output chunk, or `None` once the command's streams close.
    pub async fn next_chunk(&mut self) -> Result<Option<StdioChunk>> {
        api::read_stdio_frame(&mut self.reader).await
    }

    /// Wait for the command to finish and return its exit code.
    pub async fn wait(&self) -> Result<i64> {
        loop {
            let inspect: ExecInspect = self
                .transport
                .get_json(&format!("/exec/{}/json", self.exec_id))
                .await?;
            if !inspect.running {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(EXEC_WAIT_TICK).await;
        }
    }
}

/// A TTY exec: one raw bidirectional byte stream plus resize control.
pub struct PtySession {
    exec_id: String,
    transport: EngineTransport,
    io: HijackIo,
}

impl PtySession {
    /// Resize the guest terminal.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.transport
            .post_unit(&format!(
                "/exec/{}/resize?h={}&w={}",
                self.exec_id, rows, cols
            ))
            .await
    }

    /// Wait for the command to finish and return its exit code.
    pub async fn wait(&self) -> Result<i64> {
        loop {
            let inspect: ExecInspect = self
                .transport
                .get_json(&format!("/exec/{}/json", self.exec_id))
                .await?;
            if !inspect.running {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(EXEC_WAIT_TICK).await;
        }
    }
}

impl AsyncRead for PtySession {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PtySession {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Session HTTP client
// ---------------------------------------------------------------------------

/// HTTP client for one session's published port.
pub struct SessionHttpClient {
    transport: EngineTransport,
}

impl SessionHttpClient {
    pub async fn send(&self, req: Request<Outgoing>) -> Result<Response<Incoming>> {
        self.transport.send(req).await
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Outgoing,
    ) -> Result<Response<Incoming>> {
        self.transport.request(method, path, body, None).await
    }
}

// ---------------------------------------------------------------------------
// Host engine
// ---------------------------------------------------------------------------

/// Client to the engine on the host itself, used only to export
/// locally-built image tarballs into VMs and to answer host-side image
/// queries.
pub struct HostEngine {
    transport: EngineTransport,
}

impl HostEngine {
    pub fn new(socket: &Path) -> Self {
        Self {
            transport: EngineTransport::new(unix_dialer(socket.to_path_buf())),
        }
    }

    pub async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.image_inspect(reference).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn image_inspect(&self, reference: &str) -> Result<ImageInspect> {
        self.transport
            .get_json(&format!("/images/{}/json", reference))
            .await
    }

    /// Open the export tar stream for an image.
    pub async fn export_image(
        &self,
        reference: &str,
    ) -> Result<impl AsyncRead + Send + Unpin + 'static> {
        let resp = self
            .transport
            .request(
                Method::GET,
                &format!("/images/{}/get", reference),
                empty_body(),
                None,
            )
            .await?;
        Ok(body_reader(resp.into_body()))
    }
}

// ---------------------------------------------------------------------------
// Transfer logging
// ---------------------------------------------------------------------------

/// Wraps a reader and logs cumulative progress every 100 MiB.
struct TransferLogReader<R> {
    inner: R,
    label: &'static str,
    transferred: u64,
    last_logged: u64,
}

impl<R> TransferLogReader<R> {
    fn new(inner: R, label: &'static str) -> Self {
        Self {
            inner,
            label,
            transferred: 0,
            last_logged: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TransferLogReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = self.as_mut().get_mut();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            this.transferred += (buf.filled().len() - before) as u64;
            if this.transferred - this.last_logged >= LOAD_LOG_STEP {
                this.last_logged = this.transferred;
                info!(
                    label = this.label,
                    transferred_mib = this.transferred / (1024 * 1024),
                    "transfer progress",
                );
            }
        }
        result
    }
}
