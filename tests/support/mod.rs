//! Test doubles: a fake in-VM container engine served over socketpairs,
//! and a fake machine backend wired to it. Together they let the whole
//! orchestration stack run without a hypervisor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use discobot_sandbox::vm::{MachineBackend, MachineFactory, VmLaunchSpec};
use discobot_sandbox::vsock::{VsockConn, VsockConnect, ENGINE_PORT};
use discobot_sandbox::{Error, Result, SandboxConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    images: Vec<String>,
    containers: HashMap<String, Container>,
    execs: HashMap<String, Vec<String>>,
    next_id: u64,
}

#[derive(Clone)]
struct Container {
    id: String,
    name: String,
    image: String,
    labels: HashMap<String, String>,
    privileged: bool,
    running: bool,
}

/// In-memory engine implementing the slice of the Engine API the client
/// uses. Each vsock "connection" is one HTTP exchange, matching the
/// fresh-connection-per-request transport.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.state.lock().unwrap().images.iter().any(|i| i == name)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn container_running(&self, name: &str) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.running)
    }

    fn lookup(state: &EngineState, id_or_name: &str) -> Option<Container> {
        state
            .containers
            .get(id_or_name)
            .or_else(|| state.containers.values().find(|c| c.id == id_or_name))
            .cloned()
    }

    async fn serve(self: Arc<Self>, mut stream: UnixStream) {
        let Some((method, path_query, body)) = read_request(&mut stream).await else {
            return;
        };
        let (path, _query) = match path_query.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path_query.clone(), String::new()),
        };
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match (method.as_str(), segments.as_slice()) {
            ("GET", ["_ping"]) => {
                respond(&mut stream, 200, "OK", b"OK").await;
            }

            ("GET", ["images", name, "json"]) => {
                if self.has_image(name) {
                    let body = format!("{{\"Id\":\"{}\"}}", name);
                    respond(&mut stream, 200, "OK", body.as_bytes()).await;
                } else {
                    respond(&mut stream, 404, "Not Found", b"{\"message\":\"no such image\"}")
                        .await;
                }
            }

            ("POST", ["images", "create"]) => {
                let name = path_query
                    .split_once("fromImage=")
                    .map(|(_, rest)| rest.split('&').next().unwrap_or(rest).to_string())
                    .unwrap_or_default();
                self.state.lock().unwrap().images.push(name);
                respond(&mut stream, 200, "OK", b"{}").await;
            }

            ("POST", ["containers", "create"]) => {
                let name = path_query
                    .split_once("name=")
                    .map(|(_, rest)| rest.split('&').next().unwrap_or(rest).to_string())
                    .unwrap_or_default();
                let conflict = self.state.lock().unwrap().containers.contains_key(&name);
                if conflict {
                    respond(
                        &mut stream,
                        409,
                        "Conflict",
                        b"{\"message\":\"container name already in use\"}",
                    )
                    .await;
                    return;
                }
                let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
                let id = {
                    let mut state = self.state.lock().unwrap();
                    state.next_id += 1;
                    let id = format!("ctr-{}", state.next_id);
                    let container = Container {
                        id: id.clone(),
                        name: name.clone(),
                        image: parsed["Image"].as_str().unwrap_or_default().to_string(),
                        labels: parsed["Labels"]
                            .as_object()
                            .map(|m| {
                                m.iter()
                                    .map(|(k, v)| {
                                        (k.clone(), v.as_str().unwrap_or_default().to_string())
                                    })
                                    .collect()
                            })
                            .unwrap_or_default(),
                        privileged: parsed["HostConfig"]["Privileged"]
                            .as_bool()
                            .unwrap_or(false),
                        running: false,
                    };
                    state.containers.insert(name, container);
                    id
                };
                let body = format!("{{\"Id\":\"{}\"}}", id);
                respond(&mut stream, 201, "Created", body.as_bytes()).await;
            }

            ("GET", ["containers", "json"]) => {
                let summaries: Vec<serde_json::Value> = {
                    let state = self.state.lock().unwrap();
                    state
                        .containers
                        .values()
                        .map(|c| {
                            serde_json::json!({
                                "Id": c.id,
                                "Names": [format!("/{}", c.name)],
                                "Image": c.image,
                                "State": if c.running { "running" } else { "created" },
                                "Status": if c.running { "Up 1 second" } else { "Created" },
                                "Labels": c.labels,
                            })
                        })
                        .collect()
                };
                let body = serde_json::to_vec(&summaries).unwrap();
                respond(&mut stream, 200, "OK", &body).await;
            }

            ("GET", ["containers", id, "json"]) => {
                let found = {
                    let state = self.state.lock().unwrap();
                    Self::lookup(&state, id)
                };
                match found {
                    Some(c) => {
                        let body = serde_json::json!({
                            "Id": c.id,
                            "Name": format!("/{}", c.name),
                            "State": {
                                "Status": if c.running { "running" } else { "created" },
                                "Running": c.running,
                                "ExitCode": 0,
                            },
                            "Config": { "Image": c.image, "Labels": c.labels },
                            "HostConfig": { "Privileged": c.privileged },
                            "NetworkSettings": {
                                "Ports": if c.running {
                                    serde_json::json!({
                                        "8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "49153"}]
                                    })
                                } else {
                                    serde_json::json!({})
                                }
                            },
                        });
                        respond(&mut stream, 200, "OK", &serde_json::to_vec(&body).unwrap())
                            .await;
                    }
                    None => {
                        respond(
                            &mut stream,
                            404,
                            "Not Found",
                            b"{\"message\":\"no such container\"}",
                        )
                        .await;
                    }
                }
            }

            ("POST", ["containers", id, "start"]) => {
                let ok = {
                    let mut state = self.state.lock().unwrap();
                    let found = Self::lookup(&state, id).map(|c| c.name);
                    match found {
                        Some(name) => {
                            state.containers.get_mut(&name).unwrap().running = true;
                            true
                        }
                        None => false,
                    }
                };
                if ok {
                    respond(&mut stream, 204, "No Content", b"").await;
                } else {
                    respond(
                        &mut stream,
                        404,
                        "Not Found",
                        b"{\"message\":\"no such container\"}",
                    )
                    .await;
                }
            }

            ("POST", ["containers", id, "stop"]) => {
                let ok = {
                    let mut state = self.state.lock().unwrap();
                    let found = Self::lookup(&state, id).map(|c| c.name);
                    match found {
                        Some(name) => {
                            state.containers.get_mut(&name).unwrap().running = false;
                            true
                        }
                        None => false,
                    }
                };
                if ok {
                    respond(&mut stream, 204, "No Content", b"").await;
                } else {
                    respond(
                        &mut stream,
                        404,
                        "Not Found",
                        b"{\"message\":\"no such container\"}",
                    )
                    .await;
                }
            }

            ("DELETE", ["containers", id]) => {
                let ok = {
                    let mut state = self.state.lock().unwrap();
                    let found = Self::lookup(&state, id).map(|c| c.name);
                    match found {
                        Some(name) => state.containers.remove(&name).is_some(),
                        None => false,
                    }
                };
                if ok {
                    respond(&mut stream, 204, "No Content", b"").await;
                } else {
                    respond(
                        &mut stream,
                        404,
                        "Not Found",
                        b"{\"message\":\"no such container\"}",
                    )
                    .await;
                }
            }

            ("POST", ["containers", id, "exec"]) => {
                let exists = {
                    let state = self.state.lock().unwrap();
                    Self::lookup(&state, id).is_some()
                };
                if !exists {
                    respond(
                        &mut stream,
                        404,
                        "Not Found",
                        b"{\"message\":\"no such container\"}",
                    )
                    .await;
                    return;
                }
                let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
                let cmd: Vec<String> = parsed["Cmd"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .map(|v| v.as_str().unwrap_or_default().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                let exec_id = {
                    let mut state = self.state.lock().unwrap();
                    state.next_id += 1;
                    let exec_id = format!("exec-{}", state.next_id);
                    state.execs.insert(exec_id.clone(), cmd);
                    exec_id
                };
                let body = format!("{{\"Id\":\"{}\"}}", exec_id);
                respond(&mut stream, 201, "Created", body.as_bytes()).await;
            }

            ("POST", ["exec", exec_id, "start"]) => {
                let cmd = self
                    .state
                    .lock()
                    .unwrap()
                    .execs
                    .get(*exec_id)
                    .cloned()
                    .unwrap_or_default();
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 101 UPGRADED\r\nconnection: Upgrade\r\nupgrade: tcp\r\n\r\n",
                    )
                    .await;
                run_fake_exec(&mut stream, &cmd).await;
            }

            ("GET", ["exec", _exec_id, "json"]) => {
                respond(&mut stream, 200, "OK", b"{\"Running\":false,\"ExitCode\":0}").await;
            }

            ("POST", ["exec", _exec_id, "resize"]) => {
                respond(&mut stream, 200, "OK", b"").await;
            }

            _ => {
                respond(
                    &mut stream,
                    404,
                    "Not Found",
                    b"{\"message\":\"unhandled fake endpoint\"}",
                )
                .await;
            }
        }
    }
}

/// Behaviour of commands run through the fake exec endpoint, framed in the
/// engine's 8-byte stdio format.
async fn run_fake_exec(stream: &mut UnixStream, cmd: &[String]) {
    match cmd.first().map(String::as_str) {
        // Echo one round of stdin back to stdout.
        Some("cat") => {
            let mut buf = vec![0u8; 4096];
            if let Ok(n) = stream.read(&mut buf).await {
                if n > 0 {
                    let _ = stream.write_all(&stdio_frame(1, &buf[..n])).await;
                }
            }
        }
        Some("echo") => {
            let mut line = cmd[1..].join(" ");
            line.push('\n');
            let _ = stream.write_all(&stdio_frame(1, line.as_bytes())).await;
        }
        Some("stderr") => {
            let _ = stream.write_all(&stdio_frame(2, b"to stderr\n")).await;
        }
        _ => {}
    }
    // Dropping the stream ends the output side.
}

fn stdio_frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream_type, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read one HTTP/1.1 request (head + content-length body).
async fn read_request(stream: &mut UnixStream) -> Option<(String, String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let content_length: usize = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Some((method, path, body))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn respond(stream: &mut UnixStream, status: u16, reason: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body).await;
}

// ---------------------------------------------------------------------------
// Fake machine
// ---------------------------------------------------------------------------

/// Connector routing the engine port to the fake engine and any other
/// port to a trivial HTTP responder (the "session process").
pub struct FakeConnector {
    engine: Arc<FakeEngine>,
}

#[async_trait::async_trait]
impl VsockConnect for FakeConnector {
    async fn connect(&self, port: u32) -> Result<VsockConn> {
        let (client, server) = UnixStream::pair().map_err(Error::Io)?;
        if port == ENGINE_PORT {
            let engine = Arc::clone(&self.engine);
            tokio::spawn(engine.serve(server));
        } else {
            tokio::spawn(async move {
                let mut server = server;
                if read_request(&mut server).await.is_some() {
                    respond(&mut server, 200, "OK", b"hello from session").await;
                }
            });
        }
        Ok(VsockConn::from_unix_stream(client, port))
    }
}

pub struct FakeMachine {
    connector: Arc<FakeConnector>,
    console: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
}

#[async_trait::async_trait]
impl MachineBackend for FakeMachine {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn request_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_stopped(&self) -> Result<()> {
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        Ok(())
    }

    fn connector(&self) -> Arc<dyn VsockConnect> {
        Arc::clone(&self.connector) as Arc<dyn VsockConnect>
    }

    fn take_console(&self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.console.lock().unwrap().take()
    }
}

/// One fake engine per booted VM, keyed by project id.
pub type EngineRegistry = Arc<Mutex<HashMap<String, Arc<FakeEngine>>>>;

pub fn engine_registry() -> EngineRegistry {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Machine factory creating a fresh fake engine per VM; counts boots.
pub fn fake_factory(registry: EngineRegistry, boots: Arc<AtomicUsize>) -> MachineFactory {
    Arc::new(move |spec: VmLaunchSpec| {
        let registry = Arc::clone(&registry);
        let boots = Arc::clone(&boots);
        Box::pin(async move {
            boots.fetch_add(1, Ordering::SeqCst);
            let engine = FakeEngine::new();
            registry
                .lock()
                .unwrap()
                .insert(spec.project_id.clone(), Arc::clone(&engine));
            let machine = FakeMachine {
                connector: Arc::new(FakeConnector { engine }),
                console: Mutex::new(Some(
                    Box::new(&b"guest console online\n"[..])
                        as Box<dyn AsyncRead + Send + Unpin>,
                )),
            };
            Ok(Arc::new(machine) as Arc<dyn MachineBackend>)
        })
    })
}

/// Config with explicit artifacts (no download) rooted in a temp dir.
pub fn test_config(dir: &std::path::Path) -> SandboxConfig {
    SandboxConfig {
        kernel_path: Some(dir.join("vmlinuz")),
        root_disk_path: Some(dir.join("rootfs.squashfs")),
        data_dir: dir.join("data"),
        console_log_dir: dir.join("logs"),
        data_disk_gb: 1,
        memory_mb: Some(512),
        cpu_count: Some(1),
        sandbox_image: "sandbox:test".to_string(),
        ..Default::default()
    }
}
