//! Wire types for the container Engine HTTP API.
//!
//! Only the fields this crate reads or writes are modelled; the engine
//! tolerates absent fields and emits many more than we care about.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateRequest {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc_mode: Option<String>,
    pub publish_all_ports: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    pub name: String,
}

impl RestartPolicy {
    pub fn always() -> Self {
        Self {
            name: "always".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Warnings", default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub state: ContainerState,
    pub config: InspectConfig,
    #[serde(default)]
    pub host_config: InspectHostConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHostConfig {
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

impl NetworkSettings {
    /// First published TCP host port, if any.
    pub fn first_tcp_host_port(&self) -> Option<u16> {
        let mut ports: Vec<_> = self
            .ports
            .iter()
            .filter(|(key, _)| key.ends_with("/tcp"))
            .collect();
        ports.sort_by(|a, b| a.0.cmp(b.0));
        ports
            .into_iter()
            .filter_map(|(_, bindings)| bindings.as_ref())
            .flat_map(|bindings| bindings.iter())
            .find_map(|b| b.host_port.parse().ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A `filters` query value: map of filter name to values.
pub fn label_filter(label: &str, value: &str) -> String {
    let filters = serde_json::json!({ "label": [format!("{}={}", label, value)] });
    urlencode(&filters.to_string())
}

/// Percent-encode a query value (minimal set sufficient for JSON filters).
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreateRequest {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecStartRequest {
    pub detach: bool,
    pub tty: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInspect {
    #[serde(rename = "Id")]
    pub id: String,
}

// ---------------------------------------------------------------------------
// Stdio stream frames
// ---------------------------------------------------------------------------

/// One demultiplexed chunk from a non-TTY exec stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

impl StdioChunk {
    pub fn data(&self) -> &Bytes {
        match self {
            StdioChunk::Stdout(b) | StdioChunk::Stderr(b) => b,
        }
    }
}

/// Read one 8-byte-header stream frame. Returns `None` on clean EOF at a
/// frame boundary.
///
/// Frame layout: `[stream_type, 0, 0, 0, len_be_u32, payload…]` where
/// stream type 1 is stdout and 2 is stderr.
pub async fn read_stdio_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<StdioChunk>> {
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader
            .read(&mut header[filled..])
            .await
            .map_err(|e| Error::Transport(format!("reading stream frame header: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Transport(
                "stream ended mid-frame-header".to_string(),
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Transport(format!("reading stream frame payload: {}", e)))?;
    let payload = Bytes::from(payload);

    match header[0] {
        2 => Ok(Some(StdioChunk::Stderr(payload))),
        // 0 (stdin echo) and 1 both surface as stdout.
        _ => Ok(Some(StdioChunk::Stdout(payload))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_type, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn demux_frames() {
        let mut data = frame(1, b"out");
        data.extend(frame(2, b"err"));
        let mut reader = data.as_slice();

        assert_eq!(
            read_stdio_frame(&mut reader).await.unwrap(),
            Some(StdioChunk::Stdout(Bytes::from_static(b"out")))
        );
        assert_eq!(
            read_stdio_frame(&mut reader).await.unwrap(),
            Some(StdioChunk::Stderr(Bytes::from_static(b"err")))
        );
        assert_eq!(read_stdio_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let mut reader = &[1u8, 0, 0][..];
        assert!(read_stdio_frame(&mut reader).await.is_err());
    }

    #[test]
    fn create_request_uses_engine_field_names() {
        let req = ContainerCreateRequest {
            image: "img".into(),
            cmd: Some(vec!["sh".into()]),
            env: None,
            labels: HashMap::from([("discobot.session".into(), "s1".into())]),
            host_config: HostConfig {
                privileged: true,
                network_mode: Some("host".into()),
                publish_all_ports: true,
                restart_policy: Some(RestartPolicy::always()),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["Image"], "img");
        assert_eq!(json["HostConfig"]["Privileged"], true);
        assert_eq!(json["HostConfig"]["NetworkMode"], "host");
        assert_eq!(json["HostConfig"]["RestartPolicy"]["Name"], "always");
        assert!(json.get("Env").is_none());
    }

    #[test]
    fn inspect_parses_engine_response() {
        let inspect: ContainerInspect = serde_json::from_str(
            r#"{
                "Id": "abc",
                "Name": "/s1",
                "State": {"Status": "running", "Running": true, "ExitCode": 0},
                "Config": {"Image": "sha256:img", "Labels": {"discobot.project": "p1"}},
                "HostConfig": {"Privileged": false},
                "NetworkSettings": {
                    "Ports": {
                        "8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "49153"}],
                        "9090/udp": null
                    }
                }
            }"#,
        )
        .unwrap();
        assert!(inspect.state.running);
        assert_eq!(inspect.config.labels["discobot.project"], "p1");
        assert_eq!(inspect.network_settings.first_tcp_host_port(), Some(49153));
    }

    #[test]
    fn label_filter_is_encoded() {
        let encoded = label_filter("discobot.project", "p1");
        assert!(!encoded.contains('{'));
        assert!(!encoded.contains('"'));
        assert!(encoded.contains("%7B"));
    }
}
