//! Status and readiness surface.
//!
//! Aggregates artifact download progress and VM manager readiness into the
//! single record the host's status endpoint serves, and defines the
//! optional callback sink that drives a system-status UI.

use std::path::PathBuf;

use serde::Serialize;

/// Overall sandbox availability state.
///
/// Precedence when merging sources:
/// failed > downloading > extracting > initializing > ready > not_available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    NotAvailable,
    Initializing,
    Downloading,
    Extracting,
    Ready,
    Failed,
}

impl SandboxState {
    fn precedence(self) -> u8 {
        match self {
            SandboxState::Failed => 5,
            SandboxState::Downloading => 4,
            SandboxState::Extracting => 3,
            SandboxState::Initializing => 2,
            SandboxState::Ready => 1,
            SandboxState::NotAvailable => 0,
        }
    }

    /// Merge two states, keeping the one with higher precedence.
    pub fn merge(self, other: SandboxState) -> SandboxState {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }
}

/// Download progress attached while artifacts stream in.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_layer: Option<String>,
}

/// Configuration details attached once the sandbox is ready.
#[derive(Debug, Clone, Serialize)]
pub struct VmConfigInfo {
    pub kernel_path: PathBuf,
    pub root_disk_path: PathBuf,
    pub memory_mb: u64,
    pub cpu_count: usize,
    pub data_disk_gb: u64,
}

/// The composite status record served to API callers.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxStatus {
    pub available: bool,
    pub state: SandboxState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<VmConfigInfo>,
}

impl SandboxStatus {
    pub fn not_available(message: impl Into<String>) -> Self {
        Self {
            available: false,
            state: SandboxState::NotAvailable,
            message: message.into(),
            download: None,
            config: None,
        }
    }

    pub fn ready(config: VmConfigInfo) -> Self {
        Self {
            available: true,
            state: SandboxState::Ready,
            message: "sandbox ready".to_string(),
            download: None,
            config: Some(config),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            available: false,
            state: SandboxState::Failed,
            message: message.into(),
            download: None,
            config: None,
        }
    }
}

/// Callbacks used to drive a system-status UI while artifacts download or
/// VMs boot. All methods are fire-and-forget.
pub trait StatusSink: Send + Sync {
    fn register_task(&self, id: &str, description: &str);
    fn start_task(&self, id: &str);
    fn update_task_bytes(&self, id: &str, done: u64, total: u64);
    fn update_task_progress(&self, id: &str, pct: f64, label: &str);
    fn complete_task(&self, id: &str);
    fn fail_task(&self, id: &str, err: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_ordering() {
        use SandboxState::*;
        assert_eq!(Ready.merge(Failed), Failed);
        assert_eq!(Failed.merge(Downloading), Failed);
        assert_eq!(Ready.merge(Downloading), Downloading);
        assert_eq!(Downloading.merge(Extracting), Downloading);
        assert_eq!(Extracting.merge(Initializing), Extracting);
        assert_eq!(NotAvailable.merge(Ready), Ready);
        assert_eq!(NotAvailable.merge(NotAvailable), NotAvailable);
    }

    #[test]
    fn serializes_snake_case() {
        let status = SandboxStatus::not_available("virtualization unsupported");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "not_available");
        assert_eq!(json["available"], false);
        assert!(json.get("download").is_none());
    }

    #[test]
    fn ready_carries_config() {
        let status = SandboxStatus::ready(VmConfigInfo {
            kernel_path: PathBuf::from("/k"),
            root_disk_path: PathBuf::from("/r"),
            memory_mb: 8192,
            cpu_count: 8,
            data_disk_gb: 20,
        });
        assert!(status.available);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(json["config"]["memory_mb"], 8192);
    }
}
