//! discobot-sandbox: per-project VM sandboxes for coding-agent sessions.
//!
//! Each project gets one lightweight Linux VM booted through Apple's
//! Virtualization framework; inside it a container engine runs one
//! container per session. This crate is the orchestration core behind the
//! host's session API:
//!
//! - boot artifacts (`vmlinuz` + `rootfs.squashfs`) are pulled from a
//!   container registry into a content-addressed cache
//!   ([`images`], `discobot-oci`)
//! - VMs are created, cached, and idle-reaped per project
//!   ([`vm::manager`])
//! - all host↔guest traffic rides vsock byte streams ([`vsock`]), with
//!   HTTP to the in-VM container engine layered on top ([`engine`])
//! - session operations are routed by an injected
//!   `sessionID → projectID` resolver ([`router`])
//! - readiness and download progress surface through one status record
//!   ([`status`])
//!
//! The public entry point is the [`Sandbox`] trait and its
//! [`VmSandbox`] implementation:
//!
//! ```no_run
//! use std::sync::Arc;
//! use discobot_sandbox::{Sandbox, SandboxConfig, SessionResolver, VmSandbox};
//!
//! # async fn run() -> discobot_sandbox::Result<()> {
//! let config = SandboxConfig {
//!     image_ref: "ghcr.io/example/sandbox-vm:main".into(),
//!     sandbox_image: "ghcr.io/example/sandbox:latest".into(),
//!     ..Default::default()
//! };
//! let resolver: SessionResolver = Arc::new(|session_id| {
//!     Box::pin(async move {
//!         // Look the session up in the application's store.
//!         Ok(format!("project-for-{}", session_id))
//!     })
//! });
//!
//! let sandbox = VmSandbox::for_host(config, resolver, None);
//! sandbox.wait_for_ready().await?;
//! sandbox.create("sess-1", Default::default()).await?;
//! sandbox.start("sess-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod images;
pub mod router;
pub mod sandbox;
pub mod status;
pub mod vm;
pub mod vsock;

pub use config::SandboxConfig;
pub use engine::{EngineClient, ExecStream, HostEngine, PtySession, SessionHttpClient, SessionInfo};
pub use error::{Error, Result};
pub use router::{SessionResolver, SessionRouter};
pub use sandbox::{CreateOptions, Sandbox, SessionEvent, SessionState, VmSandbox};
pub use status::{SandboxState, SandboxStatus, StatusSink};
pub use vm::manager::{ProjectVms, UnavailableVms, VmManager};
pub use vm::ProjectVm;

/// Output from a buffered command execution in a session container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    /// Stdout as UTF-8, replacing invalid sequences.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as UTF-8, replacing invalid sequences.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_accessors() {
        let output = ExecOutput::new(b"hello\n".to_vec(), b"warn\n".to_vec(), 0);
        assert!(output.success());
        assert_eq!(output.stdout_str(), "hello\n");
        assert_eq!(output.stderr_str(), "warn\n");
    }

    #[test]
    fn exec_output_failure() {
        let output = ExecOutput::new(Vec::new(), b"boom\n".to_vec(), 2);
        assert!(!output.success());
    }
}
