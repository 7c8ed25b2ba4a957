//! Error types for the sandbox orchestrator.

use thiserror::Error;

/// Result type alias using the sandbox [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by sandbox operations.
///
/// `NotReady` is distinguishable so callers can present a download/boot
/// spinner instead of a failure; `NotFound` is the only kind that maps to
/// an HTTP 404 in the embedding server.
#[derive(Error, Debug)]
pub enum Error {
    /// Boot artifacts are still downloading; the operation may be retried.
    #[error("sandbox is not ready yet")]
    NotReady,

    /// Artifact acquisition failed terminally.
    #[error("boot image download failed: {0}")]
    Download(String),

    /// VM creation or readiness failed.
    #[error("VM boot failed: {0}")]
    Boot(String),

    /// Unknown session, or no VM exists for the resolved project.
    #[error("not found: {0}")]
    NotFound(String),

    /// A session with this identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// vsock dial or stream failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error reported by (or while talking to) a container engine.
    #[error("engine error: {0}")]
    Engine(String),

    /// Internal assertion failure; never surfaced to API callers as itself.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error should surface as a 404 to API callers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Map an artifact acquisition failure into the sandbox taxonomy.
    pub fn from_oci(err: discobot_oci::OciError) -> Self {
        Error::Download(err.to_string())
    }
}
