//! Boot artifact acquisition.
//!
//! Wraps [`discobot_oci::BootImageClient`] in the start/wait/status surface
//! the VM manager consumes: a background task with a bounded retry loop,
//! a snapshot of download progress, and a terminal-state signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use discobot_oci::{ArtifactCache, ArtifactPaths, BootImageClient, PullObserver};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::status::{DownloadProgress, StatusSink};

/// Task id reported to the status sink.
const TASK_ID: &str = "boot-image";

/// Maximum fetch attempts before the acquirer fails terminally.
const MAX_ATTEMPTS: u32 = 5;

/// First retry delay; doubled per attempt up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePhase {
    /// Not started yet.
    Pending,
    /// Resolving the manifest / opening layer streams.
    Downloading,
    /// Streaming layers through extraction.
    Extracting,
    Ready,
    Failed,
}

/// Point-in-time view of the acquisition.
#[derive(Debug, Clone)]
pub struct AcquireSnapshot {
    pub phase: AcquirePhase,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub current_layer: Option<String>,
    pub error: Option<String>,
    pub paths: Option<ArtifactPaths>,
}

impl AcquireSnapshot {
    /// Progress record for the status surface, present while in flight.
    pub fn download_progress(&self) -> Option<DownloadProgress> {
        match self.phase {
            AcquirePhase::Downloading | AcquirePhase::Extracting => Some(DownloadProgress {
                bytes_done: self.bytes_done,
                bytes_total: self.bytes_total,
                current_layer: self.current_layer.clone(),
            }),
            _ => None,
        }
    }
}

struct AcquireState {
    phase: AcquirePhase,
    bytes_done: u64,
    bytes_total: u64,
    current_layer: Option<String>,
    error: Option<String>,
    paths: Option<ArtifactPaths>,
}

/// Downloads and caches the boot artifacts for one image reference.
pub struct BootImageAcquirer {
    image_ref: String,
    cache: ArtifactCache,
    sink: Option<Arc<dyn StatusSink>>,
    state: Arc<Mutex<AcquireState>>,
    terminal_tx: watch::Sender<bool>,
    terminal_rx: watch::Receiver<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BootImageAcquirer {
    pub fn new(
        image_ref: impl Into<String>,
        data_dir: impl Into<std::path::PathBuf>,
        sink: Option<Arc<dyn StatusSink>>,
    ) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = watch::channel(false);
        Arc::new(Self {
            image_ref: image_ref.into(),
            cache: ArtifactCache::new(data_dir.into()),
            sink,
            state: Arc::new(Mutex::new(AcquireState {
                phase: AcquirePhase::Pending,
                bytes_done: 0,
                bytes_total: 0,
                current_layer: None,
                error: None,
                paths: None,
            })),
            terminal_tx,
            terminal_rx,
            task: Mutex::new(None),
        })
    }

    /// Begin (or join) the acquisition. Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Block until the acquisition reaches a terminal state.
    pub async fn wait(&self) -> Result<ArtifactPaths> {
        let mut rx = self.terminal_rx.clone();
        while !*rx.borrow() {
            rx.changed()
                .await
                .map_err(|_| Error::Download("acquirer task dropped".to_string()))?;
        }
        let state = self.state.lock().unwrap();
        match state.phase {
            AcquirePhase::Ready => Ok(state
                .paths
                .clone()
                .expect("ready state always carries paths")),
            _ => Err(Error::Download(
                state
                    .error
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string()),
            )),
        }
    }

    /// Snapshot the current progress.
    pub fn snapshot(&self) -> AcquireSnapshot {
        let state = self.state.lock().unwrap();
        AcquireSnapshot {
            phase: state.phase,
            bytes_done: state.bytes_done,
            bytes_total: state.bytes_total,
            current_layer: state.current_layer.clone(),
            error: state.error.clone(),
            paths: state.paths.clone(),
        }
    }

    /// The extracted paths, available only once ready.
    pub fn paths(&self) -> Option<ArtifactPaths> {
        let state = self.state.lock().unwrap();
        match state.phase {
            AcquirePhase::Ready => state.paths.clone(),
            _ => None,
        }
    }

    /// Abort the background task, if running. Used on close; the staging
    /// directory is cleaned up by the next run.
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        if let Some(sink) = &self.sink {
            sink.register_task(TASK_ID, "Downloading sandbox boot image");
            sink.start_task(TASK_ID);
        }

        let client = match BootImageClient::new() {
            Ok(c) => c,
            Err(e) => {
                self.finish_failed(format!("building registry client: {}", e));
                return;
            }
        };

        let observer: Arc<dyn PullObserver> = Arc::new(ProgressBridge {
            state: Arc::clone(&self.state),
            sink: self.sink.clone(),
        });

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            {
                let mut state = self.state.lock().unwrap();
                state.phase = AcquirePhase::Downloading;
                state.bytes_done = 0;
                state.current_layer = None;
            }

            match client
                .fetch(&self.image_ref, &self.cache, observer.clone())
                .await
            {
                Ok(paths) => {
                    info!(
                        kernel = %paths.kernel.display(),
                        root_disk = %paths.root_disk.display(),
                        "boot artifacts ready",
                    );
                    {
                        let mut state = self.state.lock().unwrap();
                        state.phase = AcquirePhase::Ready;
                        state.paths = Some(paths);
                    }
                    if let Some(sink) = &self.sink {
                        sink.complete_task(TASK_ID);
                    }
                    let _ = self.terminal_tx.send(true);
                    return;
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "boot image fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    self.finish_failed(e.to_string());
                    return;
                }
            }
        }
    }

    fn finish_failed(&self, message: String) {
        warn!(error = %message, "boot image acquisition failed terminally");
        {
            let mut state = self.state.lock().unwrap();
            state.phase = AcquirePhase::Failed;
            state.error = Some(message.clone());
        }
        if let Some(sink) = &self.sink {
            sink.fail_task(TASK_ID, &message);
        }
        let _ = self.terminal_tx.send(true);
    }
}

/// Forwards pull progress into the acquirer state and the status sink.
struct ProgressBridge {
    state: Arc<Mutex<AcquireState>>,
    sink: Option<Arc<dyn StatusSink>>,
}

impl PullObserver for ProgressBridge {
    fn layer_started(&self, digest: &str, index: usize, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.phase = AcquirePhase::Extracting;
        state.current_layer = Some(digest.to_string());
        drop(state);
        if let Some(sink) = &self.sink {
            let label = format!("layer {}/{}", index + 1, count);
            let pct = index as f64 / count.max(1) as f64 * 100.0;
            sink.update_task_progress(TASK_ID, pct, &label);
        }
    }

    fn bytes_transferred(&self, done: u64, total: u64) {
        let mut state = self.state.lock().unwrap();
        state.bytes_done = done;
        state.bytes_total = total;
        drop(state);
        if let Some(sink) = &self.sink {
            sink.update_task_bytes(TASK_ID, done, total);
        }
    }
}
