//! discobot-oci: VM boot artifact acquisition from OCI registries.
//!
//! A boot image is an ordinary container image whose layers carry two
//! files, `vmlinuz` and `rootfs.squashfs`. This crate resolves the image
//! reference against the registry, streams the platform-matching layers
//! through a tar reader keeping only those two files, rewrites the kernel
//! into a directly bootable form, and finalises everything into a
//! content-addressed cache directory with an atomic rename.

pub mod cache;
pub mod error;
pub mod extract;
pub mod kernel;
pub mod manifest;
pub mod registry;

pub use cache::ArtifactCache;
pub use error::{OciError, Result};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info};

use crate::extract::{ArtifactSet, CountingReader};
use crate::manifest::{ManifestRecord, Platform};
use crate::registry::{ImageRef, RegistryClient};

/// The extracted, bootable artifact files for one image reference.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    /// Uncompressed kernel image.
    pub kernel: PathBuf,
    /// Read-only squashfs root disk.
    pub root_disk: PathBuf,
    /// The `manifest.json` cache record.
    pub manifest: PathBuf,
}

/// Progress callbacks invoked while a pull is in flight.
///
/// Byte counts are cumulative over all layers; `total` is the sum of the
/// compressed layer sizes from the resolved manifest.
pub trait PullObserver: Send + Sync {
    fn layer_started(&self, _digest: &str, _index: usize, _count: usize) {}
    fn bytes_transferred(&self, _done: u64, _total: u64) {}
}

/// Observer that discards all progress.
pub struct NullObserver;

impl PullObserver for NullObserver {}

/// Client that turns an image reference into cached boot artifacts.
pub struct BootImageClient {
    registry: RegistryClient,
    platform: Platform,
}

impl BootImageClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            registry: RegistryClient::new()?,
            platform: Platform::linux_host_arch(),
        })
    }

    /// Fetch the boot artifacts for `image_ref` into `cache`.
    ///
    /// A complete cache entry short-circuits without any network traffic.
    /// Otherwise the layers stream through extraction into a staging
    /// directory that is renamed into place only once both artifacts exist
    /// and the kernel has been normalised.
    pub async fn fetch(
        &self,
        image_ref: &str,
        cache: &ArtifactCache,
        observer: Arc<dyn PullObserver>,
    ) -> Result<ArtifactPaths> {
        let parsed = ImageRef::parse(image_ref)?;
        let digest = ArtifactCache::digest_for(image_ref);

        if let Some(paths) = cache.lookup(&digest).await {
            info!(%digest, "boot artifacts already cached");
            return Ok(paths);
        }

        info!(
            registry = %parsed.registry,
            repository = %parsed.repository,
            reference = %parsed.reference,
            "pulling boot image",
        );

        let manifest = self
            .registry
            .resolve_manifest(&parsed, &self.platform)
            .await?;
        let total = manifest.total_layer_bytes();
        let layer_count = manifest.layers.len();

        let staging = cache.stage(&digest).await?;
        let done = Arc::new(AtomicU64::new(0));
        let mut found = ArtifactSet::default();
        let mut completed_bytes = 0u64;

        for (index, layer) in manifest.layers.iter().enumerate() {
            observer.layer_started(&layer.digest, index, layer_count);
            debug!(digest = %layer.digest, size = layer.size, "streaming layer");

            let resp = self.registry.blob_stream(&parsed, &layer.digest).await?;
            let stream = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other));
            let bridge = SyncIoBridge::new(StreamReader::new(stream));
            let counted =
                CountingReader::new(bridge, done.clone(), total, observer.clone());

            let media_type = layer.media_type.clone();
            let dest = staging.clone();
            found = tokio::task::spawn_blocking(move || -> Result<ArtifactSet> {
                let mut found = found;
                extract::extract_layer(counted, &media_type, &dest, &mut found)?;
                Ok(found)
            })
            .await
            .map_err(|e| OciError::Artifact(format!("extraction task panicked: {}", e)))??;

            // Tar readers stop at the end-of-archive marker, so snap the
            // counter to the exact cumulative layer size.
            completed_bytes += layer.size;
            done.store(completed_bytes, Ordering::Relaxed);
            observer.bytes_transferred(completed_bytes, total);
        }

        if !found.complete() {
            return Err(OciError::Artifact(format!(
                "image layers did not contain both {} and {}",
                extract::KERNEL_IMAGE,
                extract::ROOT_DISK_IMAGE,
            )));
        }

        let kernel_path = staging.join(extract::KERNEL_IMAGE);
        let rewritten = tokio::task::spawn_blocking(move || kernel::normalize_file(&kernel_path))
            .await
            .map_err(|e| OciError::Kernel(format!("kernel task panicked: {}", e)))??;
        if rewritten {
            info!("kernel image decompressed into bootable form");
        }

        let record = ManifestRecord::new(image_ref, &digest, total);
        tokio::fs::write(
            staging.join(cache::MANIFEST_FILE),
            serde_json::to_vec_pretty(&record)?,
        )
        .await?;

        cache.finalize(&digest).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
