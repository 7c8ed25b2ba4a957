use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{OciError, Result};
use crate::extract::{KERNEL_IMAGE, ROOT_DISK_IMAGE};
use crate::kernel;
use crate::ArtifactPaths;

/// File name of the cache record written next to the artifacts.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Content-addressed boot artifact cache.
///
/// Layout: `{data_dir}/images/{digest}/{vmlinuz, rootfs.squashfs,
/// manifest.json}`, where `digest` is the truncated SHA-256 of the image
/// reference string. Work in progress lives in a `.tmp` sibling directory
/// that is renamed into place only once both artifacts are present and the
/// kernel file holds a recognised kernel image.
pub struct ArtifactCache {
    data_dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Stable digest key for an image reference string.
    pub fn digest_for(image_ref: &str) -> String {
        let hash = Sha256::digest(image_ref.as_bytes());
        let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
        hex[..19].to_string()
    }

    /// Final directory for a digest.
    pub fn image_dir(&self, digest: &str) -> PathBuf {
        self.data_dir.join("images").join(digest)
    }

    /// Temporary sibling used while downloading and extracting.
    pub fn staging_dir(&self, digest: &str) -> PathBuf {
        self.data_dir.join("images").join(format!("{}.tmp", digest))
    }

    fn paths_in(&self, dir: &Path) -> ArtifactPaths {
        ArtifactPaths {
            kernel: dir.join(KERNEL_IMAGE),
            root_disk: dir.join(ROOT_DISK_IMAGE),
            manifest: dir.join(MANIFEST_FILE),
        }
    }

    /// Return the artifact paths for `digest` when a complete finalised
    /// cache entry exists (both files present and non-empty).
    pub async fn lookup(&self, digest: &str) -> Option<ArtifactPaths> {
        let paths = self.paths_in(&self.image_dir(digest));
        for file in [&paths.kernel, &paths.root_disk] {
            match fs::metadata(file).await {
                Ok(meta) if meta.len() > 0 => {}
                _ => return None,
            }
        }
        Some(paths)
    }

    /// Prepare a fresh staging directory, removing any stale leftover from a
    /// previous interrupted run.
    pub async fn stage(&self, digest: &str) -> Result<PathBuf> {
        let staging = self.staging_dir(digest);
        if fs::metadata(&staging).await.is_ok() {
            warn!(dir = %staging.display(), "removing stale staging directory");
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;
        Ok(staging)
    }

    /// Atomically promote the staging directory to the final location.
    ///
    /// Refuses to finalise unless both artifacts are present and non-empty
    /// and the kernel file starts with a recognised kernel image. A
    /// pre-existing final directory is removed first.
    pub async fn finalize(&self, digest: &str) -> Result<ArtifactPaths> {
        let staging = self.staging_dir(digest);
        let staged = self.paths_in(&staging);

        for file in [&staged.kernel, &staged.root_disk] {
            let meta = fs::metadata(file).await.map_err(|_| {
                OciError::Artifact(format!("missing artifact {}", file.display()))
            })?;
            if meta.len() == 0 {
                return Err(OciError::Artifact(format!(
                    "artifact {} is empty",
                    file.display()
                )));
            }
        }

        let header = read_prefix(&staged.kernel, 4096).await?;
        if !kernel::is_kernel_image(&header) {
            return Err(OciError::Kernel(format!(
                "refusing to finalise: {} is not a recognised kernel image",
                staged.kernel.display()
            )));
        }

        let final_dir = self.image_dir(digest);
        if fs::metadata(&final_dir).await.is_ok() {
            fs::remove_dir_all(&final_dir).await?;
        }
        fs::rename(&staging, &final_dir).await?;
        debug!(dir = %final_dir.display(), "finalised artifact cache entry");

        Ok(self.paths_in(&final_dir))
    }
}

async fn read_prefix(path: &Path, limit: usize) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = fs::File::open(path).await?;
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
