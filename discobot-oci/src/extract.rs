//! Layer streaming: pick the two boot artifacts out of image layers.
//!
//! Layers are consumed as they download: response body → byte-counting
//! reader → media-type decompressor → tar reader. Only entries whose base
//! name matches one of the two artifact names are written out; everything
//! else in the image is skipped without touching disk.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::error::{OciError, Result};
use crate::PullObserver;

/// Base name of the guest kernel inside image layers.
pub const KERNEL_IMAGE: &str = "vmlinuz";

/// Base name of the read-only root filesystem inside image layers.
pub const ROOT_DISK_IMAGE: &str = "rootfs.squashfs";

/// Which artifacts have been written so far across layers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArtifactSet {
    pub kernel: bool,
    pub root_disk: bool,
}

impl ArtifactSet {
    pub fn complete(&self) -> bool {
        self.kernel && self.root_disk
    }
}

/// Walk one layer's tar stream and write out matching artifact entries.
pub fn extract_layer(
    reader: impl Read,
    media_type: &str,
    dest: &Path,
    found: &mut ArtifactSet,
) -> Result<()> {
    let decompressed = decompressor(media_type, reader);
    let mut archive = Archive::new(decompressed);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?;
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
        else {
            continue;
        };
        if name != KERNEL_IMAGE && name != ROOT_DISK_IMAGE {
            continue;
        }

        let out_path = dest.join(&name);
        let mut out = std::fs::File::create(&out_path)?;
        let written = std::io::copy(&mut entry, &mut out)?;
        debug!(artifact = %name, bytes = written, "extracted boot artifact");

        match name.as_str() {
            KERNEL_IMAGE => found.kernel = true,
            ROOT_DISK_IMAGE => found.root_disk = true,
            _ => unreachable!(),
        }
    }

    Ok(())
}

/// Wrap a layer reader in the decompressor its media type calls for.
fn decompressor<'a>(media_type: &str, reader: impl Read + 'a) -> Box<dyn Read + 'a> {
    if media_type.contains("zstd") {
        match zstd::stream::read::Decoder::new(reader) {
            Ok(d) => Box::new(d),
            Err(e) => Box::new(FailingReader(OciError::Artifact(format!(
                "zstd layer init: {}",
                e
            )))),
        }
    } else if media_type.ends_with("tar") {
        Box::new(reader)
    } else {
        // tar+gzip is the overwhelming default; unknown types are treated
        // the same way.
        Box::new(GzDecoder::new(reader))
    }
}

/// A reader that surfaces a deferred construction error on first read.
struct FailingReader(OciError);

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::other(self.0.to_string()))
    }
}

/// Counts compressed bytes as they stream through and reports cumulative
/// progress to the observer roughly once per mebibyte.
pub struct CountingReader<R> {
    inner: R,
    done: Arc<AtomicU64>,
    total: u64,
    observer: Arc<dyn PullObserver>,
    unreported: u64,
}

const REPORT_STEP: u64 = 1024 * 1024;

impl<R: Read> CountingReader<R> {
    pub fn new(
        inner: R,
        done: Arc<AtomicU64>,
        total: u64,
        observer: Arc<dyn PullObserver>,
    ) -> Self {
        Self {
            inner,
            done,
            total,
            observer,
            unreported: 0,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let done = self.done.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
            self.unreported += n as u64;
            if self.unreported >= REPORT_STEP {
                self.unreported = 0;
                self.observer.bytes_transferred(done, self.total);
            }
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullObserver;
    use std::io::Write;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn extracts_matching_base_names_only() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_with(&[
            ("boot/vmlinuz", b"kernel bytes"),
            ("images/rootfs.squashfs", b"rootfs bytes"),
            ("etc/passwd", b"root:x:0:0"),
        ]);

        let mut found = ArtifactSet::default();
        extract_layer(
            gzip(&tar).as_slice(),
            "application/vnd.oci.image.layer.v1.tar+gzip",
            dir.path(),
            &mut found,
        )
        .unwrap();

        assert!(found.complete());
        assert_eq!(
            std::fs::read(dir.path().join(KERNEL_IMAGE)).unwrap(),
            b"kernel bytes"
        );
        assert_eq!(
            std::fs::read(dir.path().join(ROOT_DISK_IMAGE)).unwrap(),
            b"rootfs bytes"
        );
        assert!(!dir.path().join("passwd").exists());
    }

    #[test]
    fn artifacts_accumulate_across_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mut found = ArtifactSet::default();

        let first = tar_with(&[("vmlinuz", b"kernel")]);
        extract_layer(
            gzip(&first).as_slice(),
            "application/vnd.oci.image.layer.v1.tar+gzip",
            dir.path(),
            &mut found,
        )
        .unwrap();
        assert!(found.kernel);
        assert!(!found.complete());

        let second = tar_with(&[("rootfs.squashfs", b"rootfs")]);
        extract_layer(
            gzip(&second).as_slice(),
            "application/vnd.oci.image.layer.v1.tar+gzip",
            dir.path(),
            &mut found,
        )
        .unwrap();
        assert!(found.complete());
    }

    #[test]
    fn plain_tar_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_with(&[("vmlinuz", b"kernel")]);
        let mut found = ArtifactSet::default();
        extract_layer(
            tar.as_slice(),
            "application/vnd.oci.image.layer.v1.tar",
            dir.path(),
            &mut found,
        )
        .unwrap();
        assert!(found.kernel);
    }

    #[test]
    fn counting_reader_reports_totals() {
        let done = Arc::new(AtomicU64::new(0));
        let observer: Arc<dyn PullObserver> = Arc::new(NullObserver);
        let data = vec![0u8; 3 * 1024 * 1024];
        let mut reader = CountingReader::new(data.as_slice(), done.clone(), 0, observer);
        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(done.load(Ordering::Relaxed), data.len() as u64);
    }
}
