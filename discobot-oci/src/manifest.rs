use serde::{Deserialize, Serialize};

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json or
/// application/vnd.docker.distribution.manifest.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

impl OciManifest {
    /// Sum of the compressed layer sizes, used as the download total.
    pub fn total_layer_bytes(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: u64,

    #[serde(default)]
    pub platform: Option<Platform>,
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    /// The platform of the guest we boot: always Linux, host architecture.
    pub fn linux_host_arch() -> Self {
        Self {
            architecture: host_arch().to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI / Docker platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Image Index (fat manifest)
// ---------------------------------------------------------------------------

/// An OCI image index (application/vnd.oci.image.index.v1+json or
/// application/vnd.docker.distribution.manifest.list.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Select the descriptor whose platform matches the given target.
    pub fn select_platform(&self, target: &Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| {
                if let Some(ref p) = d.platform {
                    p.architecture == target.architecture
                        && p.os == target.os
                        && (target.variant.is_none() || p.variant == target.variant)
                } else {
                    false
                }
            })
            .ok_or_else(|| {
                OciError::Manifest(format!(
                    "no manifest found for platform {}/{}",
                    target.os, target.architecture,
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Cache record
// ---------------------------------------------------------------------------

/// The `manifest.json` written next to the extracted artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub image_ref: String,
    pub digest: String,
    pub pulled_at: String,
    pub total_bytes: u64,
}

impl ManifestRecord {
    pub fn new(image_ref: &str, digest: &str, total_bytes: u64) -> Self {
        Self {
            image_ref: image_ref.to_string(),
            digest: digest.to_string(),
            pulled_at: humantime::format_rfc3339(std::time::SystemTime::now()).to_string(),
            total_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:aaaa",
            "size": 1234
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:bbbb",
                "size": 5678
            },
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:cccc",
                "size": 91011
            }
        ]
    }"#;

    #[test]
    fn parse_manifest_and_total() {
        let m: OciManifest = serde_json::from_str(SAMPLE_MANIFEST).unwrap();
        assert_eq!(m.schema_version, 2);
        assert_eq!(m.layers.len(), 2);
        assert_eq!(m.total_layer_bytes(), 5678 + 91011);
    }

    const SAMPLE_INDEX: &str = r#"{
        "schemaVersion": 2,
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:amd64digest",
                "size": 100,
                "platform": { "architecture": "amd64", "os": "linux" }
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:arm64digest",
                "size": 200,
                "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" }
            }
        ]
    }"#;

    #[test]
    fn select_platform_amd64() {
        let idx: ImageIndex = serde_json::from_str(SAMPLE_INDEX).unwrap();
        let target = Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        };
        assert_eq!(idx.select_platform(&target).unwrap().digest, "sha256:amd64digest");
    }

    #[test]
    fn select_platform_missing() {
        let idx: ImageIndex = serde_json::from_str(SAMPLE_INDEX).unwrap();
        let target = Platform {
            architecture: "s390x".to_string(),
            os: "linux".to_string(),
            variant: None,
        };
        assert!(idx.select_platform(&target).is_err());
    }

    #[test]
    fn linux_host_arch_is_linux() {
        assert_eq!(Platform::linux_host_arch().os, "linux");
    }

    #[test]
    fn manifest_record_round_trip() {
        let rec = ManifestRecord::new("ghcr.io/example/img:main", "abc123", 42);
        let json = serde_json::to_string(&rec).unwrap();
        let back: ManifestRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.image_ref, "ghcr.io/example/img:main");
        assert_eq!(back.digest, "abc123");
        assert_eq!(back.total_bytes, 42);
    }
}
