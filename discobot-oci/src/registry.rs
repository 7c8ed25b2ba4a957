//! OCI Distribution client for boot images.
//!
//! Only the pull side of the protocol is implemented: manifest resolution
//! (including platform selection through an image index) and streaming
//! blob downloads, with the anonymous bearer-token dance public registries
//! require.

use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::{OciError, Result};
use crate::manifest::{
    ImageIndex, OciManifest, Platform, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};

/// Registry assumed for bare image names ("alpine", "myuser/myrepo").
const DOCKER_HUB: &str = "registry-1.docker.io";

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname, possibly with a port (e.g. "ghcr.io",
    /// "localhost:5000").
    pub registry: String,
    /// Repository path within the registry (e.g. "example/img").
    pub repository: String,
    /// What to pull: a tag ("main") or a digest ("sha256:…"). A digest
    /// wins over a tag when the reference carries both.
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Accepts the usual spellings: `alpine`, `alpine:3.20`,
    /// `myuser/myrepo:v2`, `ghcr.io/example/img:main`,
    /// `localhost:5000/img@sha256:…`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(OciError::Reference("empty image reference".to_string()));
        }

        // Everything after '@' is a digest; it takes precedence over any
        // tag also present on the name.
        let (name, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (trimmed, None),
        };

        let mut components: Vec<&str> = name.split('/').collect();

        // Leading component with a dot, a port colon, or "localhost" is a
        // registry host; a bare name like "myuser/myrepo" belongs to
        // Docker Hub.
        let registry = if components.len() > 1 && looks_like_registry_host(components[0]) {
            components.remove(0).to_string()
        } else {
            DOCKER_HUB.to_string()
        };

        // Any tag sits on the final path component.
        let tag = match components.pop() {
            Some(last) => {
                let (bare, tag) = match last.rsplit_once(':') {
                    Some((bare, tag)) => (bare, Some(tag.to_string())),
                    None => (last, None),
                };
                components.push(bare);
                tag
            }
            None => None,
        };

        if components.iter().any(|c| c.is_empty()) {
            return Err(OciError::Reference(format!(
                "malformed repository path in {:?}",
                raw
            )));
        }

        // Official Docker Hub images live under the "library" namespace.
        if registry == DOCKER_HUB && components.len() == 1 {
            components.insert(0, "library");
        }

        let reference = digest
            .or(tag)
            .unwrap_or_else(|| "latest".to_string());

        Ok(Self {
            registry,
            repository: components.join("/"),
            reference,
        })
    }

    /// Base `/v2` repository URL. Loopback registries are assumed to be
    /// plain HTTP (local development); everything else is HTTPS.
    fn repo_url(&self) -> String {
        let host = self.registry.split(':').next().unwrap_or_default();
        let scheme = match host {
            "localhost" | "127.0.0.1" | "::1" => "http",
            _ => "https",
        };
        format!("{}://{}/v2/{}", scheme, self.registry, self.repository)
    }

    /// The default pull scope for this repository.
    fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }
}

fn looks_like_registry_host(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

// ---------------------------------------------------------------------------
// Bearer challenge
// ---------------------------------------------------------------------------

/// A `www-authenticate: Bearer …` challenge.
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    /// Parse the challenge header. Returns `None` unless it is a Bearer
    /// challenge with a realm.
    fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Bearer ")?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for field in split_challenge_fields(params) {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Split `key="value"` fields on commas, ignoring commas inside quotes
/// (a scope value may be `repository:x:pull,push`).
fn split_challenge_fields(params: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(params[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(params[start..].trim());
    fields
}

/// Token endpoint response; some registries use `access_token` instead.
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Pull-only OCI Distribution HTTP client.
pub struct RegistryClient {
    http: reqwest::Client,
}

/// A manifest endpoint serves either a single image manifest or a fat
/// index that needs platform selection. Deserialization tries the index
/// shape first; the two are distinguished by their required fields.
#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Index(ImageIndex),
    Manifest(OciManifest),
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("discobot-oci/0.1")
            .build()
            .map_err(|e| OciError::Registry(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    // -- public API ---------------------------------------------------------

    /// Resolve an image reference to the concrete [`OciManifest`] for
    /// `platform`, following one level of image index if the registry
    /// serves one.
    pub async fn resolve_manifest(
        &self,
        image: &ImageRef,
        platform: &Platform,
    ) -> Result<OciManifest> {
        match self.fetch_manifest_document(image, &image.reference).await? {
            ManifestDocument::Manifest(manifest) => Ok(manifest),
            ManifestDocument::Index(index) => {
                let digest = index.select_platform(platform)?.digest.clone();
                debug!(
                    %digest,
                    os = %platform.os,
                    arch = %platform.architecture,
                    "image index resolved to platform manifest",
                );
                match self.fetch_manifest_document(image, &digest).await? {
                    ManifestDocument::Manifest(manifest) => Ok(manifest),
                    ManifestDocument::Index(_) => Err(OciError::Manifest(format!(
                        "manifest {} is itself an image index",
                        digest
                    ))),
                }
            }
        }
    }

    /// Open a streaming GET for a blob by digest. The caller consumes the
    /// response body incrementally (layers can be multiple gigabytes).
    pub async fn blob_stream(&self, image: &ImageRef, digest: &str) -> Result<reqwest::Response> {
        let url = format!("{}/blobs/{}", image.repo_url(), digest);
        self.get(&url, image, None).await
    }

    // -- internals ----------------------------------------------------------

    async fn fetch_manifest_document(
        &self,
        image: &ImageRef,
        reference: &str,
    ) -> Result<ManifestDocument> {
        let url = format!("{}/manifests/{}", image.repo_url(), reference);
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let body = self.get(&url, image, Some(&accept)).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// GET with the anonymous auth flow: on a 401, fetch a token for the
    /// challenge and retry once with it.
    async fn get(
        &self,
        url: &str,
        image: &ImageRef,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut token: Option<String> = None;
        loop {
            let mut request = self.http.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            match response.status() {
                StatusCode::UNAUTHORIZED if token.is_none() => {
                    token = Some(self.anonymous_token(&response, image).await?);
                }
                StatusCode::NOT_FOUND => return Err(OciError::NotFound(url.to_string())),
                status if status.is_success() => return Ok(response),
                status => {
                    let detail = response.text().await.unwrap_or_default();
                    return Err(OciError::Registry(format!(
                        "GET {} returned {}: {}",
                        url, status, detail
                    )));
                }
            }
        }
    }

    /// Obtain an anonymous pull token for the challenge carried by a 401
    /// response.
    async fn anonymous_token(
        &self,
        denied: &reqwest::Response,
        image: &ImageRef,
    ) -> Result<String> {
        let challenge = denied
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| {
                OciError::Registry(
                    "registry denied access without a usable bearer challenge".to_string(),
                )
            })?;

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        query.push((
            "scope",
            challenge
                .scope
                .clone()
                .unwrap_or_else(|| image.pull_scope()),
        ));

        debug!(realm = %challenge.realm, "requesting anonymous pull token");
        let response = self
            .http
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(OciError::Registry(format!(
                "token endpoint returned {}: {}",
                status, detail
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            OciError::Registry(format!("token endpoint sent an unusable response: {}", e))
        })?;
        Ok(token.token)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
