//! Registry pull and push for daemonless units
//!
//! Pulls write a `docker save` style archive to `build/base-image.tar` so
//! the daemonless backend never talks to the network while building.
//! Pushes upload `build/image.tar` as an OCI image and report the
//! manifest digest. Credentials come from `STRATUM_REGISTRY_USERNAME` and
//! `STRATUM_REGISTRY_PASSWORD` when both are set.

use std::path::Path;

use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{
    ImageIndexEntry, IMAGE_CONFIG_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::{debug, info, warn};

use crate::core::lock::Architecture;
use crate::core::retry::RetryPolicy;
use crate::error::{ArchiveError, RegistryError, StratumError};
use crate::infra::archive::{ImageArchive, ManifestEntry};
use crate::infra::extract::ZSTD_MAGIC;
use crate::infra::filesystem;

/// zstd compressed OCI layer
const IMAGE_LAYER_ZSTD_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

const ENV_USERNAME: &str = "STRATUM_REGISTRY_USERNAME";
const ENV_PASSWORD: &str = "STRATUM_REGISTRY_PASSWORD";

/// Registry credentials from the environment, anonymous otherwise
pub fn auth_from_env() -> RegistryAuth {
    match (std::env::var(ENV_USERNAME), std::env::var(ENV_PASSWORD)) {
        (Ok(user), Ok(password)) => RegistryAuth::Basic(user, password),
        _ => RegistryAuth::Anonymous,
    }
}

/// Parse an image reference
pub fn parse_reference(reference: &str) -> Result<Reference, RegistryError> {
    reference
        .parse::<Reference>()
        .map_err(|e| RegistryError::InvalidReference {
            reference: reference.to_string(),
            error: e.to_string(),
        })
}

/// Media type of a layer blob, by magic number
pub fn layer_media_type(blob: &[u8]) -> &'static str {
    if blob.starts_with(&[0x1f, 0x8b]) {
        IMAGE_LAYER_GZIP_MEDIA_TYPE
    } else if blob.len() >= 4 && u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) == ZSTD_MAGIC {
        IMAGE_LAYER_ZSTD_MEDIA_TYPE
    } else {
        IMAGE_LAYER_MEDIA_TYPE
    }
}

fn platform_resolver(
    architecture: Architecture,
) -> impl Fn(&[ImageIndexEntry]) -> Option<String> + Send + Sync + 'static {
    move |manifests: &[ImageIndexEntry]| {
        manifests
            .iter()
            .find(|entry| {
                entry.platform.as_ref().is_some_and(|p| {
                    p.os == "linux" && p.architecture == architecture.docker_name()
                })
            })
            .map(|entry| entry.digest.clone())
    }
}

/// Registry client for one target architecture
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
    retry: RetryPolicy,
}

impl RegistryClient {
    pub fn new(architecture: Architecture) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(platform_resolver(architecture))),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: auth_from_env(),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pull `reference` into a `docker save` style archive at `archive`
    ///
    /// Transient failures are retried; the archive is only written once
    /// every blob has been fetched.
    pub async fn pull_to_archive(&self, reference: &str, archive: &Path) -> Result<String, StratumError> {
        let parsed = parse_reference(reference)?;
        let (bytes, digest) = self
            .retry
            .retry_async(
                || self.fetch_archive(&parsed, reference),
                |attempt, e| warn!("Pull attempt {} of {} failed: {}", attempt, reference, e),
            )
            .await?;
        filesystem::write_atomic(archive, &bytes)?;
        info!("Pulled {} ({}) into {}", reference, digest, archive.display());
        Ok(digest)
    }

    async fn fetch_archive(&self, reference: &Reference, tag: &str) -> Result<(Vec<u8>, String), RegistryError> {
        let failed = |e: String| RegistryError::PullFailed {
            reference: tag.to_string(),
            error: e,
        };
        let (manifest, digest) = self
            .client
            .pull_image_manifest(reference, &self.auth)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let mut config = Vec::new();
        self.client
            .pull_blob(reference, &manifest.config, &mut config)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let mut blobs = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            debug!("Pulling layer {} ({} bytes)", layer.digest, layer.size);
            let mut data = Vec::new();
            self.client
                .pull_blob(reference, layer, &mut data)
                .await
                .map_err(|e| failed(e.to_string()))?;
            blobs.push((layer.digest.trim_start_matches("sha256:").to_string(), data));
        }

        let config_name = format!(
            "blobs/sha256/{}",
            manifest.config.digest.trim_start_matches("sha256:")
        );
        let entry = ManifestEntry {
            config: config_name.clone(),
            repo_tags: vec![tag.to_string()],
            layers: blobs
                .iter()
                .map(|(hex, _)| format!("blobs/sha256/{hex}"))
                .collect(),
        };
        let manifest_json = serde_json::to_vec(&vec![entry]).map_err(|e| failed(e.to_string()))?;

        let mut builder = tar::Builder::new(Vec::new());
        let mut append = |name: &str, data: &[u8]| -> std::io::Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(crate::config::defaults::LAYER_ENTRY_MTIME);
            builder.append_data(&mut header, name, data)
        };
        append(&config_name, &config).map_err(|e| failed(e.to_string()))?;
        for (hex, data) in &blobs {
            append(&format!("blobs/sha256/{hex}"), data).map_err(|e| failed(e.to_string()))?;
        }
        append("manifest.json", &manifest_json).map_err(|e| failed(e.to_string()))?;
        let bytes = builder.into_inner().map_err(|e| failed(e.to_string()))?;
        Ok((bytes, digest))
    }

    /// Push an image archive as `reference`, returning the manifest digest
    pub async fn push_archive(&self, archive: &Path, reference: &str) -> Result<String, StratumError> {
        let parsed = parse_reference(reference)?;
        let image = ImageArchive::open(archive)?;
        let failed = |e: String| RegistryError::PushFailed {
            reference: reference.to_string(),
            error: e,
        };

        let mut layers = Vec::new();
        for path in image.layer_paths()? {
            let data = std::fs::read(&path).map_err(|e| ArchiveError::Io {
                path: path.clone(),
                error: e.to_string(),
            })?;
            let media_type = layer_media_type(&data);
            layers.push(ImageLayer::new(data, media_type.to_string(), None));
        }
        let config = Config::new(
            image.config_bytes().to_vec(),
            IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            None,
        );

        info!("Pushing {} ({} layers)", reference, layers.len());
        let response = self
            .client
            .push(&parsed, &layers, config, &self.auth, None)
            .await
            .map_err(|e| failed(e.to_string()))?;
        debug!("Pushed manifest to {}", response.manifest_url);

        let digest = self
            .client
            .fetch_manifest_digest(&parsed, &self.auth)
            .await
            .map_err(|e| failed(e.to_string()))?;
        Ok(digest)
    }
}
