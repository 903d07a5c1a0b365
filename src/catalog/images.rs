//! Image registry and reference resolution.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::{ImageRepository, StoreError};

/// Tag assumed when a reference carries none.
const DEFAULT_TAG: &str = "latest";

/// Number of hex characters of the reference digest kept in an image id.
const IMAGE_ID_HASH_LEN: usize = 8;

/// Maximum accepted length of a raw image reference.
const MAX_REFERENCE_LEN: usize = 512;

/// A registered container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Raw reference as registered, e.g. `ubuntu:22.04`.
    pub image: String,
    /// Stable identifier derived from the reference.
    pub image_id: String,
    /// Repository name without registry or tag.
    pub name: String,
    /// Tag or digest.
    pub tag: String,
    /// Registry host, when the reference names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Whether empty references resolve to this image.
    pub is_default: bool,
    /// Email of the user that registered the image.
    pub created_by: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Parsed form of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (`ghcr.io`, `localhost:5000`), if present.
    pub registry: Option<String>,
    /// Repository path, e.g. `library/ubuntu`.
    pub repository: String,
    /// Tag or `sha256:...` digest.
    pub tag: String,
}

impl ImageReference {
    /// Parse a docker-style reference: `[registry/]repository[:tag|@digest]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for empty references, references with
    /// whitespace, or references with an empty repository or tag.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidRequest("image reference is empty".to_owned()));
        }
        if raw.len() > MAX_REFERENCE_LEN || raw.chars().any(char::is_whitespace) {
            return Err(Error::InvalidRequest(format!(
                "invalid image reference {raw:?}"
            )));
        }

        let (path, tag) = if let Some((path, digest)) = raw.split_once('@') {
            (path, digest.to_owned())
        } else {
            let last_slash = raw.rfind('/').map_or(0, |idx| idx.saturating_add(1));
            match raw[last_slash..].rfind(':') {
                Some(colon) => {
                    let split = last_slash.saturating_add(colon);
                    (&raw[..split], raw[split.saturating_add(1)..].to_owned())
                }
                None => (raw, DEFAULT_TAG.to_owned()),
            }
        };

        let (registry, repository) = match path.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_owned()), rest.to_owned())
            }
            _ => (None, path.to_owned()),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "invalid image reference {raw:?}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// Last path segment of the repository (`library/ubuntu` → `ubuntu`).
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(self.repository.as_str())
    }
}

/// Derive the stable image id for a reference.
///
/// The id is a pure function of the trimmed reference string: a readable
/// `<name>-<tag>` stem plus the first hex characters of its SHA-256 digest.
pub fn derive_image_id(reference: &str, parsed: &ImageReference) -> String {
    let digest = hex::encode(Sha256::digest(reference.trim().as_bytes()));
    let short = digest.get(..IMAGE_ID_HASH_LEN).unwrap_or(digest.as_str());
    format!(
        "{}-{}-{short}",
        sanitize(parsed.short_name()),
        sanitize(&parsed.tag)
    )
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Registry of images backed by an [`ImageRepository`].
#[derive(Clone)]
pub struct ImageCatalog {
    repo: Arc<dyn ImageRepository>,
}

impl std::fmt::Debug for ImageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCatalog").finish_non_exhaustive()
    }
}

impl ImageCatalog {
    /// Build a catalog over `repo`.
    pub fn new(repo: Arc<dyn ImageRepository>) -> Self {
        Self { repo }
    }

    /// Register a new image.
    ///
    /// When `set_default` is true the image becomes the single default image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for malformed references,
    /// [`Error::Conflict`] if the reference is already registered, and
    /// [`Error::Unavailable`] on repository failure.
    pub async fn register_image(
        &self,
        owner: &str,
        reference: &str,
        set_default: bool,
    ) -> Result<ImageInfo> {
        let reference = reference.trim();
        let parsed = ImageReference::parse(reference)?;
        let image = ImageInfo {
            image: reference.to_owned(),
            image_id: derive_image_id(reference, &parsed),
            name: parsed.repository.clone(),
            tag: parsed.tag.clone(),
            registry: parsed.registry.clone(),
            is_default: false,
            created_by: owner.to_owned(),
            created_at: Utc::now(),
        };

        self.repo
            .register_image(&image)
            .await
            .map_err(|err| match err {
                StoreError::Duplicate(_) => {
                    Error::Conflict(format!("image {reference} is already registered"))
                }
                other => Error::unavailable("registering image", other),
            })?;

        info!(image = %image.image, image_id = %image.image_id, owner, "image registered");

        if set_default {
            return self.set_default_image(&image.image_id).await;
        }
        Ok(image)
    }

    /// Mark an image as the default, clearing the flag on every other image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown images.
    pub async fn set_default_image(&self, id_or_reference: &str) -> Result<ImageInfo> {
        let mut image = self.get_image(id_or_reference).await?;
        let updated = self
            .repo
            .set_default_image(&image.image_id)
            .await
            .map_err(|err| Error::unavailable("setting default image", err))?;
        if !updated {
            return Err(Error::not_found("image", id_or_reference));
        }
        image.is_default = true;
        info!(image_id = %image.image_id, "default image changed");
        Ok(image)
    }

    /// Every registered image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] on repository failure.
    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.repo
            .list_images()
            .await
            .map_err(|err| Error::unavailable("listing images", err))
    }

    /// Look up an image by exact reference or by image id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when neither matches.
    pub async fn get_image(&self, id_or_reference: &str) -> Result<ImageInfo> {
        let key = id_or_reference.trim();
        if let Some(image) = self
            .repo
            .get_image_by_reference(key)
            .await
            .map_err(|err| Error::unavailable("loading image", err))?
        {
            return Ok(image);
        }
        self.repo
            .get_image(key)
            .await
            .map_err(|err| Error::unavailable("loading image", err))?
            .ok_or_else(|| Error::not_found("image", key))
    }

    /// Remove an image from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown images.
    pub async fn remove_image(&self, id_or_reference: &str) -> Result<ImageInfo> {
        let image = self.get_image(id_or_reference).await?;
        let removed = self
            .repo
            .remove_image(&image.image_id)
            .await
            .map_err(|err| Error::unavailable("removing image", err))?;
        if !removed {
            return Err(Error::not_found("image", id_or_reference));
        }
        info!(image_id = %image.image_id, "image removed");
        Ok(image)
    }

    /// Resolve a user-supplied reference to a registered image.
    ///
    /// An empty or blank reference selects the default image. Any other value
    /// must match a registered reference (or image id) exactly; unregistered
    /// images are never run implicitly. The returned id is stable across calls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no default is configured or the
    /// reference was never registered.
    pub async fn resolve_image(&self, reference: &str) -> Result<ImageInfo> {
        let reference = reference.trim();
        if reference.is_empty() {
            let image = self
                .repo
                .get_default_image()
                .await
                .map_err(|err| Error::unavailable("loading default image", err))?
                .ok_or_else(|| Error::not_found("default image", "<none configured>"))?;
            debug!(image_id = %image.image_id, "resolved default image");
            return Ok(image);
        }

        let image = self.get_image(reference).await?;
        debug!(reference, image_id = %image.image_id, "resolved image");
        Ok(image)
    }
}
