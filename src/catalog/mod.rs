//! Catalog of registered container images and named secrets.
//!
//! Images must be registered before they can be used by an execution; secrets are
//! referenced by name only and their values never pass through the orchestrator.

pub mod images;
pub mod secrets;

pub use images::{ImageCatalog, ImageInfo, ImageReference};
pub use secrets::{Secret, SecretCatalog, SecretMetadata};
