//! Execution-time `use` checks for images and secrets.
//!
//! These checks are separate from the collection-level `read`/`create`/`delete`
//! checks applied at the boundary: a role may be allowed to *use* an image or a
//! secret in an execution without being allowed to browse the catalog, and the
//! other way round.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Action, Enforcer, ResourceKind};
use crate::catalog::images::ImageInfo;
use crate::error::{Error, Result};
use crate::execution::ExecutionRequest;

/// Proof that a subject passed the resource checks for one request.
///
/// Only [`ResourceAccessValidator`] can build one, and
/// [`crate::execution::orchestrator::ExecutionOrchestrator::run_command`] requires
/// one, so compute can never be provisioned for a request that was not validated.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    subject: String,
    image: Option<ImageInfo>,
    secrets: Vec<String>,
}

impl AccessGrant {
    /// Subject the grant was issued to.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The validated image, if the request resolved one.
    pub fn image(&self) -> Option<&ImageInfo> {
        self.image.as_ref()
    }

    /// Validated secret names, trimmed, blanks removed, request order preserved.
    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }
}

/// Asks the enforcer whether a subject may `use` each referenced resource.
#[derive(Clone)]
pub struct ResourceAccessValidator {
    enforcer: Arc<dyn Enforcer>,
}

impl std::fmt::Debug for ResourceAccessValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAccessValidator").finish_non_exhaustive()
    }
}

impl ResourceAccessValidator {
    /// Build a validator over `enforcer`.
    pub fn new(enforcer: Arc<dyn Enforcer>) -> Self {
        Self { enforcer }
    }

    /// Check `use` access to the resolved image and to every requested secret.
    ///
    /// Secrets are checked in request order after trimming; blank names are
    /// skipped without consulting the enforcer. The first denial stops the walk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] naming the image or the first denied secret.
    /// Enforcer failures are also reported as forbidden for that resource.
    pub fn validate_execution_resource_access(
        &self,
        subject: &str,
        request: &ExecutionRequest,
        resolved_image: Option<&ImageInfo>,
    ) -> Result<AccessGrant> {
        if let Some(image) = resolved_image {
            let object = ResourceKind::Images.instance_path(&image.image_id);
            if !self.check_use(subject, &object) {
                return Err(Error::forbidden_resource(
                    format!("you do not have permission to use image {}", image.image_id),
                    image.image_id.clone(),
                ));
            }
        }

        let mut secrets = Vec::with_capacity(request.secrets.len());
        for raw in &request.secrets {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            let object = ResourceKind::Secrets.instance_path(name);
            if !self.check_use(subject, &object) {
                return Err(Error::forbidden_resource(
                    format!("you do not have permission to use secret {name}"),
                    name,
                ));
            }
            secrets.push(name.to_owned());
        }

        debug!(
            subject,
            image = resolved_image.map(|image| image.image_id.as_str()),
            secrets = secrets.len(),
            "execution resources authorized"
        );

        Ok(AccessGrant {
            subject: subject.to_owned(),
            image: resolved_image.cloned(),
            secrets,
        })
    }

    fn check_use(&self, subject: &str, object: &str) -> bool {
        self.enforcer
            .enforce(subject, object, Action::Use)
            .unwrap_or_else(|err| {
                warn!(subject, object, error = %err, "authorization lookup failed");
                false
            })
    }
}
