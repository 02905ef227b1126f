//! Image building and removal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{ArtifactPointer, ArtifactStore};
use crate::error::{Error, Result};
use crate::tool::{self, FailureKind, ToolRunner};

/// A successfully built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: String,
}

/// Builds images from stored Dockerfiles.
pub struct ImageBuilder {
    tool: Arc<dyn ToolRunner>,
    store: Arc<dyn ArtifactStore>,
}

impl ImageBuilder {
    pub fn new(tool: Arc<dyn ToolRunner>, store: Arc<dyn ArtifactStore>) -> Self {
        Self { tool, store }
    }

    /// Build an image from a Dockerfile artifact.
    ///
    /// The Dockerfile's directory is the build context.
    pub async fn build(&self, build_spec: &ArtifactPointer) -> Result<BuildRecord> {
        let dockerfile = self.store.resolve(build_spec).await?;
        let context = dockerfile
            .parent()
            .ok_or_else(|| Error::Config(format!("no build context for {}", dockerfile.display())))?;

        info!(build_spec = %build_spec, "Building image");

        let args = tool::args([
            "build".to_string(),
            "-q".to_string(),
            "-f".to_string(),
            dockerfile.display().to_string(),
            ".".to_string(),
        ]);
        let output = self
            .tool
            .invoke(&args, None, Some(context))
            .await
            .map_err(|e| Error::Build(Box::new(e)))?;

        let build_id = output.stdout.trim().to_string();
        if build_id.is_empty() {
            return Err(Error::Build(Box::new(Error::Config(
                "image tool printed no image id".to_string(),
            ))));
        }

        info!(build_id = %build_id, "Image built");
        Ok(BuildRecord { build_id })
    }

    /// Remove an image. An image that is already gone is not an error.
    pub async fn remove(&self, build_id: &str) -> Result<()> {
        debug!(build_id = %build_id, "Removing image");

        match self
            .tool
            .invoke(&tool::args(["image", "rm", build_id]), None, None)
            .await
        {
            Ok(_) => {
                info!(build_id = %build_id, "Image removed");
                Ok(())
            }
            Err(e) if tool::classify(&e) == FailureKind::NotFound => {
                debug!(build_id = %build_id, "Image already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
