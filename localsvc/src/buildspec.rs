//! Dockerfile generation for a bundled application artifact.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::artifact::{ArtifactPointer, ArtifactStore};
use crate::config::BuildSpecConfig;
use crate::error::{Error, Result};

/// File name the build definition is stored under.
pub const BUILD_SPEC_NAME: &str = "Dockerfile";

/// Render the Dockerfile for an artifact file name.
///
/// Pure function of the config and `artifact_name`; the output has no
/// trailing newline.
pub fn render(config: &BuildSpecConfig, artifact_name: &str) -> String {
    format!(
        "FROM {base}\nWORKDIR {workdir}\nCOPY [ \"{name}\", \"./\" ]\nCMD [ \"{interp}\", \"./{name}\" ]",
        base = config.base_image,
        workdir = config.workdir,
        name = artifact_name,
        interp = config.interpreter,
    )
}

/// Generates build definitions and stores them as artifacts.
pub struct BuildSpecGenerator {
    store: Arc<dyn ArtifactStore>,
    config: BuildSpecConfig,
}

impl BuildSpecGenerator {
    pub fn new(store: Arc<dyn ArtifactStore>, config: BuildSpecConfig) -> Self {
        Self { store, config }
    }

    /// Render the Dockerfile for `artifact` without storing it.
    pub async fn preview(&self, artifact: &ArtifactPointer) -> Result<String> {
        let resolved = self.store.resolve(artifact).await?;
        Ok(render(&self.config, artifact_file_name(&resolved)?))
    }

    /// Render and store the Dockerfile for `artifact`.
    ///
    /// The stored build definition depends on `artifact`, so resolving it
    /// yields a directory usable as the build context.
    pub async fn generate(&self, artifact: &ArtifactPointer) -> Result<ArtifactPointer> {
        let dockerfile = self.preview(artifact).await?;
        let pointer = self
            .store
            .write(
                dockerfile.as_bytes(),
                BUILD_SPEC_NAME,
                std::slice::from_ref(artifact),
            )
            .await?;

        info!(artifact = %artifact, build_spec = %pointer, "Generated Dockerfile");
        Ok(pointer)
    }
}

fn artifact_file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("artifact has no file name: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FsArtifactStore;
    use tempfile::TempDir;

    #[test]
    fn render_node_dockerfile() {
        let dockerfile = render(&BuildSpecConfig::default(), "bundle.js");
        assert_eq!(
            dockerfile,
            "FROM node:24\n\
             WORKDIR /app\n\
             COPY [ \"bundle.js\", \"./\" ]\n\
             CMD [ \"node\", \"./bundle.js\" ]"
        );
    }

    #[test]
    fn render_respects_config() {
        let config = BuildSpecConfig {
            base_image: "oven/bun:1".to_string(),
            workdir: "/srv".to_string(),
            interpreter: "bun".to_string(),
        };
        let dockerfile = render(&config, "main.js");
        assert!(dockerfile.starts_with("FROM oven/bun:1\nWORKDIR /srv\n"));
        assert!(dockerfile.ends_with("CMD [ \"bun\", \"./main.js\" ]"));
    }

    #[tokio::test]
    async fn generate_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FsArtifactStore::open(temp.path()).await.unwrap());
        let bundle = store.write(b"app", "bundle.js", &[]).await.unwrap();

        let generator = BuildSpecGenerator::new(store.clone(), BuildSpecConfig::default());
        let first = generator.generate(&bundle).await.unwrap();
        let second = generator.generate(&bundle).await.unwrap();
        assert_eq!(first, second);

        let a = std::fs::read(store.resolve(&first).await.unwrap()).unwrap();
        let b = std::fs::read(store.resolve(&second).await.unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, render(&BuildSpecConfig::default(), "bundle.js").into_bytes());
    }

    #[tokio::test]
    async fn generated_dockerfile_sits_next_to_bundle() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FsArtifactStore::open(temp.path()).await.unwrap());
        let bundle = store.write(b"app", "bundle.js", &[]).await.unwrap();

        let generator = BuildSpecGenerator::new(store.clone(), BuildSpecConfig::default());
        let pointer = generator.generate(&bundle).await.unwrap();
        let dockerfile = store.resolve(&pointer).await.unwrap();

        assert_eq!(dockerfile.file_name().unwrap(), BUILD_SPEC_NAME);
        assert!(dockerfile.parent().unwrap().join("bundle.js").exists());
    }

    #[tokio::test]
    async fn bundle_named_like_the_dockerfile_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FsArtifactStore::open(temp.path()).await.unwrap());
        let bundle = store
            .write(b"console.log('js')", BUILD_SPEC_NAME, &[])
            .await
            .unwrap();

        let generator = BuildSpecGenerator::new(store, BuildSpecConfig::default());
        let err = generator.generate(&bundle).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
