//! Artifact storage.
//!
//! The lifecycle components only need two things from an artifact store:
//! resolve a pointer to a local file, and write new content that depends on
//! existing artifacts. [`FsArtifactStore`] is a content-addressed local
//! implementation:
//!
//! ```text
//! blobs/sha256/<digest>     # file content, deduplicated
//! meta/<id>.json            # name, blob digest, dependency pointers
//! resolved/<id>/<name>      # materialized file plus its direct dependencies
//! ```
//!
//! Resolving an artifact places its dependencies next to it by file name,
//! so a Dockerfile resolved from the store has the bundle it copies in the
//! same directory.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

const POINTER_PREFIX: &str = "sha256:";

/// Opaque reference to immutable content in an artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactPointer(String);

impl ArtifactPointer {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactPointer {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Artifact store seam consumed by the lifecycle components.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Resolve a pointer to an absolute local path.
    async fn resolve(&self, pointer: &ArtifactPointer) -> Result<PathBuf>;

    /// Store `data` under file name `name`, declaring `dependencies`.
    async fn write(
        &self,
        data: &[u8],
        name: &str,
        dependencies: &[ArtifactPointer],
    ) -> Result<ArtifactPointer>;
}

/// Per-artifact metadata persisted next to the blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMeta {
    name: String,
    blob_digest: String,
    #[serde(default)]
    dependencies: Vec<ArtifactPointer>,
}

/// Content-addressed artifact store on the local filesystem.
pub struct FsArtifactStore {
    blobs_dir: PathBuf,
    meta_dir: PathBuf,
    resolved_dir: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create if needed) a store rooted at `base_dir`.
    ///
    /// The root is canonicalized so resolved paths are absolute.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        tokio::fs::create_dir_all(base_dir)
            .await
            .map_err(|e| Error::artifact(base_dir.display().to_string(), e))?;
        let base_dir = tokio::fs::canonicalize(base_dir)
            .await
            .map_err(|e| Error::artifact(base_dir.display().to_string(), e))?;
        let store = Self {
            blobs_dir: base_dir.join("blobs").join("sha256"),
            meta_dir: base_dir.join("meta"),
            resolved_dir: base_dir.join("resolved"),
        };
        for dir in [&store.blobs_dir, &store.meta_dir, &store.resolved_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::artifact(dir.display().to_string(), e))?;
        }
        Ok(store)
    }

    /// Copy an existing file (e.g. a pre-built bundle) into the store.
    pub async fn import(&self, path: impl AsRef<Path>) -> Result<ArtifactPointer> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("not a file path: {}", path.display())))?
            .to_string();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::artifact(path.display().to_string(), e))?;
        self.write(&data, &name, &[]).await
    }

    fn artifact_id(name: &str, blob_digest: &str, dependencies: &[ArtifactPointer]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(blob_digest.as_bytes());
        for dep in dependencies {
            hasher.update([0u8]);
            hasher.update(dep.as_str().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn parse_pointer(pointer: &ArtifactPointer) -> Result<&str> {
        pointer
            .as_str()
            .strip_prefix(POINTER_PREFIX)
            .filter(|id| id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| {
                Error::artifact(
                    pointer.as_str(),
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "malformed pointer"),
                )
            })
    }

    async fn read_meta(&self, pointer: &ArtifactPointer) -> Result<ArtifactMeta> {
        let id = Self::parse_pointer(pointer)?;
        let raw = tokio::fs::read(self.meta_dir.join(format!("{id}.json")))
            .await
            .map_err(|e| Error::artifact(pointer.as_str(), e))?;
        serde_json::from_slice(&raw).map_err(|e| Error::artifact(pointer.as_str(), e.into()))
    }

    /// Copy a blob to `dest` unless it is already there.
    ///
    /// The copy lands in a hidden sibling first and is renamed into place, so
    /// `dest` only ever holds complete content.
    async fn materialize(&self, meta: &ArtifactMeta, dest: &Path) -> Result<()> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            return Ok(());
        }
        let partial = dest.with_file_name(format!(".{}.partial", meta.name));
        tokio::fs::copy(self.blobs_dir.join(&meta.blob_digest), &partial)
            .await
            .map_err(|e| Error::artifact(partial.display().to_string(), e))?;
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| Error::artifact(dest.display().to_string(), e))?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn resolve(&self, pointer: &ArtifactPointer) -> Result<PathBuf> {
        let meta = self.read_meta(pointer).await?;
        let dir = self.resolved_dir.join(Self::parse_pointer(pointer)?);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::artifact(pointer.as_str(), e))?;

        for dep in &meta.dependencies {
            let dep_meta = self.read_meta(dep).await?;
            self.materialize(&dep_meta, &dir.join(&dep_meta.name)).await?;
        }

        let path = dir.join(&meta.name);
        self.materialize(&meta, &path).await?;
        debug!(pointer = %pointer, path = %path.display(), "Resolved artifact");
        Ok(path)
    }

    async fn write(
        &self,
        data: &[u8],
        name: &str,
        dependencies: &[ArtifactPointer],
    ) -> Result<ArtifactPointer> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::Config(format!("invalid artifact name: {name:?}")));
        }
        // Dependencies must exist and must not collide by name once resolve
        // places them in one directory.
        let mut names = HashSet::new();
        for dep in dependencies {
            let dep_meta = self.read_meta(dep).await?;
            if dep_meta.name == name || !names.insert(dep_meta.name.clone()) {
                return Err(Error::Config(format!(
                    "dependency {dep} is named {:?}, which collides with another file of {name:?}",
                    dep_meta.name
                )));
            }
        }

        let blob_digest = format!("{:x}", Sha256::digest(data));
        let blob_path = self.blobs_dir.join(&blob_digest);
        if !tokio::fs::try_exists(&blob_path).await.unwrap_or(false) {
            tokio::fs::write(&blob_path, data)
                .await
                .map_err(|e| Error::artifact(blob_digest.clone(), e))?;
        }

        let id = Self::artifact_id(name, &blob_digest, dependencies);
        let pointer = ArtifactPointer::new(format!("{POINTER_PREFIX}{id}"));
        let meta = ArtifactMeta {
            name: name.to_string(),
            blob_digest,
            dependencies: dependencies.to_vec(),
        };
        let raw = serde_json::to_vec_pretty(&meta)
            .map_err(|e| Error::artifact(pointer.as_str(), e.into()))?;
        tokio::fs::write(self.meta_dir.join(format!("{id}.json")), raw)
            .await
            .map_err(|e| Error::artifact(pointer.as_str(), e))?;

        debug!(pointer = %pointer, name = %name, size = data.len(), "Stored artifact");
        Ok(pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_is_content_addressed() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let a = store.write(b"console.log(1)", "bundle.js", &[]).await.unwrap();
        let b = store.write(b"console.log(1)", "bundle.js", &[]).await.unwrap();
        let c = store.write(b"console.log(2)", "bundle.js", &[]).await.unwrap();
        let d = store.write(b"console.log(1)", "other.js", &[]).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.as_str().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn resolve_places_dependencies_alongside() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let bundle = store.write(b"app", "bundle.js", &[]).await.unwrap();
        let dockerfile = store
            .write(b"FROM node:24", "Dockerfile", &[bundle.clone()])
            .await
            .unwrap();

        let path = store.resolve(&dockerfile).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "Dockerfile");
        assert_eq!(std::fs::read(&path).unwrap(), b"FROM node:24");

        let sibling = path.parent().unwrap().join("bundle.js");
        assert_eq!(std::fs::read(sibling).unwrap(), b"app");

        let bundle_path = store.resolve(&bundle).await.unwrap();
        assert_eq!(bundle_path.file_name().unwrap(), "bundle.js");
        assert!(bundle_path.is_absolute());
    }

    #[tokio::test]
    async fn write_rejects_unknown_dependency() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();
        let missing = ArtifactPointer::new(format!("sha256:{}", "0".repeat(64)));

        let err = store.write(b"x", "Dockerfile", &[missing]).await.unwrap_err();
        assert!(matches!(err, Error::Artifact { .. }));
    }

    #[tokio::test]
    async fn write_rejects_dependency_name_collisions() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let js = store.write(b"console.log('js')", "Dockerfile", &[]).await.unwrap();
        let err = store
            .write(b"FROM node:24", "Dockerfile", &[js])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let a = store.write(b"a", "bundle.js", &[]).await.unwrap();
        let b = store.write(b"b", "bundle.js", &[]).await.unwrap();
        let err = store
            .write(b"FROM node:24", "Dockerfile", &[a, b])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn resolve_replaces_leftover_partial_copy() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();
        let bundle = store.write(b"complete", "bundle.js", &[]).await.unwrap();

        // An interrupted copy from an earlier resolve.
        let dir = temp
            .path()
            .canonicalize()
            .unwrap()
            .join("resolved")
            .join(bundle.as_str().trim_start_matches("sha256:"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(".bundle.js.partial"), b"comp").unwrap();

        let path = store.resolve(&bundle).await.unwrap();
        assert_eq!(path, dir.join("bundle.js"));
        assert_eq!(std::fs::read(&path).unwrap(), b"complete");
        assert!(!dir.join(".bundle.js.partial").exists());
    }

    #[tokio::test]
    async fn resolve_rejects_malformed_pointer() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let err = store.resolve(&"app/bundle.js".into()).await.unwrap_err();
        assert!(matches!(err, Error::Artifact { .. }));
    }

    #[tokio::test]
    async fn import_keeps_file_name() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path().join("store")).await.unwrap();
        let src = temp.path().join("bundle.js");
        std::fs::write(&src, b"require('http')").unwrap();

        let pointer = store.import(&src).await.unwrap();
        let resolved = store.resolve(&pointer).await.unwrap();
        assert_eq!(resolved.file_name().unwrap(), "bundle.js");
        assert_eq!(std::fs::read(resolved).unwrap(), b"require('http')");
    }
}
