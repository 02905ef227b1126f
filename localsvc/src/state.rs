//! Persisted service state.
//!
//! One JSON file per service under the state directory, written after a
//! successful start and removed after teardown.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::ArtifactPointer;
use crate::daemon::{InstanceRecord, ServiceSpec};
use crate::error::{Error, Result};
use crate::probe::HealthCheckResult;

/// Everything needed to find and tear down a running service later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub name: String,
    pub build_spec: ArtifactPointer,
    pub spec: ServiceSpec,
    pub instance: InstanceRecord,
    #[serde(default)]
    pub health: Option<HealthCheckResult>,
}

fn state_path(dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || name.starts_with('.')
    {
        return Err(Error::Config(format!("invalid service name: {name:?}")));
    }
    Ok(dir.join(format!("{name}.json")))
}

impl ServiceState {
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = state_path(dir, &self.name)?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(dir.display().to_string(), e))?;
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::io(path.display().to_string(), e.into()))?;
        tokio::fs::write(&path, raw)
            .await
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        debug!(path = %path.display(), "Saved service state");
        Ok(())
    }

    /// Load the state of service `name`, or `None` if there is none.
    pub async fn load(dir: &Path, name: &str) -> Result<Option<Self>> {
        let path = state_path(dir, name)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path.display().to_string(), e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| Error::io(path.display().to_string(), e.into()))
    }

    /// Remove the state of service `name`. Missing state is not an error.
    pub async fn remove(dir: &Path, name: &str) -> Result<()> {
        let path = state_path(dir, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path.display().to_string(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ServiceState {
        ServiceState {
            name: "web".to_string(),
            build_spec: ArtifactPointer::new(format!("sha256:{}", "a".repeat(64))),
            spec: ServiceSpec::new("localhost")
                .port(8090, 3000)
                .env("FOO", "bar")
                .env_opt("UNSET", None),
            instance: InstanceRecord {
                build_id: "sha256:img".to_string(),
                instance_id: "c0ffee".to_string(),
                hostname: "localhost".to_string(),
            },
            health: None,
        }
    }

    #[tokio::test]
    async fn save_load_remove() {
        let dir = TempDir::new().unwrap();
        let state = sample();

        assert!(ServiceState::load(dir.path(), "web").await.unwrap().is_none());

        state.save(dir.path()).await.unwrap();
        let loaded = ServiceState::load(dir.path(), "web").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        // Binding order survives the round trip through JSON.
        assert_eq!(loaded.spec.run_args("img"), state.spec.run_args("img"));

        ServiceState::remove(dir.path(), "web").await.unwrap();
        ServiceState::remove(dir.path(), "web").await.unwrap();
        assert!(ServiceState::load(dir.path(), "web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        for name in ["", "../escape", "a/b", ".hidden"] {
            assert!(
                ServiceState::load(dir.path(), name).await.is_err(),
                "{name}"
            );
        }
    }
}
