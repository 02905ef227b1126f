//! Container instance lifecycle.
//!
//! A [`DaemonManager`] owns one service: it builds the image, runs a single
//! instance from it, and removes that instance on teardown.
//!
//! ```text
//! Absent ──create──▶ Building ──run ok──▶ Running ──delete──▶ Removed
//!                       │
//!                       └──build/run failed──▶ Failed
//! ```
//!
//! A failed run removes the image that was just built. Delete tolerates an
//! instance that is already gone.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactPointer;
use crate::error::{Error, Result};
use crate::image::{BuildRecord, ImageBuilder};
use crate::rollback::Staged;
use crate::tool::{self, FailureKind, ToolRunner};

/// Declarative configuration of one service instance.
///
/// Maps keep insertion order, which is the order flags are passed to the
/// image tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Host endpoint -> container endpoint.
    #[serde(default)]
    pub ports: IndexMap<String, String>,
    /// Entries without a value are not passed to the container.
    #[serde(default)]
    pub env: IndexMap<String, Option<String>>,
    /// Host path -> container path.
    #[serde(default)]
    pub volumes: IndexMap<String, String>,
    pub hostname: String,
}

impl ServiceSpec {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn port(mut self, host: impl ToString, container: impl ToString) -> Self {
        self.ports.insert(host.to_string(), container.to_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.insert(key.into(), Some(value.to_string()));
        self
    }

    pub fn env_opt(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.env.insert(key.into(), value);
        self
    }

    pub fn volume(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.volumes.insert(host.into(), container.into());
        self
    }

    /// Arguments for `run`, ending with the image to run.
    pub fn run_args(&self, build_id: &str) -> Vec<String> {
        let mut args = tool::args(["run", "-d"]);
        for (host, container) in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{host}:{container}"));
        }
        for (key, value) in &self.env {
            if let Some(value) = value {
                args.push("-e".to_string());
                args.push(format!("{key}={value}"));
            }
        }
        for (host, container) in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{host}:{container}"));
        }
        args.push(build_id.to_string());
        args
    }
}

/// A running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub build_id: String,
    pub instance_id: String,
    pub hostname: String,
}

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Absent,
    Building,
    Running(InstanceRecord),
    Removed,
    Failed(String),
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Absent => write!(f, "absent"),
            DaemonState::Building => write!(f, "building"),
            DaemonState::Running(record) => write!(f, "running ({})", record.instance_id),
            DaemonState::Removed => write!(f, "removed"),
            DaemonState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Builds, runs and removes the single instance of one service.
pub struct DaemonManager {
    name: String,
    build_spec: ArtifactPointer,
    tool: Arc<dyn ToolRunner>,
    images: Arc<ImageBuilder>,
    state: DaemonState,
}

impl DaemonManager {
    pub fn new(
        name: impl Into<String>,
        build_spec: ArtifactPointer,
        tool: Arc<dyn ToolRunner>,
        images: Arc<ImageBuilder>,
    ) -> Self {
        Self {
            name: name.into(),
            build_spec,
            tool,
            images,
            state: DaemonState::Absent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn build_spec(&self) -> &ArtifactPointer {
        &self.build_spec
    }

    /// Build the image and start one instance of it.
    ///
    /// If the instance fails to start, the image is removed before the run
    /// error is returned.
    pub async fn create(&mut self, spec: &ServiceSpec) -> Result<InstanceRecord> {
        match &self.state {
            // Building outlives a create only when that create was dropped
            // mid-flight.
            DaemonState::Absent
            | DaemonState::Building
            | DaemonState::Removed
            | DaemonState::Failed(_) => {}
            other => {
                return Err(Error::InvalidState {
                    expected: "absent, building, removed or failed".to_string(),
                    actual: other.to_string(),
                });
            }
        }

        info!(service = %self.name, build_spec = %self.build_spec, "Creating service");
        self.state = DaemonState::Building;

        let build = match self.images.build(&self.build_spec).await {
            Ok(build) => build,
            Err(e) => {
                error!(service = %self.name, error = %e, "Image build failed");
                self.state = DaemonState::Failed(e.to_string());
                return Err(e);
            }
        };

        let staged = self.stage_image(build);
        let build_id = staged.value().build_id.clone();

        let result = staged.commit(self.run_instance(spec, &build_id)).await;
        match result {
            Ok((build, instance_id)) => {
                let record = InstanceRecord {
                    build_id: build.build_id,
                    instance_id,
                    hostname: spec.hostname.clone(),
                };
                info!(
                    service = %self.name,
                    instance_id = %record.instance_id,
                    build_id = %record.build_id,
                    "Service running"
                );
                self.state = DaemonState::Running(record.clone());
                Ok(record)
            }
            Err(e) => {
                let err = Error::DaemonStart {
                    build_id,
                    source: Box::new(e),
                };
                error!(service = %self.name, error = %err, "Instance failed to start");
                self.state = DaemonState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Force-remove an instance. An instance that is already stopped or gone
    /// counts as removed.
    ///
    /// Never removes the instance's image.
    pub async fn delete(&mut self, record: &InstanceRecord) -> Result<()> {
        info!(service = %self.name, instance_id = %record.instance_id, "Removing instance");

        let args = tool::args(["rm", "-f", record.instance_id.as_str()]);
        match self.tool.invoke(&args, None, None).await {
            Ok(_) => {}
            Err(e) if tool::classify(&e) == FailureKind::NotFound => {
                debug!(
                    service = %self.name,
                    instance_id = %record.instance_id,
                    "Instance already gone"
                );
            }
            Err(e) => {
                let err = Error::DaemonStop {
                    instance_id: record.instance_id.clone(),
                    source: Box::new(e),
                };
                error!(service = %self.name, error = %err, "Failed to remove instance");
                self.state = DaemonState::Failed(err.to_string());
                return Err(err);
            }
        }

        self.state = DaemonState::Removed;
        Ok(())
    }

    /// Stage the built image with its removal as the compensating action.
    fn stage_image(&self, build: BuildRecord) -> Staged<BuildRecord> {
        let runner = Arc::clone(&self.tool);
        let images = Arc::clone(&self.images);
        let build_id = build.build_id.clone();
        let service = self.name.clone();
        Staged::new(build, "remove image", move || async move {
            warn!(service = %service, build_id = %build_id, "Rolling back built image");
            remove_leftover_instances(runner.as_ref(), &build_id).await;
            images.remove(&build_id).await
        })
    }

    async fn run_instance(&self, spec: &ServiceSpec, build_id: &str) -> Result<String> {
        let output = self
            .tool
            .invoke(&spec.run_args(build_id), None, None)
            .await?;
        let instance_id = output.stdout.trim().to_string();
        if instance_id.is_empty() {
            return Err(Error::ToolInvocation {
                tool: "image tool".to_string(),
                command: "run".to_string(),
                exit_code: Some(0),
                message: "printed no instance id".to_string(),
            });
        }
        Ok(instance_id)
    }
}

/// Remove every instance created from `build_id`.
///
/// `run -d` can create an instance and then fail to start it (port already
/// allocated). The stopped instance still pins the image.
async fn remove_leftover_instances(runner: &dyn ToolRunner, build_id: &str) {
    let filter = format!("ancestor={build_id}");
    let listed = runner
        .invoke(&tool::args(["ps", "-aq", "--filter", filter.as_str()]), None, None)
        .await;
    let output = match listed {
        Ok(output) => output,
        Err(e) => {
            warn!(build_id = %build_id, error = %e, "Failed to list instances of image");
            return;
        }
    };

    for instance_id in output.stdout.split_whitespace() {
        match runner
            .invoke(&tool::args(["rm", "-f", instance_id]), None, None)
            .await
        {
            Ok(_) => debug!(build_id = %build_id, instance_id = %instance_id, "Removed leftover instance"),
            Err(e) if tool::classify(&e) == FailureKind::NotFound => {}
            Err(e) => warn!(
                build_id = %build_id,
                instance_id = %instance_id,
                error = %e,
                "Failed to remove leftover instance"
            ),
        }
    }
}
