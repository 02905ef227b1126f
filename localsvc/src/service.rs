//! Local container service facade.
//!
//! Ties the lifecycle pieces together: Dockerfile generation, image build,
//! instance run, readiness probe and teardown.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifact::{ArtifactPointer, ArtifactStore};
use crate::buildspec::BuildSpecGenerator;
use crate::config::{Config, Target};
use crate::daemon::{DaemonManager, DaemonState, InstanceRecord, ServiceSpec};
use crate::error::{Error, Result};
use crate::image::ImageBuilder;
use crate::probe::{HealthCheckResult, ReadinessProbe};
use crate::state::ServiceState;
use crate::tool::ToolRunner;

/// Hostname local services are reachable at.
pub const LOCAL_HOSTNAME: &str = "localhost";

/// Caller-facing bindings for a local service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOpts {
    #[serde(default)]
    pub ports: IndexMap<String, String>,
    #[serde(default)]
    pub env: IndexMap<String, Option<String>>,
    #[serde(default)]
    pub volumes: IndexMap<String, String>,
}

impl ServiceOpts {
    /// Add the bindings a deployment target needs.
    ///
    /// For AWS the credentials directory under `home` is mounted and the
    /// container is pointed at it. Existing entries with the same key are
    /// replaced.
    pub fn with_target_extras(mut self, config: &Config, home: &Path) -> Self {
        match config.target {
            Target::Local => {}
            Target::Aws => {
                self.volumes.insert(
                    home.join(".aws").display().to_string(),
                    "/.aws".to_string(),
                );
                self.env.insert(
                    "AWS_SHARED_CREDENTIALS_FILE".to_string(),
                    Some("/.aws/credentials".to_string()),
                );
                self.env
                    .insert("AWS_REGION".to_string(), config.aws_region.clone());
            }
        }
        self
    }

    fn into_spec(self, hostname: &str) -> ServiceSpec {
        ServiceSpec {
            ports: self.ports,
            env: self.env,
            volumes: self.volumes,
            hostname: hostname.to_string(),
        }
    }
}

/// Human-readable banner logged once a service is ready.
pub fn ready_banner(base_url: &str, sample_path: &str) -> String {
    format!(
        "DING! Your service is ready!\nHere's a command for you:\n  curl {}{}",
        base_url.trim_end_matches('/'),
        sample_path
    )
}

/// One locally built and run container service.
pub struct LocalService {
    daemon: DaemonManager,
    spec: ServiceSpec,
    images: Arc<ImageBuilder>,
    probe: ReadinessProbe,
}

/// Prepare a local container service for a bundled artifact.
///
/// Generates and stores the Dockerfile; nothing is built until
/// [`LocalService::up`].
pub async fn local_container_service(
    name: &str,
    bundle: &ArtifactPointer,
    opts: ServiceOpts,
    tool: Arc<dyn ToolRunner>,
    store: Arc<dyn ArtifactStore>,
    config: &Config,
) -> Result<LocalService> {
    let generator = BuildSpecGenerator::new(Arc::clone(&store), config.build_spec.clone());
    let build_spec = generator.generate(bundle).await?;
    LocalService::new(
        name,
        build_spec,
        opts.into_spec(LOCAL_HOSTNAME),
        tool,
        store,
        config,
    )
}

impl LocalService {
    pub fn new(
        name: &str,
        build_spec: ArtifactPointer,
        spec: ServiceSpec,
        tool: Arc<dyn ToolRunner>,
        store: Arc<dyn ArtifactStore>,
        config: &Config,
    ) -> Result<Self> {
        let images = Arc::new(ImageBuilder::new(Arc::clone(&tool), store));
        let daemon = DaemonManager::new(name, build_spec, tool, Arc::clone(&images));
        Ok(Self {
            daemon,
            spec,
            images,
            probe: ReadinessProbe::new(config.probe.clone())?,
        })
    }

    /// Reattach to a previously persisted service.
    pub fn from_state(
        state: &ServiceState,
        tool: Arc<dyn ToolRunner>,
        store: Arc<dyn ArtifactStore>,
        config: &Config,
    ) -> Result<Self> {
        Self::new(
            &state.name,
            state.build_spec.clone(),
            state.spec.clone(),
            tool,
            store,
            config,
        )
    }

    /// Abort readiness waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.probe = self.probe.with_cancellation(token);
        self
    }

    pub fn name(&self) -> &str {
        self.daemon.name()
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn state(&self) -> &DaemonState {
        self.daemon.state()
    }

    /// Base URL of the first published port.
    pub fn base_url(&self) -> Result<String> {
        let host = self
            .spec
            .ports
            .keys()
            .next()
            .ok_or_else(|| Error::Config("service publishes no ports".to_string()))?;
        // "8090" or "127.0.0.1:8090"; the host side of the binding wins.
        let port = host.rsplit(':').next().unwrap_or(host);
        Ok(format!("http://{}:{}", self.spec.hostname, port))
    }

    /// Build the image and run the instance, without waiting for readiness.
    pub async fn start(&mut self) -> Result<ServiceState> {
        // Validate before building anything.
        self.base_url()?;
        let instance = self.daemon.create(&self.spec).await?;
        Ok(ServiceState {
            name: self.name().to_string(),
            build_spec: self.daemon.build_spec().clone(),
            spec: self.spec.clone(),
            instance,
            health: None,
        })
    }

    /// Wait until `health_path` of a started service is ready, recording the
    /// result in `state` and logging the ready banner.
    pub async fn wait_ready(
        &self,
        state: &mut ServiceState,
        health_path: &str,
        sample_path: &str,
    ) -> Result<()> {
        let health = self
            .check(&state.instance, health_path)
            .await
            .inspect_err(|e| {
                warn!(service = %state.name, error = %e, "Service did not become ready");
            })?;
        for line in ready_banner(&health.base_url, sample_path).lines() {
            info!("{line}");
        }
        state.health = Some(health);
        Ok(())
    }

    /// Start the service and wait until it is ready.
    ///
    /// If the probe gives up the instance is left running; callers that need
    /// the record to tear it down should use [`start`](Self::start) and
    /// [`wait_ready`](Self::wait_ready) directly.
    pub async fn up(&mut self, health_path: &str, sample_path: &str) -> Result<ServiceState> {
        let mut state = self.start().await?;
        self.wait_ready(&mut state, health_path, sample_path).await?;
        Ok(state)
    }

    /// Check an already running instance.
    pub async fn check(
        &self,
        instance: &InstanceRecord,
        health_path: &str,
    ) -> Result<HealthCheckResult> {
        self.probe
            .wait_until_ready(&self.base_url()?, health_path, &instance.instance_id)
            .await
    }

    /// Remove the instance and, if asked, its image. Both steps tolerate
    /// resources that are already gone.
    pub async fn down(&mut self, instance: &InstanceRecord, remove_image: bool) -> Result<()> {
        self.daemon.delete(instance).await?;
        if remove_image {
            self.images.remove(&instance.build_id).await?;
        }
        info!(service = %self.name(), instance_id = %instance.instance_id, "Service down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn aws_target_adds_credentials() {
        let config = Config {
            target: Target::Aws,
            aws_region: Some("us-west-2".to_string()),
            ..Config::default()
        };
        let opts = ServiceOpts::default().with_target_extras(&config, &PathBuf::from("/home/dev"));

        assert_eq!(opts.volumes.get("/home/dev/.aws").unwrap(), "/.aws");
        assert_eq!(
            opts.env.get("AWS_SHARED_CREDENTIALS_FILE").unwrap().as_deref(),
            Some("/.aws/credentials")
        );
        assert_eq!(
            opts.env.get("AWS_REGION").unwrap().as_deref(),
            Some("us-west-2")
        );
    }

    #[test]
    fn aws_target_without_region_omits_it_from_run() {
        let config = Config {
            target: Target::Aws,
            ..Config::default()
        };
        let spec = ServiceOpts::default()
            .with_target_extras(&config, &PathBuf::from("/root"))
            .into_spec(LOCAL_HOSTNAME);

        let args = spec.run_args("img");
        assert!(args.contains(&"AWS_SHARED_CREDENTIALS_FILE=/.aws/credentials".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("AWS_REGION")));
    }

    #[test]
    fn local_target_adds_nothing() {
        let opts = ServiceOpts::default().with_target_extras(&Config::default(), Path::new("/root"));
        assert_eq!(opts, ServiceOpts::default());
    }

    #[test]
    fn banner_includes_sample_request() {
        let banner = ready_banner("http://localhost:8090/", "/foo");
        assert!(banner.contains("ready"));
        assert!(banner.ends_with("curl http://localhost:8090/foo"));
    }
}
