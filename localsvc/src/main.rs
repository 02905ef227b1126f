use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use localsvc::buildspec::BuildSpecGenerator;
use localsvc::config::{BuildSpecConfig, ProbeConfig, parse_flag};
use localsvc::{
    ArtifactStore, Config, FsArtifactStore, ImageTool, LocalService, ServiceOpts, ServiceState,
    Target, ToolRunner, local_container_service,
};

#[derive(Parser)]
#[command(name = "localsvc")]
#[command(about = "Build, run and health-check a local container service", long_about = None)]
struct Cli {
    /// Image tool binary (docker or a compatible CLI)
    #[arg(long, env = "LOCALSVC_TOOL", default_value = "docker")]
    tool: PathBuf,

    /// Log every image tool invocation (1/true/yes/on)
    #[arg(long, env = "LOCALSVC_LOG_TOOL", default_value = "0", value_parser = flag, action = clap::ArgAction::Set)]
    log_tool: bool,

    /// Deployment target: local or aws
    #[arg(long, env = "LOCALSVC_TARGET", default_value = "local")]
    target: Target,

    /// Region exported to the container for the aws target
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    /// Directory for artifacts and service state
    #[arg(long, env = "LOCALSVC_DATA_DIR", default_value = ".localsvc")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run a bundle, then wait until it is healthy
    Up {
        /// Pre-built application bundle
        bundle: PathBuf,

        /// Service name
        #[arg(short, long, default_value = "app")]
        name: String,

        /// Port binding HOST:CONTAINER (repeatable)
        #[arg(short = 'p', long = "port", value_parser = port_binding)]
        ports: Vec<(String, String)>,

        /// Environment variable KEY=VALUE, or KEY to pass through (repeatable)
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,

        /// Volume binding HOST:CONTAINER (repeatable)
        #[arg(short = 'v', long = "volume", value_parser = volume_binding)]
        volumes: Vec<(String, String)>,

        /// Health endpoint that returns 204 when ready
        #[arg(long, default_value = "/health")]
        health_path: String,

        /// Path shown in the sample request once ready
        #[arg(long, default_value = "/")]
        sample_path: String,

        /// Health probe attempts
        #[arg(long, default_value = "3")]
        max_attempts: u32,

        /// Base image for the generated Dockerfile
        #[arg(long, default_value = "node:24")]
        base_image: String,

        /// Leave the instance running if it never becomes healthy
        #[arg(long)]
        keep_on_failure: bool,
    },
    /// Remove a service's instance and image
    Down {
        /// Service name
        #[arg(default_value = "app")]
        name: String,

        /// Keep the built image
        #[arg(long)]
        keep_image: bool,
    },
    /// Probe a running service once more
    Check {
        /// Service name
        #[arg(default_value = "app")]
        name: String,

        /// Health endpoint that returns 204 when ready
        #[arg(long, default_value = "/health")]
        health_path: String,
    },
    /// Print the Dockerfile generated for a bundle
    Render {
        /// Pre-built application bundle
        bundle: PathBuf,

        /// Base image for the generated Dockerfile
        #[arg(long, default_value = "node:24")]
        base_image: String,
    },
}

fn flag(value: &str) -> Result<bool, String> {
    Ok(parse_flag(value))
}

/// "8090:3000" or "127.0.0.1:8090:3000"; the container side follows the last colon.
fn port_binding(value: &str) -> Result<(String, String), String> {
    match value.rsplit_once(':') {
        Some((host, container)) if !host.is_empty() && !container.is_empty() => {
            Ok((host.to_string(), container.to_string()))
        }
        _ => Err(format!("expected HOST:CONTAINER, got {value:?}")),
    }
}

/// "/host:/container" or "/host:/container:ro"; the host side ends at the first colon.
fn volume_binding(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((host, container)) if !host.is_empty() && !container.is_empty() => {
            Ok((host.to_string(), container.to_string()))
        }
        _ => Err(format!("expected HOST:CONTAINER, got {value:?}")),
    }
}

fn env_entries(entries: &[String]) -> IndexMap<String, Option<String>> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (entry.clone(), std::env::var(entry).ok()),
        })
        .collect()
}

struct Workspace {
    config: Config,
    tool: Arc<dyn ToolRunner>,
    store: Arc<FsArtifactStore>,
    state_dir: PathBuf,
}

impl Workspace {
    async fn new(cli: &Cli, config: Config) -> Result<Self> {
        let store = FsArtifactStore::open(cli.data_dir.join("artifacts"))
            .await
            .context("Failed to open artifact store")?;
        Ok(Self {
            tool: Arc::new(ImageTool::new(config.tool.clone(), config.log_invocations)),
            store: Arc::new(store),
            state_dir: cli.data_dir.join("services"),
            config,
        })
    }
}

/// Start `service`, record it under `state_dir`, and wait for readiness.
///
/// A started instance that cannot be recorded is torn down, as is one that
/// never becomes ready unless `keep_on_failure` is set.
async fn bring_up(
    service: &mut LocalService,
    state_dir: &Path,
    health_path: &str,
    sample_path: &str,
    keep_on_failure: bool,
) -> Result<ServiceState> {
    let name = service.name().to_string();
    let mut state = service.start().await?;

    if let Err(e) = state.save(state_dir).await {
        teardown(service, &state).await;
        return Err(anyhow::Error::new(e).context(format!("Failed to record service '{name}'")));
    }

    if let Err(e) = service
        .wait_ready(&mut state, health_path, sample_path)
        .await
    {
        if keep_on_failure {
            warn!(service = %name, "Leaving unhealthy instance running");
        } else if teardown(service, &state).await
            && let Err(remove_err) = ServiceState::remove(state_dir, &name).await
        {
            warn!(service = %name, error = %remove_err, "Failed to remove service state");
        }
        return Err(e.into());
    }

    state.save(state_dir).await?;
    Ok(state)
}

/// Remove the instance and image of a failed start. Returns whether that
/// worked; failures are logged.
async fn teardown(service: &mut LocalService, state: &ServiceState) -> bool {
    match service.down(&state.instance, true).await {
        Ok(()) => true,
        Err(e) => {
            error!(service = %state.name, error = %e, "Teardown after failed start failed");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("localsvc=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = Config {
        tool: cli.tool.clone(),
        log_invocations: cli.log_tool,
        target: cli.target,
        aws_region: cli.aws_region.clone(),
        ..Config::default()
    };

    match &cli.command {
        Commands::Up {
            bundle,
            name,
            ports,
            env,
            volumes,
            health_path,
            sample_path,
            max_attempts,
            base_image,
            keep_on_failure,
        } => {
            config.build_spec = BuildSpecConfig {
                base_image: base_image.clone(),
                ..BuildSpecConfig::default()
            };
            config.probe = ProbeConfig {
                max_attempts: *max_attempts,
                ..ProbeConfig::default()
            };
            let ctx = Workspace::new(&cli, config).await?;

            if ServiceState::load(&ctx.state_dir, name).await?.is_some() {
                bail!("service '{name}' is already up; run `localsvc down {name}` first");
            }

            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("HOME is not set"))?;
            let opts = ServiceOpts {
                ports: ports.iter().cloned().collect(),
                env: env_entries(env),
                volumes: volumes.iter().cloned().collect(),
            }
            .with_target_extras(&ctx.config, &home);

            let bundle = ctx
                .store
                .import(bundle)
                .await
                .with_context(|| format!("Failed to import bundle {}", bundle.display()))?;
            info!(service = %name, bundle = %bundle, target = ?ctx.config.target, "Bringing service up");

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling");
                    ctrl_c.cancel();
                }
            });

            let mut service = local_container_service(
                name,
                &bundle,
                opts,
                Arc::clone(&ctx.tool),
                ctx.store.clone(),
                &ctx.config,
            )
            .await?
            .with_cancellation(cancel);

            let state = bring_up(
                &mut service,
                &ctx.state_dir,
                health_path,
                sample_path,
                *keep_on_failure,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Down { name, keep_image } => {
            let ctx = Workspace::new(&cli, config).await?;
            let Some(state) = ServiceState::load(&ctx.state_dir, name).await? else {
                info!(service = %name, "Service is not up");
                return Ok(());
            };

            let mut service = LocalService::from_state(
                &state,
                Arc::clone(&ctx.tool),
                ctx.store.clone(),
                &ctx.config,
            )?;
            service.down(&state.instance, !keep_image).await?;
            ServiceState::remove(&ctx.state_dir, name).await?;
        }
        Commands::Check { name, health_path } => {
            let ctx = Workspace::new(&cli, config).await?;
            let state = ServiceState::load(&ctx.state_dir, name)
                .await?
                .ok_or_else(|| anyhow!("service '{name}' is not up"))?;

            let service = LocalService::from_state(
                &state,
                Arc::clone(&ctx.tool),
                ctx.store.clone(),
                &ctx.config,
            )?;
            let health = service.check(&state.instance, health_path).await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Render { bundle, base_image } => {
            config.build_spec.base_image = base_image.clone();
            let ctx = Workspace::new(&cli, config).await?;
            let pointer = ctx.store.import(bundle).await?;
            let store: Arc<dyn ArtifactStore> = ctx.store.clone();
            let generator = BuildSpecGenerator::new(store, ctx.config.build_spec.clone());
            println!("{}", generator.preview(&pointer).await?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localsvc::test_util::FakeEngine;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn port_bindings() {
        assert_eq!(
            port_binding("8090:3000").unwrap(),
            ("8090".to_string(), "3000".to_string())
        );
        assert_eq!(
            port_binding("127.0.0.1:8090:3000").unwrap(),
            ("127.0.0.1:8090".to_string(), "3000".to_string())
        );
        assert!(port_binding("8090").is_err());
        assert!(port_binding(":3000").is_err());
    }

    #[test]
    fn volume_bindings() {
        assert_eq!(
            volume_binding("/data:/srv:ro").unwrap(),
            ("/data".to_string(), "/srv:ro".to_string())
        );
        assert!(volume_binding("/data").is_err());
    }

    #[test]
    fn env_entries_pass_through_missing_as_unset() {
        let env = env_entries(&[
            "FOO=bar".to_string(),
            "EMPTY=".to_string(),
            "LOCALSVC_TEST_SURELY_UNSET_VAR".to_string(),
        ]);
        assert_eq!(env["FOO"].as_deref(), Some("bar"));
        assert_eq!(env["EMPTY"].as_deref(), Some(""));
        assert_eq!(env["LOCALSVC_TEST_SURELY_UNSET_VAR"], None);
    }

    async fn prepared(temp: &TempDir, engine: Arc<FakeEngine>, port: u16) -> LocalService {
        let store = Arc::new(FsArtifactStore::open(temp.path().join("artifacts")).await.unwrap());
        let bundle = store.write(b"app", "bundle.js", &[]).await.unwrap();
        let mut opts = ServiceOpts::default();
        opts.ports.insert(port.to_string(), "3000".to_string());
        let config = Config {
            probe: ProbeConfig {
                max_attempts: 2,
                backoff_step: Duration::from_millis(10),
                ..ProbeConfig::default()
            },
            ..Config::default()
        };
        local_container_service("web", &bundle, opts, engine, store, &config)
            .await
            .unwrap()
    }

    fn unused_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn unrecordable_start_is_torn_down() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let mut service = prepared(&temp, engine.clone(), unused_port()).await;
        // A file where the state directory should be.
        let state_dir = temp.path().join("services");
        std::fs::write(&state_dir, b"").unwrap();

        let err = bring_up(&mut service, &state_dir, "/health", "/", false)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<localsvc::Error>(),
            Some(localsvc::Error::Io { .. })
        ));
        assert!(engine.containers().is_empty());
        assert!(engine.images().is_empty());
    }

    #[tokio::test]
    async fn never_ready_start_is_torn_down_and_forgotten() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let mut service = prepared(&temp, engine.clone(), unused_port()).await;
        let state_dir = temp.path().join("services");

        let err = bring_up(&mut service, &state_dir, "/health", "/", false)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<localsvc::Error>(),
            Some(localsvc::Error::ReadinessTimeout { attempts: 2, .. })
        ));
        assert!(engine.containers().is_empty());
        assert!(engine.images().is_empty());
        assert!(ServiceState::load(&state_dir, "web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn never_ready_start_can_be_kept() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let mut service = prepared(&temp, engine.clone(), unused_port()).await;
        let state_dir = temp.path().join("services");

        bring_up(&mut service, &state_dir, "/health", "/", true)
            .await
            .unwrap_err();

        assert_eq!(engine.containers().len(), 1);
        let state = ServiceState::load(&state_dir, "web").await.unwrap().unwrap();
        assert_eq!(engine.containers(), [state.instance.instance_id]);
    }

    #[test]
    fn cli_parses_up() {
        let cli = Cli::try_parse_from([
            "localsvc",
            "--target",
            "aws",
            "up",
            "app/bundle.js",
            "-p",
            "8090:3000",
            "-e",
            "FOO=bar",
        ])
        .unwrap();
        assert_eq!(cli.target, Target::Aws);
        match cli.command {
            Commands::Up { ports, env, .. } => {
                assert_eq!(ports, [("8090".to_string(), "3000".to_string())]);
                assert_eq!(env, ["FOO=bar"]);
            }
            _ => panic!("expected up"),
        }
    }
}
