//! localsvc - lifecycle manager for a single local container service.
//!
//! Takes a pre-built application bundle, renders a Dockerfile for it, builds
//! an image, runs one instance with port/env/volume bindings, and waits for
//! its health endpoint to report ready. Startup failures roll back the image;
//! teardown tolerates instances that are already gone.
//!
//! ## Architecture
//!
//! - **tool**: image tool (docker CLI) invocation and failure classification
//! - **artifact**: artifact store seam and a local content-addressed store
//! - **buildspec**: deterministic Dockerfile generation
//! - **image**: image build and tolerant removal
//! - **daemon**: create/delete state machine with image rollback
//! - **probe**: bounded-retry HTTP readiness probe
//! - **service**: facade tying the above together for one service

pub mod artifact;
pub mod buildspec;
pub mod config;
pub mod daemon;
pub mod error;
pub mod image;
pub mod probe;
pub mod rollback;
pub mod service;
pub mod state;
pub mod test_util;
pub mod tool;

pub use artifact::{ArtifactPointer, ArtifactStore, FsArtifactStore};
pub use config::{Config, Target};
pub use daemon::{DaemonManager, DaemonState, InstanceRecord, ServiceSpec};
pub use error::{Error, Result};
pub use image::{BuildRecord, ImageBuilder};
pub use probe::{HealthCheckResult, ReadinessProbe};
pub use service::{LocalService, ServiceOpts, local_container_service};
pub use state::ServiceState;
pub use tool::{ImageTool, ToolOutput, ToolRunner};
