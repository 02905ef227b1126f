//! Test doubles for the image tool.
//!
//! [`ScriptedTool`] replays canned responses per subcommand. [`FakeEngine`]
//! models the images and containers a docker daemon would hold, so tests
//! can assert that nothing leaks. [`LogCapture`] collects formatted log
//! output so tests can assert on what was logged and at which level.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::subscriber::DefaultGuard;

use crate::error::{Error, Result};
use crate::tool::{ToolOutput, ToolRunner};

/// A recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub working_dir: Option<PathBuf>,
}

fn failure(args: &[String], message: &str) -> Error {
    Error::ToolInvocation {
        tool: "docker".to_string(),
        command: args.first().cloned().unwrap_or_default(),
        exit_code: Some(1),
        message: message.to_string(),
    }
}

fn record(calls: &Mutex<Vec<Call>>, args: &[String], stdin: Option<&str>, dir: Option<&Path>) {
    calls.lock().unwrap().push(Call {
        args: args.to_vec(),
        stdin: stdin.map(str::to_string),
        working_dir: dir.map(Path::to_path_buf),
    });
}

type Response = std::result::Result<String, String>;

/// Replays responses keyed by the first argument.
///
/// Responses for a subcommand are consumed in order; the last one repeats.
/// Unscripted subcommands fail.
#[derive(Default)]
pub struct ScriptedTool {
    responses: Mutex<HashMap<String, VecDeque<Response>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response: `Ok(stdout)` or `Err(diagnostic)`.
    pub fn on(&self, command: &str, response: std::result::Result<&str, &str>) {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(response.map(str::to_string).map_err(str::to_string));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRunner for ScriptedTool {
    async fn invoke(
        &self,
        args: &[String],
        stdin: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<ToolOutput> {
        record(&self.calls, args, stdin, working_dir);

        let command = args.first().cloned().unwrap_or_default();
        let response = {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&command) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match response {
            Some(Ok(stdout)) => Ok(ToolOutput {
                stdout,
                stderr: String::new(),
            }),
            Some(Err(message)) => Err(failure(args, &message)),
            None => Err(failure(args, &format!("unscripted command: {command}"))),
        }
    }
}

#[derive(Default)]
struct EngineState {
    next_id: u32,
    images: BTreeSet<String>,
    /// container id -> image id
    containers: HashMap<String, String>,
    run_failure: Option<String>,
    /// Failed runs still leave a created, stopped container behind.
    run_failure_creates: bool,
    image_rm_failure: Option<String>,
}

/// In-memory model of a docker daemon.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    calls: Mutex<Vec<Call>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `run` fail with `message`.
    pub fn fail_run(&self, message: &str) {
        self.state.lock().unwrap().run_failure = Some(message.to_string());
    }

    /// Make every `run` create its container and then fail to start it
    /// with `message`, like docker does when the host port is taken.
    pub fn fail_run_after_create(&self, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.run_failure = Some(message.to_string());
        state.run_failure_creates = true;
    }

    /// Make every `image rm` fail with `message`.
    pub fn fail_image_rm(&self, message: &str) {
        self.state.lock().unwrap().image_rm_failure = Some(message.to_string());
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.iter().cloned().collect()
    }

    pub fn containers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .containers
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Remove a container behind the manager's back.
    pub fn kill_out_of_band(&self, instance_id: &str) {
        self.state.lock().unwrap().containers.remove(instance_id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRunner for FakeEngine {
    async fn invoke(
        &self,
        args: &[String],
        stdin: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<ToolOutput> {
        record(&self.calls, args, stdin, working_dir);

        let mut state = self.state.lock().unwrap();
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = match argv.as_slice() {
            ["build", ..] => {
                state.next_id += 1;
                let id = format!("sha256:image{}", state.next_id);
                state.images.insert(id.clone());
                id
            }
            ["run", .., image] => {
                if !state.images.contains(*image) {
                    return Err(failure(args, &format!("Unable to find image '{image}'")));
                }
                if let Some(message) = state.run_failure.clone() {
                    if state.run_failure_creates {
                        state.next_id += 1;
                        let id = format!("container{}", state.next_id);
                        state.containers.insert(id, image.to_string());
                    }
                    return Err(failure(args, &message));
                }
                state.next_id += 1;
                let id = format!("container{}", state.next_id);
                state.containers.insert(id.clone(), image.to_string());
                id
            }
            ["ps", "-aq", "--filter", filter] => {
                let image = filter.strip_prefix("ancestor=").unwrap_or(*filter);
                let mut ids: Vec<_> = state
                    .containers
                    .iter()
                    .filter(|(_, from)| from.as_str() == image)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.sort();
                ids.join("\n")
            }
            ["rm", "-f", id] => {
                if state.containers.remove(*id).is_none() {
                    return Err(failure(
                        args,
                        &format!("Error response from daemon: No such container: {id}"),
                    ));
                }
                id.to_string()
            }
            ["image", "rm", id] => {
                if let Some(message) = state.image_rm_failure.clone() {
                    return Err(failure(args, &message));
                }
                if state.containers.values().any(|image| image == id) {
                    return Err(failure(
                        args,
                        &format!("conflict: unable to delete {id} (image is being used by running container)"),
                    ));
                }
                if !state.images.remove(*id) {
                    return Err(failure(
                        args,
                        &format!("Error response from daemon: No such image: {id}"),
                    ));
                }
                format!("Deleted: {id}")
            }
            _ => return Err(failure(args, "unknown command")),
        };

        Ok(ToolOutput {
            stdout: format!("{stdout}\n"),
            stderr: String::new(),
        })
    }
}

/// Buffer for formatted log lines.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Capture everything at debug and above on the current thread until the
    /// guard is dropped.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .with_writer(move || writer.clone())
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Lines logged at `level` ("WARN", "INFO", ...) that contain `needle`.
    pub fn matching(&self, level: &str, needle: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.split_whitespace().next() == Some(level) && line.contains(needle))
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
