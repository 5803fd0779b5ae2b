//! Code execution engine.
//!
//! An engine is loaded at most once per process through [`EngineCell`]. The
//! load is lazy and idempotent; if it fails, the failure is remembered and the
//! sandbox stays disabled until the process restarts. There is no retry.
//!
//! Each run is bounded by [`RunLimits`]: a wall-clock timeout plus memory
//! and CPU caps, enforced either with rlimits on a host child process or by
//! a per-run container (see [`Isolation`]).

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{OnceCell, mpsc};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::errors::EngineError;

/// Receives captured output, one line per message.
pub type OutputSink = mpsc::UnboundedSender<String>;

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Execute the full source text, streaming each output line to `sink` as
    /// it is produced. Resolves once execution has settled.
    async fn run(&self, source: &str, sink: OutputSink) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn initialize(&self) -> Result<Arc<dyn ExecutionEngine>, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EngineStatus {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
    Disabled,
}

impl EngineStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

type LoadResult = Result<Arc<dyn ExecutionEngine>, EngineError>;

/// Process-wide holder for the lazily loaded engine.
pub struct EngineCell {
    loader: Option<Arc<dyn EngineLoader>>,
    cell: OnceCell<LoadResult>,
    started: AtomicBool,
}

impl EngineCell {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader: Some(loader),
            cell: OnceCell::new(),
            started: AtomicBool::new(false),
        }
    }

    /// A cell that never loads anything (sandbox turned off in config).
    pub fn disabled() -> Self {
        Self {
            loader: None,
            cell: OnceCell::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Load the engine, or wait for the load already in progress. Only the
    /// first caller runs the loader; everyone sees the same outcome.
    pub async fn initialize(&self) -> Option<Arc<dyn ExecutionEngine>> {
        let loader = self.loader.as_ref()?;
        self.started.store(true, Ordering::SeqCst);
        let result = self
            .cell
            .get_or_init(|| async {
                tracing::info!("initializing code execution engine");
                let result = loader.initialize().await;
                match &result {
                    Ok(_) => tracing::info!("code execution engine ready"),
                    Err(e) => tracing::error!(error = %e, "code execution engine unavailable"),
                }
                result
            })
            .await;
        result.as_ref().ok().cloned()
    }

    /// Kick off initialization in the background if nobody has yet.
    pub fn ensure_started(self: &Arc<Self>) {
        if self.loader.is_none() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let cell = Arc::clone(self);
        tokio::spawn(async move {
            cell.initialize().await;
        });
    }

    /// The engine if it has finished loading successfully.
    pub fn engine(&self) -> Option<Arc<dyn ExecutionEngine>> {
        match self.cell.get() {
            Some(Ok(engine)) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    pub fn status(&self) -> EngineStatus {
        if self.loader.is_none() {
            return EngineStatus::Disabled;
        }
        match self.cell.get() {
            Some(Ok(_)) => EngineStatus::Ready,
            Some(Err(e)) => EngineStatus::Failed(e.to_string()),
            None if self.started.load(Ordering::SeqCst) => EngineStatus::Loading,
            None => EngineStatus::Uninitialized,
        }
    }
}

/// Per-run resource limits.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    pub timeout: Duration,
    pub memory_bytes: u64,
    pub cpus: f64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

impl RunLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.timeout_duration(),
            memory_bytes: config.memory_bytes().unwrap_or(DEFAULT_MEMORY_BYTES),
            cpus: config.cpus,
        }
    }
}

const DEFAULT_MEMORY_BYTES: u64 = 256 << 20;

/// Output beyond this many lines per run is dropped.
pub const MAX_OUTPUT_LINES: usize = 10_000;

/// Where programs execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Isolation {
    /// A host child process with a scrubbed environment, its own process
    /// group, and address-space and CPU rlimits.
    Host,
    /// A throwaway `docker run` container per program: no network, read-only
    /// root, all capabilities dropped, memory and CPU capped.
    Container { image: String },
}

/// Loads a [`PythonEngine`] after checking the interpreter (or container
/// image) is usable.
pub struct PythonLoader {
    interpreter: String,
    limits: RunLimits,
    isolation: Isolation,
}

impl PythonLoader {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            limits: RunLimits::default(),
            isolation: Isolation::Host,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            limits: RunLimits::from_config(config),
            isolation: match &config.image {
                Some(image) => Isolation::Container {
                    image: image.clone(),
                },
                None => Isolation::Host,
            },
        }
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    fn engine(&self) -> PythonEngine {
        PythonEngine {
            interpreter: self.interpreter.clone(),
            limits: self.limits.clone(),
            isolation: self.isolation.clone(),
        }
    }
}

#[async_trait]
impl EngineLoader for PythonLoader {
    async fn initialize(&self) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
        if let Isolation::Container { image } = &self.isolation {
            let output = Command::new("docker")
                .args(["image", "inspect", "--format", "{{.Id}}", image])
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| EngineError::InitFailed(format!("docker: {}", e)))?;
            if !output.status.success() {
                return Err(EngineError::InitFailed(format!(
                    "container image {} is not available",
                    image
                )));
            }
            tracing::debug!(%image, "sandbox container image found");
            return Ok(Arc::new(self.engine()));
        }

        let output = Command::new(&self.interpreter)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::InitFailed(format!("{}: {}", self.interpreter, e)))?;
        if !output.status.success() {
            return Err(EngineError::InitFailed(format!(
                "{} --version exited with {}",
                self.interpreter, output.status
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        let version = if version.trim().is_empty() {
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        } else {
            version.trim().to_string()
        };
        tracing::debug!(interpreter = %self.interpreter, %version, "python interpreter found");
        Ok(Arc::new(self.engine()))
    }
}

/// Runs source in a fresh unbuffered interpreter per call, under
/// [`RunLimits`].
pub struct PythonEngine {
    interpreter: String,
    limits: RunLimits,
    isolation: Isolation,
}

impl PythonEngine {
    fn command(&self, container_name: &str) -> Command {
        let mut command = match &self.isolation {
            Isolation::Host => {
                let mut command = Command::new(&self.interpreter);
                command.args(["-I", "-u", "-"]).env_clear().current_dir(std::env::temp_dir());
                if let Some(path) = std::env::var_os("PATH") {
                    command.env("PATH", path);
                }
                #[cfg(unix)]
                {
                    command.process_group(0);
                    apply_rlimits(&mut command, &self.limits);
                }
                command
            }
            Isolation::Container { image } => {
                let memory = self.limits.memory_bytes.to_string();
                let cpus = self.limits.cpus.to_string();
                let mut command = Command::new("docker");
                command
                    .args(["run", "--rm", "-i", "--name", container_name])
                    .args(["--network", "none", "--read-only", "--cap-drop", "ALL"])
                    .args(["--security-opt", "no-new-privileges", "--pids-limit", "64"])
                    .args(["--user", "65534:65534", "--tmpfs", "/tmp:size=16m"])
                    .args(["--memory", memory.as_str(), "--memory-swap", memory.as_str()])
                    .args(["--cpus", cpus.as_str()])
                    .arg(image)
                    .args([self.interpreter.as_str(), "-u", "-"]);
                command
            }
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Tear down whatever outlived a timed-out run.
    async fn reap(&self, pid: Option<u32>, container_name: &str) {
        match &self.isolation {
            Isolation::Host => kill_process_group(pid),
            Isolation::Container { .. } => {
                let removed = Command::new("docker")
                    .args(["rm", "-f", container_name])
                    .stdin(Stdio::null())
                    .output()
                    .await;
                if let Err(e) = removed {
                    tracing::warn!(container = container_name, error = %e, "failed to remove sandbox container");
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for PythonEngine {
    async fn run(&self, source: &str, sink: OutputSink) -> Result<(), EngineError> {
        let container_name = format!("pagewise-run-{}", Uuid::new_v4());
        let child = self
            .command(&container_name)
            .spawn()
            .map_err(|e| EngineError::Execution(format!("failed to start {}: {}", self.interpreter, e)))?;
        let pid = child.id();

        match tokio::time::timeout(self.limits.timeout, execute(child, source, sink)).await {
            Ok(result) => result,
            Err(_) => {
                let secs = self.limits.timeout.as_secs();
                tracing::warn!(secs, "code run exceeded time limit");
                self.reap(pid, &container_name).await;
                Err(EngineError::TimedOut { secs })
            }
        }
    }
}

/// Feed `source` to the interpreter and stream its stdout. Dropping this
/// future kills the child.
async fn execute(mut child: Child, source: &str, sink: OutputSink) -> Result<(), EngineError> {
    let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(EngineError::Execution("interpreter pipes unavailable".into()));
    };

    let write_source = async move {
        let result = stdin.write_all(source.as_bytes()).await;
        drop(stdin);
        result
    };
    let collect_stderr = async {
        let mut content = Vec::new();
        let _ = stderr.read_to_end(&mut content).await;
        String::from_utf8_lossy(&content).into_owned()
    };

    let (written, (), stderr_content) =
        tokio::join!(write_source, stream_lines(stdout, &sink), collect_stderr);
    if let Err(e) = written {
        tracing::debug!(error = %e, "interpreter closed stdin early");
    }

    let status = child
        .wait()
        .await
        .map_err(|e| EngineError::Execution(e.to_string()))?;
    if status.success() {
        return Ok(());
    }

    // The last stderr line of a traceback is the exception message
    let message = stderr_content
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("interpreter exited with {}", status));
    Err(EngineError::Execution(message))
}

/// Forward `reader` to `sink` line by line. Bytes that aren't UTF-8 are
/// replaced rather than ending the stream. Past [`MAX_OUTPUT_LINES`] the
/// rest is drained and discarded.
async fn stream_lines<R: AsyncRead + Unpin>(reader: R, sink: &OutputSink) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut sent = 0usize;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "stopped reading interpreter output");
                break;
            }
        }
        if sent > MAX_OUTPUT_LINES {
            continue;
        }
        sent += 1;
        let line = if sent > MAX_OUTPUT_LINES {
            "[output truncated]".to_string()
        } else {
            let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        };
        if sink.send(line).is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn apply_rlimits(command: &mut Command, limits: &RunLimits) {
    let memory = limits.memory_bytes as libc::rlim_t;
    // One CPU second past the wall-clock limit, so the timeout normally fires first
    let cpu = limits.timeout.as_secs().saturating_add(1) as libc::rlim_t;
    // SAFETY: runs in the forked child before exec and only calls
    // setrlimit, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            let memory_limit = libc::rlimit {
                rlim_cur: memory,
                rlim_max: memory,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &memory_limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let cpu_limit = libc::rlimit {
                rlim_cur: cpu,
                rlim_max: cpu,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu_limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: signals the process group created for this run's child.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Notify;

    use super::*;

    /// Engine that replays fixed lines, optionally waiting on a gate first.
    pub struct ScriptedEngine {
        pub lines: Vec<String>,
        pub error: Option<String>,
        pub gate: Option<Arc<Notify>>,
        pub runs: AtomicUsize,
    }

    impl ScriptedEngine {
        pub fn new(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                error: None,
                gate: None,
                runs: AtomicUsize::new(0),
            }
        }

        pub fn failing(lines: &[&str], error: &str) -> Self {
            Self {
                error: Some(error.to_string()),
                ..Self::new(lines)
            }
        }

        pub fn gated(lines: &[&str], gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(lines)
            }
        }
    }

    #[async_trait]
    impl ExecutionEngine for ScriptedEngine {
        async fn run(&self, _source: &str, sink: OutputSink) -> Result<(), EngineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            for line in &self.lines {
                let _ = sink.send(line.clone());
            }
            match &self.error {
                Some(message) => Err(EngineError::Execution(message.clone())),
                None => Ok(()),
            }
        }
    }

    /// Loader that counts its invocations.
    pub struct CountingLoader {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl CountingLoader {
        pub fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl EngineLoader for CountingLoader {
        async fn initialize(&self) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                Err(EngineError::InitFailed("no interpreter".into()))
            } else {
                Ok(Arc::new(ScriptedEngine::new(&["ok"])))
            }
        }
    }
}
