//! Job execution strategies.
//!
//! A job runs either directly in its container ([`DirectStrategy`]) or through
//! a workflow engine that launches its own containers ([`WorkflowStrategy`]).
//! Both go through [`run_supervised`], which owns the process tree: it drains
//! stdout and stderr while the process runs, enforces the timeout and kills
//! the whole process group when the job concludes.

use crate::expand::ResolvedCommand;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Container engine used for direct jobs unless configured otherwise.
pub const DEFAULT_CONTAINER_ENGINE: &str = "docker";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long stream readers may lag behind process exit.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const CONTAINER_REMOVE_TIMEOUT: Duration = Duration::from_secs(60);

/// What a job did.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionResult {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub timed_out: bool,
}

pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// The job could not be run at all.
#[derive(Debug)]
pub enum ExecutionError {
    /// The program failed to start (missing binary, permissions).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Waiting on the process failed.
    Wait(std::io::Error),
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Spawn { program, source } => {
                write!(f, "failed to start {program}: {source}")
            }
            ExecutionError::Wait(e) => write!(f, "failed to wait for job: {e}"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Run a command as the leader of a new process group and supervise it.
///
/// The process gets no stdin. Its output is collected incrementally on two
/// reader threads. If it outlives `timeout` the whole group is killed and the
/// result is marked as timed out. When the leader exits the group is killed
/// as well, so nothing the job started survives it.
pub fn run_supervised(mut cmd: Command, timeout: Duration) -> Result<ExecutionResult, ExecutionError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|source| ExecutionError::Spawn { program: program.clone(), source })?;
    let pid = child.id();
    tracing::debug!(pid, %program, "spawned job process");

    let stdout = StreamDrain::start(child.stdout.take());
    let stderr = StreamDrain::start(child.stderr.take());

    // The group is killed while the exited leader is still unreaped. Its pid
    // then keeps the group id reserved, so the signal cannot reach a reused
    // group.
    let mut timed_out = false;
    let status = loop {
        match leader_exited(&mut child) {
            Ok(true) => {
                kill_tree(&mut child);
                break child.wait().map_err(ExecutionError::Wait)?;
            }
            Ok(false) => {
                if start.elapsed() > timeout {
                    tracing::warn!(
                        pid,
                        timeout_secs = timeout.as_secs_f64(),
                        "job timed out, killing its process tree"
                    );
                    timed_out = true;
                    kill_tree(&mut child);
                    break child.wait().map_err(ExecutionError::Wait)?;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(ExecutionError::Wait(e));
            }
        }
    };

    let stdout = stdout.finish(DRAIN_GRACE);
    let stderr = stderr.finish(DRAIN_GRACE);
    let duration = start.elapsed();
    tracing::debug!(pid, exit_code = ?status.code(), timed_out, "job process finished");

    Ok(ExecutionResult {
        exit_code: status.code(),
        stdout,
        stderr,
        duration,
        timed_out,
    })
}

/// Whether the leader has exited, without reaping it.
#[cfg(target_os = "linux")]
fn leader_exited(child: &mut Child) -> std::io::Result<bool> {
    // SAFETY: siginfo_t is plain data; waitid writes into it and, with
    // WNOWAIT, leaves the child waitable.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            child.id() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: waitid filled in a SIGCHLD record, or left it zeroed.
    Ok(unsafe { info.si_pid() } != 0)
}

/// Whether the leader has exited. Reaps it, so the group kill that follows
/// can in principle race with group id reuse.
#[cfg(not(target_os = "linux"))]
fn leader_exited(child: &mut Child) -> std::io::Result<bool> {
    child.try_wait().map(|status| status.is_some())
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: killpg only sends a signal. The child was spawned as the leader
    // of its own group, so the group id is its pid.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Collects one output stream on a background thread.
struct StreamDrain {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl StreamDrain {
    fn start<R: Read + Send + 'static>(stream: Option<R>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();

        if let Some(mut stream) = stream {
            let sink = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => match sink.lock() {
                            Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                            Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                        },
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                let _ = tx.send(());
            });
        }

        Self { buffer, done }
    }

    /// Wait up to `grace` for end-of-stream, then return what was read.
    ///
    /// A descendant that escaped the process group can hold the pipe open;
    /// the reader thread is then left behind rather than waited on.
    fn finish(self, grace: Duration) -> String {
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(grace) {
            tracing::warn!("output stream still open after the job finished, truncating");
        }
        let bytes = match self.buffer.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// A name the container engine accepts: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn container_name(job: &str, test: &str) -> String {
    let raw = format!("{job}-{test}-jote-{}", std::process::id());
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name.insert(0, 'j');
    }
    name
}

/// Translate a platform memory quantity (`512Mi`, `2Gi`) to the engine's form.
pub fn engine_memory(memory: &str) -> Option<String> {
    if let Some(n) = memory.strip_suffix("Mi") {
        n.parse::<u64>().ok().map(|n| format!("{n}m"))
    } else if let Some(n) = memory.strip_suffix("Gi") {
        n.parse::<u64>().ok().map(|n| format!("{n}g"))
    } else {
        None
    }
}

/// Runs the job's image directly with the container engine.
#[derive(Debug, Clone)]
pub struct DirectStrategy {
    pub engine: String,
    pub image: String,
    pub container_name: String,
    /// Where the simulated project directory is mounted in the container.
    pub project_mount: PathBuf,
    /// `(uid, gid)` the container runs as.
    pub user: (u32, u32),
    pub memory: Option<String>,
    pub cores: Option<u32>,
}

impl DirectStrategy {
    /// Engine arguments that run `command` with `project` mounted.
    pub fn container_args(&self, command: &ResolvedCommand, project: &Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            "--user".to_string(),
            format!("{}:{}", self.user.0, self.user.1),
            "--volume".to_string(),
            format!("{}:{}", project.display(), self.project_mount.display()),
            "--workdir".to_string(),
            command.working_directory.display().to_string(),
        ];
        for (k, v) in &command.env {
            args.push("--env".to_string());
            args.push(format!("{k}={v}"));
        }
        if let Some(memory) = self.memory.as_deref().and_then(engine_memory) {
            args.push("--memory".to_string());
            args.push(memory);
        }
        if let Some(cores) = self.cores {
            args.push("--cpus".to_string());
            args.push(cores.to_string());
        }

        let (entrypoint, rest) = command
            .argv
            .split_first()
            .map(|(first, rest)| (first.clone(), rest))
            .unwrap_or_default();
        args.push("--entrypoint".to_string());
        args.push(entrypoint);
        args.push(self.image.clone());
        args.extend(rest.iter().cloned());
        args
    }

    pub fn execute(
        &self,
        command: &ResolvedCommand,
        working_directory: &Path,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut cmd = Command::new(&self.engine);
        cmd.args(self.container_args(command, working_directory));
        tracing::info!(image = %self.image, container = %self.container_name, "running container");

        let result = run_supervised(cmd, timeout)?;
        if result.timed_out {
            self.remove_container();
        }
        Ok(result)
    }

    /// Force-remove the container; the daemon owns it, not our process tree.
    fn remove_container(&self) {
        let mut cmd = Command::new(&self.engine);
        cmd.args(["rm", "--force", self.container_name.as_str()]);
        match run_supervised(cmd, CONTAINER_REMOVE_TIMEOUT) {
            Ok(r) if r.exit_code == Some(0) => {
                tracing::info!(container = %self.container_name, "removed timed out container");
            }
            Ok(r) => tracing::warn!(
                container = %self.container_name,
                stderr = %r.stderr.trim(),
                "failed to remove timed out container"
            ),
            Err(e) => tracing::warn!(container = %self.container_name, error = %e, "failed to remove timed out container"),
        }
    }
}

/// Runs the job's command on the host, where it drives a workflow engine.
#[derive(Debug, Clone, Default)]
pub struct WorkflowStrategy;

impl WorkflowStrategy {
    pub fn execute(
        &self,
        command: &ResolvedCommand,
        working_directory: &Path,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let Some((program, args)) = command.argv.split_first() else {
            return Err(ExecutionError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(working_directory);
        cmd.envs(&command.env);
        tracing::info!(%program, cwd = %working_directory.display(), "running workflow");

        run_supervised(cmd, timeout)
    }
}

/// The ways a job can be executed.
#[derive(Debug, Clone)]
pub enum Executor {
    Direct(DirectStrategy),
    Workflow(WorkflowStrategy),
}

impl Executor {
    /// Run `command` against the simulated project directory.
    pub fn execute(
        &self,
        command: &ResolvedCommand,
        working_directory: &Path,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        match self {
            Executor::Direct(s) => s.execute(command, working_directory, timeout),
            Executor::Workflow(s) => s.execute(command, working_directory, timeout),
        }
    }
}
