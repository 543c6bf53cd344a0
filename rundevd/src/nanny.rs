//! Supervisor for the user application process.
//!
//! Manages at most one child at a time. The child is started in its own
//! process group so a kill reaches any descendants the user app may have
//! spawned. Stdout and stderr are tee'd to the shared log buffer and to the
//! daemon's own log stream.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use rundev_common::types::Cmd;

use crate::logbuf::LogBuffer;

#[derive(Debug, thiserror::Error)]
pub enum NannyError {
    #[error("error starting process: {0}")]
    Start(#[source] std::io::Error),

    #[error("run command is empty")]
    EmptyCommand,
}

/// The nanny contract: tests substitute a fake.
pub trait Nanny: Send + Sync {
    /// True iff a child was started and has not yet exited.
    fn running(&self) -> bool;

    /// Kills the current child (if any) and starts a new one.
    fn restart(&self) -> Result<(), NannyError>;

    /// SIGKILLs the child's process group and clears the log buffer.
    fn kill(&self);
}

/// Options for the supervised process.
#[derive(Debug, Clone)]
pub struct ProcOpts {
    /// Value of the `PORT` environment variable handed to the child.
    pub port: u16,
    /// Working directory (the sync directory).
    pub dir: PathBuf,
}

#[derive(Debug, Default)]
struct ProcState {
    /// Process-group id of the current child, if one was started.
    pgid: Option<i32>,
    active: bool,
    /// Bumped on every kill/restart so a stale exit watcher cannot declare
    /// a replacement process dead.
    generation: u64,
}

pub struct ProcNanny {
    cmd: Cmd,
    opts: ProcOpts,
    logs: Arc<LogBuffer>,
    state: Arc<Mutex<ProcState>>,
}

impl ProcNanny {
    pub fn new(cmd: Cmd, opts: ProcOpts, logs: Arc<LogBuffer>) -> Self {
        Self {
            cmd,
            opts,
            logs,
            state: Arc::new(Mutex::new(ProcState::default())),
        }
    }

    fn kill_current(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(pgid) = state.pgid.take() {
            info!(pgid, "killing process group");
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                warn!(pgid, error = %e, "failed to kill process group");
            } else {
                info!(pgid, "killed process group");
            }
        }
        state.active = false;
        state.generation += 1;
        drop(state);
        self.logs.reset();
    }

    fn tee<R>(&self, stream: R, label: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = Arc::clone(&self.logs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.append_line(&line);
                info!(target: "user-process", "{label}: {line}");
            }
        });
    }
}

impl Nanny for ProcNanny {
    fn running(&self) -> bool {
        self.state.lock().unwrap().active
    }

    fn restart(&self) -> Result<(), NannyError> {
        self.kill_current();

        if self.cmd.is_empty() {
            return Err(NannyError::EmptyCommand);
        }
        let mut command = Command::new(self.cmd.command());
        command
            .args(self.cmd.args())
            .current_dir(&self.opts.dir)
            .env("PORT", self.opts.port.to_string())
            .process_group(0) // child leads its own process group
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(cmd = %self.cmd, "proc start");
        let mut child = command.spawn().map_err(NannyError::Start)?;
        let pid = child.id().map(|p| p as i32);

        if let Some(stdout) = child.stdout.take() {
            self.tee(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.tee(stderr, "stderr");
        }

        let generation = {
            let mut state = self.state.lock().unwrap();
            state.pgid = pid;
            state.active = true;
            state.generation += 1;
            state.generation
        };

        // The watcher owns the child handle; it only flips `active` when the
        // process it awaited is still the tracked one.
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let status = child.wait().await;
            let mut state = state.lock().unwrap();
            if state.generation == generation {
                state.active = false;
                state.pgid = None;
                match status {
                    Ok(status) => info!(%status, "user process exited"),
                    Err(e) => warn!(error = %e, "failed to await user process"),
                }
            }
        });

        Ok(())
    }

    fn kill(&self) {
        self.kill_current();
    }
}
