//! Trusted runner implementation
//!
//! Executes instructor-supplied evaluation programs directly without sandbox.
//! The child gets its own process group so a timeout can take down anything
//! it forked as well.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{RunError, RunOutcome, RunStatus};

/// Attempts to spawn a program whose file may still be held open for writing
const SPAWN_ATTEMPTS: u32 = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runner that executes trusted code directly without sandbox
pub struct TrustedRunner {
    timeout: Duration,
}

impl TrustedRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a program with arguments, killing it after the wall-clock timeout
    pub async fn execute(&self, program: &Path, args: &[&OsStr]) -> Result<RunOutcome, RunError> {
        debug!("Running trusted program: {:?} with args: {:?}", program, args);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = spawn(&mut cmd, program).await?;
        let pid = child.id();
        let started = Instant::now();

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(RunError::Wait)?,
            Err(_) => {
                warn!(
                    "Program {:?} exceeded {}s, killing process group",
                    program,
                    self.timeout.as_secs_f32()
                );
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                return Ok(RunOutcome {
                    status: RunStatus::TimedOut,
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed: started.elapsed(),
                });
            }
        };

        let status = match output.status.code() {
            Some(code) => RunStatus::Exited(code),
            None => {
                use std::os::unix::process::ExitStatusExt;
                RunStatus::Signaled(output.status.signal().unwrap_or(-1))
            }
        };

        Ok(RunOutcome {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            elapsed: started.elapsed(),
        })
    }
}

async fn spawn(cmd: &mut Command, program: &Path) -> Result<Child, RunError> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempt < SPAWN_ATTEMPTS => {
                debug!("{:?} is busy, retrying spawn (attempt {})", program, attempt);
                attempt += 1;
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            }
            Err(source) => {
                return Err(RunError::Spawn {
                    path: program.display().to_string(),
                    source,
                })
            }
        }
    }
}

fn kill_process_group(pid: u32) {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}
