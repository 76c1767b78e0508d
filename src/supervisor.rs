//! src/supervisor.rs
//!
//! `ProcessSupervisor` — launches a job's script as the leader of its
//! own process group and can tear down the whole subtree atomically on
//! cancellation (spec.md §4.1). The script-to-disk-then-exec step
//! mirrors the teacher's adapter "write inputs, then run" sandwich in
//! `drivers/external.rs`; the process-group kill is grounded on the
//! `-pgid` `SIGTERM` pattern in ProvableHQ-leo's `ChildManager`.
//!
//! Unix-only: process groups and POSIX signals have no portable
//! equivalent, so this daemon does not run on Windows (an open
//! REDESIGN question, recorded in DESIGN.md).

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::domain::Job;

/// Grace period between `SIGTERM` and the `SIGKILL` escalation in `cancel`.
const CANCEL_KILL_GRACE: Duration = Duration::from_secs(5);

pub struct ProcessSupervisor {
    script_dir: PathBuf,
}

/// What the worker needs back once the child has actually started:
/// enough to record a PID before the process can even finish.
pub struct Launched {
    pub child: Child,
    pub pid: i32,
}

pub struct Finished {
    pub exit_code: i32,
    pub signal: i32,
}

impl ProcessSupervisor {
    pub fn new(script_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: script_dir.into(),
        }
    }

    fn script_path(&self, job_id: i64) -> PathBuf {
        self.script_dir.join(format!("job_{job_id}.sh"))
    }

    /// Writes the job's script to disk (mode 0700) and launches it under
    /// `/bin/bash` as its own process group leader, with stdout/stderr
    /// redirected to the job's configured paths.
    pub async fn launch(&self, job: &Job) -> Result<Launched> {
        fs::create_dir_all(&self.script_dir)
            .await
            .context("creating script directory")?;
        let path = self.script_path(job.id);
        {
            let mut file = fs::File::create(&path).await.context("creating script file")?;
            file.write_all(job.script.as_bytes()).await?;
            file.flush().await?;
        }
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;

        let stdout = open_append(&job.stdout_path).await?;
        let stderr = open_append(&job.stderr_path).await?;

        let mut cmd = Command::new("/bin/bash");
        cmd.arg(&path)
            .current_dir(&job.work_dir)
            .envs(&job.environment)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);

        let child = cmd.spawn().context("spawning job process")?;
        let pid = child
            .id()
            .context("child exited before its pid could be read")? as i32;

        Ok(Launched { child, pid })
    }

    /// Awaits the child to completion and decodes its exit status into
    /// `(code, signal)`, the pair persisted as `Job::exit_code`
    /// (spec.md §3's `"<code>:<signal>"` format).
    pub async fn wait(&self, mut child: Child) -> Result<Finished> {
        let status = child.wait().await.context("waiting on job process")?;
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            let exit_code = status.code().unwrap_or(-1);
            let signal = status.signal().unwrap_or(0);
            Ok(Finished { exit_code, signal })
        }
        #[cfg(not(unix))]
        {
            Ok(Finished {
                exit_code: status.code().unwrap_or(-1),
                signal: 0,
            })
        }
    }

    /// Sends `SIGTERM` to the entire process group, then schedules the
    /// `SIGKILL` escalation in the background if the group is still
    /// alive after `CANCEL_KILL_GRACE` — the same two-step kill
    /// `ChildManager` uses for cancellation.
    pub fn cancel(&self, pid: i32) -> Result<()> {
        send_to_group(pid, libc::SIGTERM)?;
        tokio::spawn(force_kill_if_alive(pid, CANCEL_KILL_GRACE));
        Ok(())
    }
}

/// Waits `grace`, then sends `SIGKILL` to the process group if it's
/// still alive. Spawned by `cancel` rather than awaited inline so a
/// caller asking to cancel a job isn't blocked on the grace period.
async fn force_kill_if_alive(pid: i32, grace: Duration) {
    tokio::time::sleep(grace).await;
    if process_alive(pid) {
        let _ = send_to_group(pid, libc::SIGKILL);
    }
}

async fn open_append(path: &str) -> Result<std::fs::File> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        fs::create_dir_all(parent).await.ok();
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {path} for append"))
}

fn send_to_group(pid: i32, signal: i32) -> Result<()> {
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH just means the group is already gone, which is the
        // outcome we wanted anyway.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).context("kill(-pgid, signal) failed");
        }
    }
    Ok(())
}

/// Probes liveness without sending a signal (`kill(pid, 0)`), used by
/// the startup recovery sweep to tell a still-running orphan from one
/// that died while the daemon was down (spec.md §4.7).
pub fn process_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0
}
