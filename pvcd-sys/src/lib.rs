//! Process Runner: the only place external programs are invoked from agent
//! logic (`ip`, `brctl`, `dnsmasq`, `arping`, `rbd`, the block-store CLI, the
//! out-of-band power-management helper).
//!
//! Mirrors the blocking, `std::process::Command`-based style the rest of the
//! ecosystem uses for one-shot external tools (see e.g. `sendmail` helpers):
//! no async process machinery, just plain calls callers invoke through
//! `tokio::task::spawn_blocking` so they occupy a blocking thread rather than
//! stalling the coordination-store dispatcher.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Error};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Captured result of a foreground command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Fails with a message including captured stderr if the command did not
    /// exit with code 0. Convenience for the many call sites that just want
    /// "succeed or error".
    pub fn into_result(self) -> Result<Self, Error> {
        if self.success() {
            Ok(self)
        } else {
            bail!(
                "command exited with status {}: {}",
                self.exit_code,
                self.stderr.trim()
            );
        }
    }
}

/// Run `program` with `args` to completion, capturing stdout/stderr/exit
/// code. Blocks the calling thread.
pub fn run_foreground(program: &str, args: &[&str]) -> Result<CommandOutput, Error> {
    tracing::debug!(program, ?args, "running foreground command");
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to spawn {program}"))?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `program` with `args`, detached: stdout/stderr are discarded and the
/// caller does not wait for completion. Used for best-effort side effects
/// like gratuitous ARP where a failure should be logged, not propagated.
pub fn run_background(program: &str, args: &[&str]) -> Result<(), Error> {
    tracing::debug!(program, ?args, "running background command");
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;
    Ok(())
}

/// A handle to a long-running external process (the DHCP/DNS daemon).
///
/// Holds the child for its whole lifetime and guarantees it is signaled on
/// drop, including when the handle is dropped during a panic unwind, so a
/// bug in the owning controller can never leak a stray `dnsmasq`.
pub struct ManagedDaemon {
    child: Child,
    program: String,
}

impl ManagedDaemon {
    /// Spawn `program` with `args` and `environment`, keeping stdout/stderr
    /// piped so callers can drain them into the agent's own log if needed.
    pub fn spawn(
        program: &str,
        args: &[&str],
        environment: &HashMap<String, String>,
    ) -> Result<Self, Error> {
        tracing::info!(program, ?args, "starting managed daemon");
        let child = Command::new(program)
            .args(args)
            .envs(environment)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn daemon {program}"))?;

        Ok(Self {
            child,
            program: program.to_string(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send a signal to the daemon, e.g. `SIGHUP` after a lease/config file
    /// changes, or `SIGTERM` to stop it.
    pub fn signal(&self, sig: Signal) -> Result<(), Error> {
        signal::kill(Pid::from_raw(self.child.id() as i32), sig)
            .with_context(|| format!("failed to signal daemon {}", self.program))
    }

    /// True if the process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for ManagedDaemon {
    fn drop(&mut self) {
        if let Err(err) = self.signal(Signal::SIGTERM) {
            tracing::warn!(program = %self.program, %err, "failed to terminate managed daemon on drop");
        }
        // best-effort reap so we don't leave a zombie; a hung daemon that
        // ignores SIGTERM is the operator's problem, not something we block on.
        let _ = self.child.try_wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreground_captures_output_and_exit_code() {
        let out = run_foreground("sh", &["-c", "echo hello; exit 3"]).unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.success());
        assert!(out.into_result().is_err());
    }

    #[test]
    fn managed_daemon_is_signalable_and_reaped_on_drop() {
        let mut daemon =
            ManagedDaemon::spawn("sh", &["-c", "trap 'exit 0' TERM; sleep 30"], &HashMap::new())
                .unwrap();
        assert!(daemon.is_running());
        daemon.signal(Signal::SIGTERM).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!daemon.is_running());
    }
}
