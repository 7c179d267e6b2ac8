// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time};

use nix::sys::signal;
use nix::unistd::getpgid;
use nix::unistd::Pid;
use tokio::process::{Child, Command};

const GRACEFUL_SHUTDOWN_POLL_TIME: time::Duration = time::Duration::from_millis(50);

/// A child process running in its own PGID, with a drop implementation that will kill that
/// PGID.
///
/// The execution bridge spawns the agent entrypoint via `ManagedChild` so that a hung or
/// uncooperative child (and anything it has itself forked) can always be reaped without leaving
/// orphans behind, regardless of which exit path the session takes (normal completion, protocol
/// fault, or a panic unwinding through the bridge).
pub struct ManagedChild {
    child: Child,
    graceful_shutdown_timeout: time::Duration,
    killed: AtomicBool,
}

impl ManagedChild {
    pub fn spawn(
        mut command: Command,
        graceful_shutdown_timeout: time::Duration,
    ) -> Result<Self, String> {
        // Set `kill_on_drop` to encourage `tokio` to `wait` the process via its own "reaping"
        // mechanism:
        //   see https://docs.rs/tokio/latest/tokio/process/struct.Command.html#method.kill_on_drop
        command.kill_on_drop(true);

        // Adjust the Command to create its own PGID as it starts, to make it safe to kill the
        // PGID later without also signaling the parent's process group.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map(|_pgid| ()).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("Could not create new pgid: {e}"),
                    )
                })
            });
        };

        let child = command
            .spawn()
            .map_err(|e| format!("Error spawning child process: {e}"))?;
        Ok(Self {
            child,
            graceful_shutdown_timeout,
            killed: AtomicBool::new(false),
        })
    }

    fn get_pgid(&self) -> Result<Pid, String> {
        let pid = self.id().ok_or_else(|| "Process had no PID.".to_owned())?;
        let pgid = getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| format!("Could not get process group id of child process: {e}"))?;
        Ok(pgid)
    }

    /// Send a signal to the child process group.
    fn signal_pg<T: Into<Option<signal::Signal>>>(&mut self, signal: T) -> Result<(), String> {
        let pgid = self.get_pgid()?;
        // the negative PGID will signal the entire process group.
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal)
            .map_err(|e| format!("Failed to signal child process group: {e}"))?;
        Ok(())
    }

    /// Check if the child has exited.
    ///
    /// This returns true if the child has exited with any return code, or false if the child has
    /// not yet exited. An error indicates a system error checking the result of the child
    /// process, and does not necessarily indicate whether it has exited.
    fn check_child_has_exited(&mut self) -> Result<bool, String> {
        self.child
            .try_wait()
            .map(|o| o.is_some())
            .map_err(|e| e.to_string())
    }

    /// Synchronously wait for the child to exit.
    ///
    /// This method will repeatedly poll the child process until it exits, an error occurs, or
    /// the timeout is reached.
    ///
    /// A return value of Ok(true) indicates that the child has terminated, Ok(false) indicates
    /// that we reached the max_wait_duration while waiting for the child to terminate.
    ///
    /// This method *will* block the current thread but will do so for a bounded amount of time.
    pub fn wait_for_child_exit_sync(
        &mut self,
        max_wait_duration: time::Duration,
    ) -> Result<bool, String> {
        let deadline = time::Instant::now() + max_wait_duration;
        while time::Instant::now() <= deadline {
            if self.check_child_has_exited()? {
                return Ok(true);
            }
            thread::sleep(GRACEFUL_SHUTDOWN_POLL_TIME);
        }
        // if we get here we have timed-out
        Ok(false)
    }

    /// Attempt to gracefully shut down the process.
    ///
    /// This will send a SIGINT to the process group and give it a chance to shut down
    /// gracefully. If it does not respond within the configured timeout, a SIGKILL is sent to
    /// the whole group.
    ///
    /// This method *will* block the current thread but will do so for a bounded amount of time.
    pub fn graceful_shutdown_sync(&mut self) -> Result<(), String> {
        self.signal_pg(signal::Signal::SIGINT)?;
        match self.wait_for_child_exit_sync(self.graceful_shutdown_timeout) {
            Ok(true) => {
                self.killed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(false) => {
                log::warn!(
                    "Timed out waiting for graceful shutdown of child process group. Will try SIGKILL instead."
                );
                self.kill_pgid()
            }
            Err(e) => {
                log::warn!(
                    "An error occurred while waiting for graceful shutdown of child process group ({e}). Will try SIGKILL instead."
                );
                self.kill_pgid()
            }
        }
    }

    /// Kill the process's unique PGID, or return an error if we don't have a PID or cannot kill.
    fn kill_pgid(&mut self) -> Result<(), String> {
        self.signal_pg(signal::Signal::SIGKILL)?;
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Deref for ManagedChild {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ManagedChild {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

/// Implements drop by killing the process group, unless a graceful shutdown has already
/// succeeded.
impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::SeqCst) {
            let _ = self.graceful_shutdown_sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ManagedChild;
    use std::time::Duration;
    use tokio::process::Command;

    #[tokio::test]
    async fn spawns_and_reports_exit() {
        let mut command = Command::new("true");
        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        let mut child =
            ManagedChild::spawn(command, Duration::from_secs(5)).expect("should spawn");
        let exited = child
            .wait_for_child_exit_sync(Duration::from_secs(5))
            .expect("should not error");
        assert!(exited);
    }

    #[tokio::test]
    async fn graceful_shutdown_kills_unresponsive_child() {
        let mut command = Command::new("sleep");
        command.arg("60");
        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        let mut child =
            ManagedChild::spawn(command, Duration::from_millis(200)).expect("should spawn");
        child
            .graceful_shutdown_sync()
            .expect("shutdown should eventually succeed via SIGKILL");
        let exited = child
            .wait_for_child_exit_sync(Duration::from_secs(5))
            .expect("should not error");
        assert!(exited);
    }
}
