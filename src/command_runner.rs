use core::fmt;
use std::{fmt::Debug, process::Stdio, time::Duration};

use stacked_errors::{bail_locationless, Error, Result, StackableErr};
use tokio::{
    process::{self, Child},
    time::sleep,
};
use tracing::warn;

use crate::{Command, CommandResult};

/// Detached `Command`s are represented by this struct.
///
/// If the `tracing` crate is used and a subscriber is active, warnings from
/// bad `Drop`s can be issued.
///
/// The `Default` impl is for if an empty runner not attached to anything is
/// needed for some reason.
#[must_use]
#[derive(Default)]
pub struct CommandRunner {
    // this information is kept around for failures
    /// The command this runner was started with
    command: Option<Command>,
    /// The handle to the `Child` process.
    pub child_process: Option<Child>,
    result: Option<CommandResult>,
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // don't try to display `stdout` and `stderr`, leave that for the result
        f.debug_struct("CommandRunner")
            .field("command", &self.command)
            .field("child_process", &self.child_process)
            .field("result", &self.result)
            .finish()
    }
}

impl Drop for CommandRunner {
    fn drop(&mut self) {
        // we could call `try_wait` and see if the process has actually exited or not,
        // but the user should have called one of the consuming functions

        // we purposely parenthesize in this way to avoid calling `panicking` in the
        // normal case
        if self.child_process.is_some() && (!std::thread::panicking()) {
            warn!(
                "A `CommandRunner` was dropped without being properly finished, the command was: \
                 {}",
                self.command
                    .as_ref()
                    .map(|c| c.get_unified_command())
                    .unwrap_or_default()
            )
        }
    }
}

pub(crate) async fn command_runner<C: Into<Stdio>>(
    this: Command,
    stdin_cfg: C,
) -> Result<CommandRunner> {
    let mut cmd = process::Command::new(&this.program);
    if this.env_clear {
        // must happen before the `envs` call
        cmd.env_clear();
    }
    cmd.args(&this.args)
        .envs(this.envs.iter().map(|x| (&x.0, &x.1)))
        .kill_on_drop(true);
    let child = cmd
        .stdin(stdin_cfg)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .stack_err_with_locationless(|| {
            format!("{this:?}.run() -> failed to spawn child process")
        })?;
    Ok(CommandRunner {
        command: Some(this),
        child_process: Some(child),
        result: None,
    })
}

/// Note: there are `send_unix_signal` and `send_unix_sigterm` function that can
/// be enabled by the "nix_support" feature
impl CommandRunner {
    /// Attempts to force the command to exit, but does not wait for the request
    /// to take effect. This does not set `self.result`.
    pub fn start_terminate(&mut self) -> Result<()> {
        if let Some(child_process) = self.child_process.as_mut() {
            child_process.start_kill().stack_err(
                "CommandRunner::start_terminate -> running `start_kill` on the child process \
                 failed",
            )
        } else {
            Ok(())
        }
    }

    /// Forces the command to exit. Drops the internal handle. Returns an error
    /// if some termination method has already been called (this will not
    /// error if the process exited by itself, only if a termination function
    /// that removes the handle has been called).
    ///
    /// `self.result` is set, `self.result.status` is set to `None`, and the
    /// `stdout`/`stderr` are empty since they are no longer collected once
    /// termination is forced.
    pub async fn terminate(&mut self) -> Result<()> {
        if let Some(mut child_process) = self.child_process.take() {
            child_process.kill().await.stack_err(
                "CommandRunner::terminate -> running `kill` on the child process failed",
            )?;
            self.result = Some(CommandResult {
                command: self.command.take().unwrap(),
                status: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
            Ok(())
        } else {
            bail_locationless!(
                "CommandRunner::terminate -> a termination method has already been called"
            )
        }
    }

    /// Returns the `pid` of the child process. Returns `None` if the command
    /// has been terminated or the internal `id` call returned `None`.
    pub fn pid(&self) -> Option<u32> {
        self.child_process.as_ref().and_then(Child::id)
    }

    /// Sends a Unix `Signal` to the process.
    #[cfg(feature = "nix_support")]
    pub fn send_unix_signal(&self, unix_signal: nix::sys::signal::Signal) -> Result<()> {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(
                i32::try_from(
                    self.pid()
                        .stack_err("CommandRunner::send_unix_signal -> PID overflow")?,
                )
                .stack_err("CommandRunner::send_unix_signal -> PID creation fail")?,
            ),
            unix_signal,
        )
        .stack_err("CommandRunner::send_unix_signal -> `nix::sys::signal::kill` failed")?;
        Ok(())
    }

    /// Has the same effect as "Ctrl-C" in a terminal. Users should preferably
    /// `wait_with_timeout` afterwards to wait for the process to exit
    /// correctly.
    #[cfg(feature = "nix_support")]
    pub fn send_unix_sigterm(&self) -> Result<()> {
        self.send_unix_signal(nix::sys::signal::Signal::SIGTERM)
    }

    async fn wait_with_output_internal(&mut self) -> Result<()> {
        let output = self
            .child_process
            .take()
            .stack_err_locationless(
                "`CommandRunner` has already had some termination method called",
            )?
            .wait_with_output()
            .await
            .stack_err_with_locationless(|| {
                format!("{self:?}.wait_with_output() -> failed when waiting on child process")
            })?;
        self.result = Some(CommandResult {
            command: self.command.take().unwrap(),
            status: Some(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        });
        Ok(())
    }

    /// Finishes the `CommandResult` (or stalls forever if the OS command does,
    /// use `wait_with_timeout` for a timeout). Note: If this function
    /// succeeds, it only means that the OS calls and parsing all succeeded,
    /// it does not mean that the command itself had a successful return
    /// status, use `assert_success` or check the `status` on
    /// the `CommandResult`.
    pub async fn wait_with_output(mut self) -> Result<CommandResult> {
        self.wait_with_output_internal().await?;
        Ok(self.result.take().unwrap())
    }

    /// If the command does not complete after `duration`, returns a timeout
    /// error. After `Ok(())` is returned, the `CommandRunner` is finished and
    /// you can call `get_command_result`. Call [Error::is_timeout()] on the
    /// error to see if it was a timeout or another kind of error.
    ///
    /// Note: use `Duration::ZERO` if you want a single attempt
    pub async fn wait_with_timeout(&mut self, duration: Duration) -> Result<()> {
        // backoff control
        let mut interval = Duration::from_millis(1);
        let mut elapsed = Duration::ZERO;
        loop {
            match self
                .child_process
                .as_mut()
                .stack_err_locationless(
                    "CommandRunner::wait_with_timeout -> some termination method has already been \
                     called",
                )?
                .try_wait()
            {
                Ok(o) => {
                    if o.is_some() {
                        break
                    }
                }
                Err(e) => {
                    return Err(Error::from_err_locationless(e)).stack_err_locationless(
                        "CommandRunner::wait_with_timeout failed at `try_wait` before reaching \
                         timeout or completed command",
                    )
                }
            }
            if elapsed > duration {
                return Err(Error::timeout())
            }
            sleep(interval).await;
            elapsed = elapsed.checked_add(interval).unwrap();
            if interval < Duration::from_millis(128) {
                interval = interval.checked_mul(2).unwrap();
            }
        }
        self.wait_with_output_internal().await
    }

    /// After [CommandRunner::wait_with_timeout] is successful, this will return
    /// a reference to the `CommandResult`
    pub fn get_command_result(&mut self) -> Option<&CommandResult> {
        self.result.as_ref()
    }

    /// After [CommandRunner::wait_with_timeout] is successful, this will take
    /// the `CommandResult` from `self`, replacing it with `None`.
    pub fn take_command_result(&mut self) -> Option<CommandResult> {
        self.result.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_with_timeout_times_out_on_a_sleeping_process() {
        let mut runner = Command::new_os_str("/bin/sh")
            .arg("-c")
            .arg("sleep 5")
            .run()
            .await
            .unwrap();
        let err = runner.wait_with_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());
        runner.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_clears_the_child_handle() {
        let mut runner = Command::new_os_str("/bin/sh").arg("-c").arg("sleep 5").run().await.unwrap();
        runner.terminate().await.unwrap();
        assert!(runner.child_process.is_none());
        assert!(runner.terminate().await.is_err());
    }
}
