//! Supervises the optional user program the agent was asked to run,
//! generalizing `runProgram`/`signalProcess` in `cmd/local/main.go`:
//! spawn with inherited stdio, inject `PORT` only if the caller didn't
//! already set one, forward signals, and mirror the child's exit status.

use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::{error, info};

const DEFAULT_PORT: &str = "5000";

pub struct ChildProcess {
    child: Child,
    /// The port the child was told to listen on, so the agent's local
    /// dial target can be derived even when `PORT` wasn't already set.
    pub port: String,
}

impl ChildProcess {
    /// Spawns `program` (joined into one shell command line, matching
    /// the original's `/bin/sh -c` invocation) with inherited stdio.
    pub fn spawn(program_args: &[String]) -> std::io::Result<Self> {
        let program = program_args.join(" ");
        let port = std::env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&program);
        if std::env::var("PORT").is_err() {
            command.env("PORT", &port);
        }

        info!("starting supervised program: {program}");
        let child = command.spawn()?;
        Ok(Self { child, port })
    }

    /// Forwards `signal` to the child process. Best-effort: a child that
    /// has already exited yields an error here, which the caller should
    /// treat as "nothing to signal", not fatal.
    pub fn signal(&self, signal: i32) -> std::io::Result<()> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "child has already exited"))?;
        // SAFETY: `kill(2)` with a valid pid and a standard signal number
        // has no memory-safety implications; failure is reported through
        // errno, which `nix`-free raw `libc` wiring propagates as `-1`.
        let ret = unsafe { libc::kill(pid as i32, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    /// Waits for the child to exit and mirrors its status to the
    /// process's own exit code, the way the original calls `os.Exit`
    /// with the child's `WaitStatus`.
    pub async fn wait_and_exit(mut self) -> ! {
        match self.child.wait().await {
            Ok(status) => std::process::exit(exit_code(status)),
            Err(err) => {
                error!("error waiting for supervised program: {err}");
                std::process::exit(1);
            }
        }
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

#[cfg(unix)]
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(1)
}

#[cfg(not(unix))]
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
