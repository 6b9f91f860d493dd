//! Child process primitives: spawn a runner as the leader of its own process
//! group with stdout and stderr merged into a single pipe, and signal that
//! group as a unit.

use std::io::{self, PipeReader};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Signal {
    /// SIGTERM
    #[strum(to_string = "SIGTERM")]
    Terminate,
    /// SIGKILL
    #[strum(to_string = "SIGKILL")]
    Kill,
}

/// Cheap, cloneable reference to a live child process group.
///
/// The supervisor owns the process itself; this handle only lets other
/// callers signal the group and observe when the child has been reaped.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pid: u32,
    exited: watch::Receiver<bool>,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait up to `timeout` for the child to be reaped. Returns true if it was.
    pub async fn wait_exited(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.exited.wait_for(|exited| *exited)).await {
            Ok(Ok(_)) => true,
            // Sender dropped: the supervisor is gone, so is the child.
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }

    /// Send `signal` to every process in the child's group.
    pub fn signal_group(&self, signal: Signal) -> io::Result<()> {
        if self.has_exited() {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        signal_group(self.pid, signal)
    }
}

/// A freshly spawned child together with the read end of its output pipe.
pub struct SpawnedChild {
    child: tokio::process::Child,
    /// Combined stdout and stderr of the child
    output: Option<PipeReader>,
    handle: ChildHandle,
    exited_tx: watch::Sender<bool>,
}

impl SpawnedChild {
    pub fn handle(&self) -> ChildHandle {
        self.handle.clone()
    }

    /// Take the read end of the output pipe; `None` once taken.
    pub fn take_output(&mut self) -> Option<PipeReader> {
        self.output.take()
    }

    /// Wait for the child to exit and tell every handle holder about it.
    pub async fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        let status = self.child.wait().await;
        self.exited_tx.send_replace(true);
        status
    }
}

impl std::fmt::Debug for SpawnedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedChild")
            .field("pid", &self.handle.pid)
            .finish_non_exhaustive()
    }
}

/// Spawn `command` in a new process group with stdout and stderr sharing one pipe.
#[cfg(unix)]
pub fn spawn_in_group(mut command: std::process::Command) -> io::Result<SpawnedChild> {
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;

    let (read_end, write_end) = io::pipe()?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end.try_clone()?))
        .stderr(Stdio::from(write_end))
        .process_group(0);

    let mut command = tokio::process::Command::from(command);
    command.kill_on_drop(true);
    let child = command.spawn()?;
    // Our copies of the write end live in `command`; close them so the
    // reader sees EOF once the child side is gone.
    drop(command);

    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("child exited before its pid could be read"))?;
    let (exited_tx, exited_rx) = watch::channel(false);
    Ok(SpawnedChild {
        child,
        output: Some(read_end),
        handle: ChildHandle {
            pid,
            exited: exited_rx,
        },
        exited_tx,
    })
}

#[cfg(not(unix))]
pub fn spawn_in_group(_command: std::process::Command) -> io::Result<SpawnedChild> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are only supported on unix hosts",
    ))
}

#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions.
    if unsafe { libc::killpg(pgid, signo) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are only supported on unix hosts",
    ))
}

/// True if the error only says the target process group no longer exists.
pub fn is_already_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}
