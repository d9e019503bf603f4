use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use slog_scope::debug;
use std::os::unix::net::UnixStream;
use tokio::io::AsyncReadExt;

/// A terminated child, together with the wait status the kernel reported
/// for it. The status is what lets the supervisor log *how* a child died
/// when it pauses on a boot crash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Death {
    pub pid: Pid,
    pub status: WaitStatus,
}

/// Sets up a SIGCHLD handler that wakes [`Zombies::reap`] through a
/// self-pipe, so reaping happens on the supervising loop rather than in
/// signal context.
pub fn setup_child_exit_handler() -> Result<Zombies> {
    let (read, write) =
        UnixStream::pair().context("Could not initialize signal handler socket pair")?;
    signal_hook::pipe::register(signal_hook::SIGCHLD, write)
        .context("registering sigchld handler")?;
    read.set_nonblocking(true)
        .context("marking the sigchld pipe non-blocking")?;
    let socket =
        tokio::net::UnixStream::from_std(read).context("registering the sigchld pipe")?;
    Ok(Zombies { socket })
}

pub struct Zombies {
    socket: tokio::net::UnixStream,
}

impl Zombies {
    /// Waits for the next child to terminate and reaps it with a
    /// non-blocking `waitpid`.
    pub async fn reap(&mut self) -> Result<Death> {
        let flags = WaitPidFlag::empty() | WaitPidFlag::WNOHANG;

        use WaitStatus::*;
        loop {
            match waitpid(None, Some(flags)) {
                Ok(Exited(pid, code)) => {
                    return Ok(Death {
                        pid,
                        status: Exited(pid, code),
                    });
                }
                Ok(Signaled(pid, signal, core_dumped)) => {
                    return Ok(Death {
                        pid,
                        status: Signaled(pid, signal, core_dumped),
                    });
                }
                Ok(StillAlive) |
                // peaceful: we have no children.
                Err(nix::Error::Sys(Errno::ECHILD)) => {}

                // any other error: probably not great.
                Err(e) => {
                    return Err(e.into());
                }

                // Anything else is a status change we don't care about.
                e => {
                    debug!("ignoring process status change"; "change" => ?e);
                }
            }

            // Nothing is ready to be reaped; sleep until the next SIGCHLD
            // pokes the pipe.
            let mut buf = [0u8; 256];
            self.socket
                .read(&mut buf)
                .await
                .context("Failed to read from the zombie notification pipe")?;
        }
    }
}
