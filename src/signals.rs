//! Deliberate-death announcements.
//!
//! A child that kills itself first sends the parent SIGUSR1, so the parent
//! can classify the imminent death as intentional rather than as a crash.
//! Like the reaper, the handler only pokes a self-pipe; the supervising
//! loop does all the bookkeeping.

use anyhow::{Context, Result};
use futures::future::FutureExt;
use std::os::unix::net::UnixStream;
use tokio::io::AsyncReadExt;

/// Sets up the SIGUSR1 handler. Parent-only.
pub fn setup_death_notice_handler() -> Result<DeathNotices> {
    let (read, write) =
        UnixStream::pair().context("Could not initialize death notice socket pair")?;
    signal_hook::pipe::register(signal_hook::SIGUSR1, write)
        .context("registering sigusr1 handler")?;
    read.set_nonblocking(true)
        .context("marking the death notice pipe non-blocking")?;
    let socket =
        tokio::net::UnixStream::from_std(read).context("registering the death notice pipe")?;
    Ok(DeathNotices { socket })
}

pub struct DeathNotices {
    socket: tokio::net::UnixStream,
}

impl DeathNotices {
    /// Waits for the next announcement. Several signals arriving back to
    /// back coalesce into one notice, which is all the classification
    /// needs.
    pub async fn next_notice(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        self.socket
            .read(&mut buf)
            .await
            .context("Failed to read from the death notice pipe")?;
        Ok(())
    }

    /// Consumes an already-pending announcement without blocking. The loop
    /// calls this before classifying a reaped death, so an announcement
    /// that raced its own SIGCHLD still wins.
    pub fn drain(&mut self) -> bool {
        self.next_notice()
            .now_or_never()
            .map_or(false, |read| read.is_ok())
    }
}
