//! Child-side boot: everything between the fork and handing control back
//! to the embedding server.

use crate::bridges::{Bridges, StorageIndex};
use crate::configuration::Config;
use crate::logging;
use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use slog_scope::{error, info};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Handle returned by [`crate::Supervisor::run`] in a freshly forked
/// child. The embedding server keeps it alive for the child's lifetime.
pub struct ForkedChild {
    pid: Pid,
    parent: Pid,
    generation: u64,
    index: Arc<dyn StorageIndex>,
    _log_guard: slog_scope::GlobalLoggerGuard,
}

impl ForkedChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Pid {
        self.parent
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Asks for this child to be replaced, from inside the child: announce
    /// the intent to the parent first, so the coming death is not mistaken
    /// for a crash, then terminate.
    pub fn spawn_new_child(&self) -> Result<()> {
        info!("announcing deliberate death to the parent"; "parent" => self.parent.as_raw());
        kill(self.parent, Signal::SIGUSR1).context("announcing the kill to the parent")?;
        kill(self.pid, Signal::SIGINT).context("terminating self")?;
        Ok(())
    }

    /// Voluntary, orderly termination: flush the index, then exit.
    pub fn shutdown(self) -> Result<()> {
        self.index
            .save()
            .context("saving the storage index on shutdown")?;
        info!("child shutting down"; "generation" => self.generation);
        std::process::exit(0)
    }
}

/// Runs the child boot sequence. Order matters: the exit hook goes in
/// first so the index is flushed even if boot is cut short, then the index
/// is restored, then the deferred boot hook runs, and only then is the
/// fork notification fired.
pub(crate) fn boot(
    settings: &Config,
    bridges: &Bridges,
    parent: Pid,
    generation: u64,
    forked_at: Instant,
) -> Result<ForkedChild> {
    // The parent's log drain died with the fork; rebuild from scratch.
    let logger = logging::root_logger(&settings.log);
    let guard = slog_scope::set_global_logger(logger.new(slog::o!(
        "service" => settings.supervisor.name.clone(),
        "role" => "child",
    )));

    let pid = getpid();

    let index = bridges.index.clone();
    let signals =
        signal_hook::iterator::Signals::new(&[signal_hook::SIGINT, signal_hook::SIGTERM])
            .context("registering the child exit hook")?;
    thread::spawn(move || {
        for _signal in signals.forever() {
            match index.save() {
                Ok(()) => {
                    info!("saved storage index; terminating");
                    std::process::exit(0);
                }
                Err(e) => {
                    error!("failed to save the storage index"; "error" => ?e);
                    std::process::exit(1);
                }
            }
        }
    });

    bridges
        .index
        .restore()
        .context("restoring the storage index")?;
    bridges
        .boot_hook
        .on_child_boot()
        .context("running the child boot hook")?;
    bridges.notifier.child_forked(pid, generation);

    info!("booted new child";
          "pid" => pid.as_raw(),
          "generation" => generation,
          "took" => ?forked_at.elapsed());

    Ok(ForkedChild {
        pid,
        parent,
        generation,
        index: bridges.index.clone(),
        _log_guard: guard,
    })
}
