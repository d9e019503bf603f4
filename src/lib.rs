//! Hot-reload supervision for a forking server.
//!
//! refork keeps exactly one worker child alive and replaces it on demand:
//! an external change trigger asks for a reload, the current child is told
//! to die, its exit hook saves the persistent-storage position, and the
//! parent forks a successor that restores it. [`Supervisor::run`] never
//! returns in the parent; every freshly forked child returns from it with
//! a [`ForkedChild`] in hand and goes on to serve.

#![recursion_limit = "2048"] // select! needs a higher recursion limit /:

use anyhow::Context;
use anyhow::Result;
use bridges::Bridges;
use fork_loop::{
    ChildDied, ChildForked, DeathAnnounced, ForkFailed, ForkLoop, ForkStarted, KillIssued,
    ReloadRequested, Started, Todo,
};
use futures::select;
use futures::{future::FutureExt, Stream, StreamExt};
use health::{HealthIndicator, Verdict};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use parking_lot::Mutex;
use reaper::{Death, Zombies};
use signals::DeathNotices;
use slog::o;
use slog_scope::{crit, error, info, warn};
use std::{sync::Arc, time::Instant};

mod child;
mod health;

pub mod bridges;
pub mod configuration;
pub mod fork_loop;
pub mod logging;
pub mod reaper;
pub mod signals;

pub use bridges::{BootHook, FileIndex, Notifier, StorageIndex};
pub use child::ForkedChild;

#[derive(Debug, Clone, PartialEq)]
struct ReloadRequest;

/// Cloneable handle through which a change trigger (a file watcher, a
/// signal, an admin endpoint) requests a reload. Requests are queued into
/// the supervising loop; the loop performs all state changes itself.
#[derive(Clone)]
pub struct ReloadHandle {
    requests: async_channel::Sender<ReloadRequest>,
}

impl ReloadHandle {
    /// The supervisor's sole external entry point: ask for the current
    /// child to be replaced by a fresh fork. Safe to call at any time from
    /// any thread of the parent. Requests that cannot be honored are
    /// answered with a logged no-op, never an error.
    pub fn spawn_new_child(&self) {
        if let Err(e) = self.requests.try_send(ReloadRequest) {
            warn!("dropping reload request; the supervising loop is not listening"; "error" => ?e);
        }
    }
}

#[derive(Clone)]
struct Lifecycle(Arc<Mutex<Option<ForkLoop>>>);

impl Lifecycle {
    fn new(machine: ForkLoop) -> Self {
        Lifecycle(Arc::new(Mutex::new(Some(machine))))
    }

    fn interrogate<T>(&self, with: fn(&ForkLoop) -> T) -> T {
        self.0.lock().as_ref().map(with).unwrap()
    }

    fn update(&self, with: impl Fn(ForkLoop) -> ForkLoop) {
        let mut guard = self.0.lock();
        let new_machine = guard.take().map(with);
        *guard = new_machine;
    }
}

impl HealthIndicator for Lifecycle {
    fn health_check(&self) -> Verdict {
        self.interrogate(|machine| match machine {
            ForkLoop::Alive(_) | ForkLoop::Draining(_) | ForkLoop::Respawning(_) => {
                Verdict::Healthy
            }
            ForkLoop::Startup(_) | ForkLoop::Forking(_) => {
                Verdict::Unhealthy(anyhow::anyhow!("still booting the first child").into())
            }
            state => {
                Verdict::Unhealthy(anyhow::anyhow!("fork loop in state {:?}", state).into())
            }
        })
    }
}

/// Existence probe for the previous child. Deliberately checks whether the
/// process is there, not any of our bookkeeping flags.
fn process_exists(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// What woke the supervising loop up.
enum Wake {
    Tick,
    Death(Death),
    Notice,
    Reload,
}

/// Only the child ever escapes the supervising loop; this is what it
/// carries out with it.
struct ChildBirth {
    generation: u64,
    forked_at: Instant,
}

// let's try (at least on this function call level) to ensure all
// problematic conditions are handled in a way that doesn't leave this
// loop:
#[forbid(
    clippy::option_unwrap_used,
    clippy::result_unwrap_used,
    clippy::option_expect_used,
    clippy::result_expect_used
)]
async fn supervise(
    machine: Lifecycle,
    mut zombies: Zombies,
    mut notices: DeathNotices,
    requests: async_channel::Receiver<ReloadRequest>,
    ticker: Box<dyn Stream<Item = Instant> + std::marker::Unpin>,
) -> ChildBirth {
    let mut known_broken = false;
    let mut ticker = ticker.fuse();
    let mut requests = requests.fuse();

    loop {
        if machine.interrogate(|m| matches!(m, ForkLoop::Error)) {
            // The machine was driven into a transition it has no answer
            // for. Stay up, mark ourselves unhealthy and keep the child
            // table clean.
            if !known_broken {
                crit!("fork loop machine faulted; only reaping from here on");
                known_broken = true;
            }
            match zombies.reap().await {
                Ok(death) => info!("reaped child"; "pid" => death.pid.as_raw()),
                Err(e) => info!("failed to reap"; "error" => ?e),
            }
            continue;
        }

        // Read one wakeup off the environment:
        let wake = select! {
            tick = ticker.next() => tick.map(|_| Wake::Tick),
            death = zombies.reap().fuse() => match death {
                Ok(death) => Some(Wake::Death(death)),
                Err(e) => {
                    info!("failed to reap"; "error" => ?e);
                    None
                }
            },
            notice = notices.next_notice().fuse() => match notice {
                Ok(()) => Some(Wake::Notice),
                Err(e) => {
                    warn!("failed to read death notice"; "error" => ?e);
                    None
                }
            },
            req = requests.next() => req.map(|_| Wake::Reload),
        };

        match wake {
            None => {}
            Some(Wake::Tick) => {
                if let Some(Todo::ForkChild) = machine
                    .interrogate(|m| m.required_action())
                    .and_then(|todo| todo)
                {
                    let still_alive = machine
                        .interrogate(|m| m.last_child())
                        .and_then(|pid| pid)
                        .filter(|pid| process_exists(*pid));
                    if let Some(pid) = still_alive {
                        info!("previous child has not died yet; delaying the fork";
                              "pid" => pid.as_raw());
                    } else {
                        machine.update(|m| m.on_fork_started(ForkStarted()));
                        let forked_at = Instant::now();
                        match fork() {
                            Ok(ForkResult::Child) => {
                                let generation =
                                    machine.interrogate(|m| m.generation()).unwrap_or(0);
                                return ChildBirth {
                                    generation,
                                    forked_at,
                                };
                            }
                            Ok(ForkResult::Parent { child, .. }) => {
                                machine.update(move |m| {
                                    m.on_child_forked(ChildForked::new(child))
                                });
                            }
                            Err(e) => {
                                error!("fork failed"; "error" => ?e);
                                machine.update(|m| m.on_fork_failed(ForkFailed()));
                            }
                        }
                    }
                }
            }
            Some(Wake::Death(death)) => {
                // A child that kills itself races its own SIGCHLD; honor
                // an announcement that is already pending before
                // classifying the death.
                if notices.drain() {
                    machine.update(|m| m.on_death_announced(DeathAnnounced()));
                }
                info!("reaped child"; "pid" => death.pid.as_raw(), "status" => ?death.status);
                machine.update(move |m| m.on_child_died(ChildDied::new(death.pid, death.status)));
            }
            Some(Wake::Notice) => {
                machine.update(|m| m.on_death_announced(DeathAnnounced()));
            }
            Some(Wake::Reload) => {
                machine.update(|m| m.on_reload_requested(ReloadRequested()));
                if let Some(Todo::KillChild(pid)) = machine
                    .interrogate(|m| m.required_action())
                    .and_then(|todo| todo)
                {
                    info!("sending deliberate kill"; "pid" => pid.as_raw());
                    match kill(pid, Signal::SIGINT) {
                        Ok(()) => machine.update(|m| m.on_kill_issued(KillIssued())),
                        Err(e) => {
                            warn!("failed to signal the child"; "pid" => pid.as_raw(), "error" => ?e)
                        }
                    }
                }
            }
        }
    }
}

/// The supervisor: owns the lifecycle machine and the collaborator
/// bridges, and is handed to the process entry point.
pub struct Supervisor {
    settings: configuration::Config,
    bridges: Bridges,
    requests_tx: async_channel::Sender<ReloadRequest>,
    requests_rx: async_channel::Receiver<ReloadRequest>,
}

impl Supervisor {
    pub fn new(settings: configuration::Config, bridges: Bridges) -> Supervisor {
        let (requests_tx, requests_rx) = async_channel::bounded(16);
        Supervisor {
            settings,
            bridges,
            requests_tx,
            requests_rx,
        }
    }

    /// A handle for the change trigger. May be cloned freely; every clone
    /// feeds the same supervising loop.
    pub fn reload_handle(&self) -> ReloadHandle {
        ReloadHandle {
            requests: self.requests_tx.clone(),
        }
    }

    /// Runs the supervisor.
    ///
    /// Never returns in the parent. Returns in every freshly forked child,
    /// after the child's boot sequence, so the caller can start serving.
    pub async fn run(self) -> Result<ForkedChild> {
        let guard = slog_scope::set_global_logger(
            slog_scope::logger().new(o!("service" => self.settings.supervisor.name.to_string())),
        );

        let parent = getpid();
        info!("fork loop starting"; "pid" => parent.as_raw());

        let zombies =
            reaper::setup_child_exit_handler().context("Could not set up child exit handler")?;
        let notices = signals::setup_death_notice_handler()
            .context("Could not set up death notice handler")?;
        let ticker: Box<dyn Stream<Item = Instant> + std::marker::Unpin> =
            Box::new(self.settings.reload.ticker());

        let machine = Lifecycle::new(ForkLoop::new());
        machine.update(|m| m.on_started(Started()));

        let birth = if let Some(hc) = self.settings.health_check.clone() {
            select! {
                birth = supervise(machine.clone(), zombies, notices, self.requests_rx.clone(), ticker).fuse() => birth,
                res = health::healthcheck_server(hc, machine).fuse() => {
                    crit!("healthcheck server terminated"; "result" => ?res);
                    unreachable!("the health server must outlive the supervisor");
                }
            }
        } else {
            supervise(machine, zombies, notices, self.requests_rx.clone(), ticker).await
        };

        // Only the child gets here. The parent's logger scope must not be
        // torn down underneath the child's own.
        guard.cancel_reset();
        child::boot(
            &self.settings,
            &self.bridges,
            parent,
            birth.generation,
            birth.forked_at,
        )
    }
}
