//! The fork/kill/respawn lifecycle of the supervised child, expressed as a
//! state machine.
//!
//! The machine is pure: it holds no file descriptors and makes no syscalls.
//! The supervising loop feeds it events (reaps arrive as [`ChildDied`],
//! deliberate-death announcements as [`DeathAnnounced`], reload requests as
//! [`ReloadRequested`]) and carries out whatever [`Todo`] the current state
//! demands. Forking and killing are thereby observable as ordinary
//! transitions in tests, with no processes harmed.
//!
//! A death is classified by the `kill_sent` marker, which is set the moment
//! a terminate signal is issued or announced, before the death is
//! confirmed. A crash racing a deliberate kill can therefore be recorded as
//! intentional; that window is inherited behavior, not an accident, and
//! must not be narrowed without flagging it.

use machine::*;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use slog_scope::{debug, info, warn};
use std::{fmt, time::Instant};
use thiserror::Error;

/// Side effects the supervising loop must perform on the machine's behalf.
#[derive(Debug, PartialEq, Clone)]
pub enum Todo {
    /// Fork a fresh child on the next poll tick.
    ForkChild,
    /// Send the terminate signal to the given child.
    KillChild(Pid),
}

/// Why a reload request was refused.
#[derive(Error, Debug, PartialEq)]
pub enum Rejection {
    #[error("fork loop is not running")]
    NotRunning,

    #[error("a fork is already in progress")]
    ForkInProgress,

    #[error("no child has been forked yet; nothing to replace")]
    NoChild,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct State {
    child_pid: Option<Pid>,
    generation: u64,
    kill_sent: bool,
    supervising_since: Option<Instant>,
    child_started: Option<Instant>,
}

machine! {
    #[derive(Clone, PartialEq)]
    pub enum ForkLoop {
        Idle { state: State },
        Startup { state: State },
        Forking { state: State },
        Alive { state: State },
        Draining { state: State },
        Respawning { state: State },
        Paused { state: State },
    }
}

impl fmt::Debug for ForkLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForkLoop::")?;
        let (name, state) = match self {
            ForkLoop::Idle(Idle { state }) => ("Idle", state),
            ForkLoop::Startup(Startup { state }) => ("Startup", state),
            ForkLoop::Forking(Forking { state }) => ("Forking", state),
            ForkLoop::Alive(Alive { state }) => ("Alive", state),
            ForkLoop::Draining(Draining { state }) => ("Draining", state),
            ForkLoop::Respawning(Respawning { state }) => ("Respawning", state),
            ForkLoop::Paused(Paused { state }) => ("Paused", state),
            ForkLoop::Error => {
                write!(f, "Error")?;
                return Ok(());
            }
        };
        write!(
            f,
            "{}(generation:{}, child:{:?}, kill_sent:{}, up:{:?}, child_up:{:?})",
            name,
            state.generation,
            state.child_pid.map(|p| p.as_raw()),
            state.kill_sent,
            state.supervising_since.map(|t| t.elapsed()),
            state.child_started.map(|t| t.elapsed()),
        )
    }
}

/// The supervising loop has started polling.
#[derive(Clone, Debug, PartialEq)]
pub struct Started();

/// An external change trigger asked for the child to be replaced.
#[derive(Clone, Debug, PartialEq)]
pub struct ReloadRequested();

/// The loop is about to call `fork()`.
#[derive(Clone, Debug, PartialEq)]
pub struct ForkStarted();

/// `fork()` returned in the parent.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildForked {
    pid: Pid,
}

impl ChildForked {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

/// `fork()` failed outright.
#[derive(Clone, Debug, PartialEq)]
pub struct ForkFailed();

/// The loop has sent the terminate signal to the child.
#[derive(Clone, Debug, PartialEq)]
pub struct KillIssued();

/// A terminated process was reaped.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildDied {
    pid: Pid,
    status: WaitStatus,
}

impl ChildDied {
    pub fn new(pid: Pid, status: WaitStatus) -> Self {
        Self { pid, status }
    }
}

/// The child announced (via SIGUSR1) that its coming death is intentional.
#[derive(Clone, Debug, PartialEq)]
pub struct DeathAnnounced();

transitions!(ForkLoop, [
    (Idle, Started) => Startup,
    (Idle, ReloadRequested) => Idle,

    (Startup, ReloadRequested) => Startup,
    (Startup, ForkStarted) => Forking,
    (Startup, ChildDied) => Startup,
    (Startup, DeathAnnounced) => Startup,

    (Forking, ChildForked) => Alive,
    (Forking, ForkFailed) => Paused,
    (Forking, ReloadRequested) => Forking,
    (Forking, ChildDied) => Forking,
    (Forking, DeathAnnounced) => Forking,

    (Alive, ReloadRequested) => Draining,
    (Alive, DeathAnnounced) => Draining,
    (Alive, ChildDied) => [Alive, Paused],

    (Draining, ReloadRequested) => Draining,
    (Draining, KillIssued) => Draining,
    (Draining, DeathAnnounced) => Draining,
    (Draining, ChildDied) => [Draining, Respawning],

    (Respawning, ReloadRequested) => Respawning,
    (Respawning, ForkStarted) => Forking,
    (Respawning, ChildDied) => Respawning,
    (Respawning, DeathAnnounced) => Respawning,

    (Paused, ReloadRequested) => Respawning,
    (Paused, ChildDied) => Paused,
    (Paused, DeathAnnounced) => Paused
]);

methods!(ForkLoop, [
    Startup, Draining, Respawning => fn required_action(&self) -> Option<Todo>,
    Startup, Forking, Alive, Draining, Respawning, Paused => fn generation(&self) -> u64,
    Forking, Alive, Draining, Respawning, Paused => fn last_child(&self) -> Option<Pid>
]);

impl Idle {
    fn on_started(self, _: Started) -> Startup {
        let mut state = self.state;
        state.supervising_since = Some(Instant::now());
        Startup { state }
    }

    fn on_reload_requested(self, _: ReloadRequested) -> Idle {
        warn!("rejecting reload request"; "reason" => %Rejection::NotRunning);
        self
    }
}

impl Startup {
    fn on_reload_requested(self, _: ReloadRequested) -> Startup {
        warn!("rejecting reload request"; "reason" => %Rejection::NoChild);
        self
    }

    fn on_fork_started(self, _: ForkStarted) -> Forking {
        let mut state = self.state;
        state.generation += 1;
        state.child_started = Some(Instant::now());
        Forking { state }
    }

    fn on_child_died(self, d: ChildDied) -> Startup {
        debug!("ignoring exit of unrelated process"; "pid" => d.pid.as_raw());
        self
    }

    fn on_death_announced(self, _: DeathAnnounced) -> Startup {
        debug!("ignoring death notice; no child is being supervised");
        self
    }

    fn required_action(&self) -> Option<Todo> {
        Some(Todo::ForkChild)
    }

    fn generation(&self) -> u64 {
        self.state.generation
    }
}

impl Forking {
    fn on_child_forked(self, f: ChildForked) -> Alive {
        let mut state = self.state;
        state.child_pid = Some(f.pid);
        // The new child's future death defaults to "unexpected" until a
        // kill is issued.
        state.kill_sent = false;
        info!("forked new child"; "pid" => f.pid.as_raw(), "generation" => state.generation);
        Alive { state }
    }

    fn on_fork_failed(self, _: ForkFailed) -> Paused {
        warn!("fork failed; pausing the loop until the next reload request");
        Paused { state: self.state }
    }

    fn on_reload_requested(self, _: ReloadRequested) -> Forking {
        warn!("rejecting reload request"; "reason" => %Rejection::ForkInProgress);
        self
    }

    fn on_child_died(self, d: ChildDied) -> Forking {
        debug!("ignoring exit of unrelated process"; "pid" => d.pid.as_raw());
        self
    }

    fn on_death_announced(self, _: DeathAnnounced) -> Forking {
        debug!("ignoring death notice while forking");
        self
    }

    fn generation(&self) -> u64 {
        self.state.generation
    }

    fn last_child(&self) -> Option<Pid> {
        self.state.child_pid
    }
}

impl Alive {
    fn on_reload_requested(self, _: ReloadRequested) -> Draining {
        info!("reload requested; replacing child";
              "pid" => self.state.child_pid.map(|p| p.as_raw()));
        Draining { state: self.state }
    }

    fn on_death_announced(self, _: DeathAnnounced) -> Draining {
        let mut state = self.state;
        state.kill_sent = true;
        info!("child announced its own, deliberate termination";
              "pid" => state.child_pid.map(|p| p.as_raw()));
        Draining { state }
    }

    fn on_child_died(self, d: ChildDied) -> ForkLoop {
        let mut state = self.state;
        if state.child_pid != Some(d.pid) {
            debug!("ignoring exit of unrelated process"; "pid" => d.pid.as_raw());
            return ForkLoop::alive(state);
        }
        warn!("child died without a deliberate kill; pausing the fork loop until the next reload request";
              "pid" => d.pid.as_raw(), "status" => ?d.status);
        state.kill_sent = true;
        ForkLoop::paused(state)
    }

    fn generation(&self) -> u64 {
        self.state.generation
    }

    fn last_child(&self) -> Option<Pid> {
        self.state.child_pid
    }
}

impl Draining {
    fn on_reload_requested(self, _: ReloadRequested) -> Draining {
        info!("child is already being replaced; a fresh fork follows its death");
        self
    }

    fn on_kill_issued(self, _: KillIssued) -> Draining {
        let mut state = self.state;
        state.kill_sent = true;
        Draining { state }
    }

    fn on_death_announced(self, _: DeathAnnounced) -> Draining {
        let mut state = self.state;
        state.kill_sent = true;
        Draining { state }
    }

    fn on_child_died(self, d: ChildDied) -> ForkLoop {
        let mut state = self.state;
        if state.child_pid != Some(d.pid) {
            debug!("ignoring exit of unrelated process"; "pid" => d.pid.as_raw());
            return ForkLoop::draining(state);
        }
        info!("child exited after a deliberate kill; scheduling respawn";
              "pid" => d.pid.as_raw(), "status" => ?d.status);
        ForkLoop::respawning(state)
    }

    fn required_action(&self) -> Option<Todo> {
        if self.state.kill_sent {
            None
        } else {
            self.state.child_pid.map(Todo::KillChild)
        }
    }

    fn generation(&self) -> u64 {
        self.state.generation
    }

    fn last_child(&self) -> Option<Pid> {
        self.state.child_pid
    }
}

impl Respawning {
    fn on_reload_requested(self, _: ReloadRequested) -> Respawning {
        info!("a fresh child is already scheduled; nothing to kill");
        self
    }

    fn on_fork_started(self, _: ForkStarted) -> Forking {
        let mut state = self.state;
        state.generation += 1;
        state.child_started = Some(Instant::now());
        Forking { state }
    }

    fn on_child_died(self, d: ChildDied) -> Respawning {
        debug!("ignoring exit of unrelated process"; "pid" => d.pid.as_raw());
        self
    }

    fn on_death_announced(self, _: DeathAnnounced) -> Respawning {
        debug!("ignoring redundant death notice");
        self
    }

    fn required_action(&self) -> Option<Todo> {
        Some(Todo::ForkChild)
    }

    fn generation(&self) -> u64 {
        self.state.generation
    }

    fn last_child(&self) -> Option<Pid> {
        self.state.child_pid
    }
}

impl Paused {
    fn on_reload_requested(self, _: ReloadRequested) -> Respawning {
        info!("reload requested; leaving pause and scheduling a fork");
        Respawning { state: self.state }
    }

    fn on_child_died(self, d: ChildDied) -> Paused {
        debug!("ignoring exit of unrelated process"; "pid" => d.pid.as_raw());
        self
    }

    fn on_death_announced(self, _: DeathAnnounced) -> Paused {
        debug!("ignoring death notice while paused");
        self
    }

    fn generation(&self) -> u64 {
        self.state.generation
    }

    fn last_child(&self) -> Option<Pid> {
        self.state.child_pid
    }
}

impl ForkLoop {
    pub fn new() -> ForkLoop {
        ForkLoop::Idle(Idle {
            state: State::default(),
        })
    }
}

impl Default for ForkLoop {
    fn default() -> Self {
        ForkLoop::new()
    }
}
