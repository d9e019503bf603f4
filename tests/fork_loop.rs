use matches::assert_matches;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use refork::fork_loop::{
    ChildDied, ChildForked, DeathAnnounced, ForkLoop, ForkStarted, KillIssued, ReloadRequested,
    Started, Todo,
};

/// The machine logs every transition through slog-scope; run each test
/// under a discarding scope so the diagnostics stay out of the way.
fn quietly<T>(f: impl FnOnce() -> T) -> T {
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    slog_scope::scope(&logger, f)
}

fn exited(pid: i32, code: i32) -> ChildDied {
    ChildDied::new(Pid::from_raw(pid), WaitStatus::Exited(Pid::from_raw(pid), code))
}

#[must_use]
fn running_with_child(pid: i32) -> ForkLoop {
    let mut machine = ForkLoop::new();
    machine = machine.on_started(Started());
    machine = machine.on_fork_started(ForkStarted());
    machine = machine.on_child_forked(ChildForked::new(Pid::from_raw(pid)));
    machine
}

#[test]
fn schedules_the_first_fork_immediately() {
    quietly(|| {
        let machine = ForkLoop::new();
        assert_matches!(&machine, &ForkLoop::Idle(_));

        let machine = machine.on_started(Started());
        assert_matches!(&machine, &ForkLoop::Startup(_));
        assert_eq!(
            Some(Todo::ForkChild),
            machine.required_action().and_then(|todo| todo)
        );
    })
}

#[test]
fn refuses_a_reload_before_the_loop_runs() {
    quietly(|| {
        let machine = ForkLoop::new().on_reload_requested(ReloadRequested());
        assert_matches!(&machine, &ForkLoop::Idle(_));
    })
}

#[test]
fn refuses_a_reload_before_the_first_child() {
    quietly(|| {
        let machine = ForkLoop::new().on_started(Started());
        let machine = machine.on_reload_requested(ReloadRequested());

        // Still waiting for the first fork, and no kill was recorded.
        assert_matches!(&machine, &ForkLoop::Startup(_));
        assert_eq!(
            Some(Todo::ForkChild),
            machine.required_action().and_then(|todo| todo)
        );
    })
}

#[test]
fn refuses_a_reload_while_forking() {
    quietly(|| {
        let machine = ForkLoop::new().on_started(Started());
        let machine = machine.on_fork_started(ForkStarted());
        let machine = machine.on_reload_requested(ReloadRequested());
        assert_matches!(&machine, &ForkLoop::Forking(_));
    })
}

#[test]
fn walks_a_full_handover_cycle() {
    quietly(|| {
        let machine = running_with_child(100);
        assert_matches!(&machine, &ForkLoop::Alive(_));
        assert_eq!(Some(1), machine.generation());
        assert_eq!(None, machine.required_action().and_then(|todo| todo));

        let machine = machine.on_reload_requested(ReloadRequested());
        assert_matches!(&machine, &ForkLoop::Draining(_));
        assert_eq!(
            Some(Todo::KillChild(Pid::from_raw(100))),
            machine.required_action().and_then(|todo| todo)
        );

        let machine = machine.on_kill_issued(KillIssued());
        assert_eq!(None, machine.required_action().and_then(|todo| todo));

        let machine = machine.on_child_died(exited(100, 0));
        assert_matches!(&machine, &ForkLoop::Respawning(_));
        assert_eq!(
            Some(Todo::ForkChild),
            machine.required_action().and_then(|todo| todo)
        );

        let machine = machine.on_fork_started(ForkStarted());
        let machine = machine.on_child_forked(ChildForked::new(Pid::from_raw(101)));
        assert_matches!(&machine, &ForkLoop::Alive(_));
        assert_eq!(Some(2), machine.generation());
    })
}

#[test]
fn rapid_reloads_issue_exactly_one_kill() {
    quietly(|| {
        let machine = running_with_child(100);
        let machine = machine.on_reload_requested(ReloadRequested());
        assert_eq!(
            Some(Todo::KillChild(Pid::from_raw(100))),
            machine.required_action().and_then(|todo| todo)
        );
        let machine = machine.on_kill_issued(KillIssued());

        // The second request while the kill is in flight must not ask for
        // another signal.
        let machine = machine.on_reload_requested(ReloadRequested());
        assert_matches!(&machine, &ForkLoop::Draining(_));
        assert_eq!(None, machine.required_action().and_then(|todo| todo));
    })
}

#[test]
fn a_death_without_a_kill_pauses_the_loop() {
    quietly(|| {
        let machine = running_with_child(100);
        let machine = machine.on_child_died(exited(100, 1));
        assert_matches!(&machine, &ForkLoop::Paused(_));
        assert_eq!(None, machine.required_action().and_then(|todo| todo));

        // Nothing that happens afterwards un-pauses it by itself.
        let machine = machine.on_child_died(exited(100, 1));
        assert_matches!(&machine, &ForkLoop::Paused(_));
        assert_eq!(None, machine.required_action().and_then(|todo| todo));
    })
}

#[test]
fn a_reload_clears_the_pause_and_schedules_one_fork() {
    quietly(|| {
        let machine = running_with_child(100);
        let machine = machine.on_child_died(exited(100, 1));
        assert_matches!(&machine, &ForkLoop::Paused(_));

        let machine = machine.on_reload_requested(ReloadRequested());
        assert_matches!(&machine, &ForkLoop::Respawning(_));
        assert_eq!(
            Some(Todo::ForkChild),
            machine.required_action().and_then(|todo| todo)
        );
    })
}

#[test]
fn a_self_kill_announcement_marks_the_death_deliberate() {
    quietly(|| {
        let machine = running_with_child(100);
        let machine = machine.on_death_announced(DeathAnnounced());
        assert_matches!(&machine, &ForkLoop::Draining(_));

        // The child is killing itself; there is no signal for us to send.
        assert_eq!(None, machine.required_action().and_then(|todo| todo));

        let machine = machine.on_child_died(exited(100, 0));
        assert_matches!(&machine, &ForkLoop::Respawning(_));
    })
}

#[test]
fn ignores_deaths_of_unrelated_processes() {
    quietly(|| {
        let machine = running_with_child(100);
        let machine = machine.on_child_died(exited(999, 0));
        assert_matches!(&machine, &ForkLoop::Alive(_));
    })
}

#[test]
fn ignores_stray_death_notices() {
    quietly(|| {
        let machine = ForkLoop::new().on_started(Started());
        let machine = machine.on_death_announced(DeathAnnounced());
        assert_matches!(&machine, &ForkLoop::Startup(_));
    })
}
