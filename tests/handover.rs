//! End-to-end supervision tests. These fork real processes, so every test
//! runs in its own subprocess via rusty-fork; the forked grandchildren
//! record what happened to a shared event file that the supervising parent
//! asserts on after a fixed grace period.

use anyhow::Result;
use futures::future::FutureExt;
use nix::unistd::Pid;
use refork::bridges::{BootHook, Bridges, Notifier, StorageIndex};
use refork::configuration::{Config, LogConfig, ReloadConfig, SupervisorConfig};
use refork::Supervisor;
use rusty_fork::*;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
struct EventLog(PathBuf);

impl EventLog {
    fn append(&self, line: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.0)
            .expect("opening the event log");
        writeln!(f, "{}", line).expect("appending an event");
    }

    fn lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.0)
            .map(|s| s.lines().map(String::from).collect())
            .unwrap_or_default()
    }
}

struct RecordingIndex(EventLog);

impl StorageIndex for RecordingIndex {
    fn restore(&self) -> Result<()> {
        self.0.append("restore");
        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.0.append("save");
        Ok(())
    }
}

struct RecordingBoot(EventLog);

impl BootHook for RecordingBoot {
    fn on_child_boot(&self) -> Result<()> {
        self.0.append("boot");
        Ok(())
    }
}

struct RecordingNotifier(EventLog);

impl Notifier for RecordingNotifier {
    fn child_forked(&self, _pid: Pid, _generation: u64) {
        self.0.append("notify");
    }
}

fn recording_bridges(events: &EventLog) -> Bridges {
    Bridges {
        index: Arc::new(RecordingIndex(events.clone())),
        boot_hook: Arc::new(RecordingBoot(events.clone())),
        notifier: Arc::new(RecordingNotifier(events.clone())),
    }
}

fn test_config(name: &str) -> Config {
    Config {
        supervisor: SupervisorConfig {
            name: name.to_string(),
        },
        reload: ReloadConfig {
            tick: Duration::from_millis(50),
        },
        log: LogConfig::default(),
        health_check: None,
        harness: None,
        base_dir: PathBuf::from("."),
    }
}

rusty_fork_test! {
    #[test]
    fn boots_the_first_child_in_order_and_pauses_on_its_crash() {
        let logger = refork::logging::root_logger(&LogConfig::default());
        let _guard = slog_scope::set_global_logger(logger);

        let dir = tempfile::tempdir().expect("tempdir");
        let events = EventLog(dir.path().join("events"));
        let supervisor = Supervisor::new(
            test_config("handover-test"),
            recording_bridges(&events),
        );

        let mut rt = tokio::runtime::Builder::new()
            .basic_scheduler()
            .enable_all()
            .build()
            .expect("failed to setup runtime");
        let outcome = rt.block_on(async {
            futures::select! {
                forked = supervisor.run().fuse() => Some(forked),
                _ = tokio::time::delay_for(Duration::from_secs(2)).fuse() => None,
            }
        });

        match outcome {
            Some(Ok(_forked)) => {
                // We are the child. Exit without any deliberate-kill
                // signaling: the parent must read this as a boot crash.
                std::process::exit(0);
            }
            Some(Err(e)) => {
                eprintln!("child boot failed: {:?}", e);
                std::process::exit(2);
            }
            None => {
                // The parent, two seconds in: the one child booted in
                // order, and its crash produced no replacement forks.
                assert_eq!(vec!["restore", "boot", "notify"], events.lines());
            }
        }
    }

    #[test]
    fn a_reload_hands_over_and_saves_before_the_successor_restores() {
        let logger = refork::logging::root_logger(&LogConfig::default());
        let _guard = slog_scope::set_global_logger(logger);

        let dir = tempfile::tempdir().expect("tempdir");
        let events = EventLog(dir.path().join("events"));
        let supervisor = Supervisor::new(
            test_config("handover-test"),
            recording_bridges(&events),
        );
        let reloads = supervisor.reload_handle();

        // The change trigger: ask for a replacement once the first child
        // reports in.
        let trigger_events = events.clone();
        std::thread::spawn(move || {
            for _ in 0..100 {
                std::thread::sleep(Duration::from_millis(20));
                let notifications = trigger_events
                    .lines()
                    .iter()
                    .filter(|l| l.as_str() == "notify")
                    .count();
                if notifications >= 1 {
                    reloads.spawn_new_child();
                    return;
                }
            }
        });

        let mut rt = tokio::runtime::Builder::new()
            .basic_scheduler()
            .enable_all()
            .build()
            .expect("failed to setup runtime");
        let outcome = rt.block_on(async {
            futures::select! {
                forked = supervisor.run().fuse() => Some(forked),
                _ = tokio::time::delay_for(Duration::from_secs(3)).fuse() => None,
            }
        });

        match outcome {
            Some(Ok(_forked)) => {
                // We are a child. Stay alive until the supervisor replaces
                // us, but cap the lifetime so an orphan cannot linger past
                // the test.
                for _ in 0..200 {
                    std::thread::sleep(Duration::from_millis(25));
                }
                std::process::exit(0);
            }
            Some(Err(e)) => {
                eprintln!("child boot failed: {:?}", e);
                std::process::exit(2);
            }
            None => {
                // The outgoing child's save must land before the
                // successor's restore; one reload, one handover.
                assert_eq!(
                    vec!["restore", "boot", "notify", "save", "restore", "boot", "notify"],
                    events.lines()
                );
            }
        }
    }
}
