use anyhow::{Context, Result};
use nix::unistd::Pid;
use refork::bridges::{BootHook, Bridges, FileIndex, Notifier};
use refork::{configuration, logging, Supervisor};
use slog_scope::info;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::{env::current_dir, fs::OpenOptions, thread, time::Duration};
use structopt::StructOpt;

/// A hot-reloading fork supervisor harness: keeps one demo worker child
/// alive, replaces it on SIGHUP, and hands a file-backed storage index
/// across generations. Embedding servers use the library API instead.
#[derive(StructOpt, Debug)]
#[structopt(name = "refork")]
struct Opt {
    /// Path to the configuration file to use for the service.
    #[structopt(short = "f", long, default_value = "./refork.toml")]
    config_file: PathBuf,
}

/// The harness defers nothing at boot; it just logs that the hook ran.
struct LogBootHook;

impl BootHook for LogBootHook {
    fn on_child_boot(&self) -> Result<()> {
        info!("child boot hook ran");
        Ok(())
    }
}

struct LogNotifier;

impl Notifier for LogNotifier {
    fn child_forked(&self, pid: Pid, generation: u64) {
        info!("new child forked"; "pid" => pid.as_raw(), "generation" => generation);
    }
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    // The supervisor forks; keep every task on this one thread.
    let mut rt = tokio::runtime::Builder::new()
        .basic_scheduler()
        .enable_all()
        .build()?;

    let config_file = opt.config_file.canonicalize()?;
    let mut settings = config::Config::default();
    settings.merge(config::File::from(config_file.as_path()))?;
    let mut settings = settings
        .try_into::<configuration::Config>()
        .context(format!(
            "Could not parse configuration file {:?}",
            &config_file
        ))?;
    let log = logging::root_logger(&settings.log);
    let _guard = slog_scope::set_global_logger(log);

    let cwd = current_dir()?;
    settings.base_dir = config_file.parent().map(|p| p.to_owned()).unwrap_or(cwd);

    let harness = settings
        .harness
        .clone()
        .context("the refork binary needs a [harness] section")?;
    let data_file = settings.canonical_path(&harness.data_file);
    let index_file = settings.canonical_path(&harness.index_file);

    let bridges = Bridges {
        index: Arc::new(FileIndex::new(data_file.clone(), index_file)),
        boot_hook: Arc::new(LogBootHook),
        notifier: Arc::new(LogNotifier),
    };

    let supervisor = Supervisor::new(settings, bridges);
    let reloads = supervisor.reload_handle();

    // SIGHUP is the harness's change trigger; any file watcher could sit
    // on this handle instead.
    let signals = signal_hook::iterator::Signals::new(&[signal_hook::SIGHUP])?;
    thread::spawn(move || {
        for _signal in signals.forever() {
            reloads.spawn_new_child();
        }
    });

    info!("startup");
    let forked = rt.block_on(supervisor.run())?;

    // Only a freshly forked child gets here: append heartbeats until the
    // next handover kills us.
    let mut data = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&data_file)?;
    loop {
        writeln!(
            data,
            "heartbeat from generation {} (pid {})",
            forked.generation(),
            forked.pid().as_raw()
        )?;
        data.flush()?;
        thread::sleep(Duration::from_secs(1));
    }
}
