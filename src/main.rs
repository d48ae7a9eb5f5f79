use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::time::Duration;

use refsyncd::clock::{build_clock_table, Clock, ClockRole, LinkTable};
use refsyncd::config::{Config, InstanceConfig, DEFAULT_CONFIG_PATH};
use refsyncd::control::ControlServer;
use refsyncd::crny::adapter::{CrnyModule, ScriptClockControl};
use refsyncd::engine::{Engine, InstanceEntry};
use refsyncd::feed::spawn_feed;
use refsyncd::instance::{
    spawn_instance, InstanceHandle, InstanceStatus, ModuleImpl, ModuleKind, StatusReporter,
    INBOX_DEPTH,
};
use refsyncd::modules::external::ExternalModule;
use refsyncd::modules::freerun::FreerunModule;
use refsyncd::modules::ntp::{NtpModule, SntpSource};
use refsyncd::modules::IdleSource;
use refsyncd::selection::SelectionPolicy;
use refsyncd::servo::PiServo;

const LOCK_PATH: &str = "/var/run/refsyncd.lock";
const DEFAULT_NTP_POLL_SECS: u64 = 16;
const DEFAULT_SOURCE_POLL_SECS: u64 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-source time synchronization daemon", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn acquire_singleton_lock() -> Result<File> {
    let file = File::create(LOCK_PATH)
        .map_err(|e| anyhow!("Failed to create lock file {}: {}", LOCK_PATH, e))?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(file),
        Err(Errno::EAGAIN) => Err(anyhow!(
            "Another instance of refsyncd is already running! (Lockfile: {})",
            LOCK_PATH
        )),
        Err(e) => Err(e.into()),
    }
}

/// systemd-timesyncd and this daemon both discipline the system clock; they
/// are mutually exclusive.
fn timesyncd_running() -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().parse::<u32>().is_err() {
            continue;
        }
        if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
            if comm.trim_end() == "systemd-timesyncd" {
                return true;
            }
        }
    }
    false
}

/// The clock an instance reads or disciplines: a PHC for ptp instances when
/// one exists, the system clock otherwise.
fn clock_for_kind(kind: ModuleKind, clocks: &[Arc<Clock>]) -> Arc<Clock> {
    if kind == ModuleKind::Ptp {
        if let Some(phc) = clocks.iter().find(|c| c.role() == ClockRole::Phc) {
            return phc.clone();
        }
    }
    clocks[0].clone()
}

fn build_module(
    cfg: &Config,
    inst: &InstanceConfig,
    reporter: StatusReporter,
    clocks: &[Arc<Clock>],
) -> Result<ModuleImpl> {
    let system_clock = clocks[0].clone();
    let state_dir = cfg.state_dir.clone();
    let servo = PiServo::new(cfg.servo.kp, cfg.servo.ki);

    let module = match inst.kind {
        ModuleKind::Freerun => ModuleImpl::Freerun(FreerunModule::new(
            inst.name.clone(),
            state_dir,
            reporter,
            clock_for_kind(inst.kind, clocks),
            inst.user_priority,
            inst.accuracy,
        )),
        ModuleKind::Ntp => {
            let server = inst
                .ntp_server
                .as_deref()
                .ok_or_else(|| anyhow!("ntp instance {} has no server", inst.name))?;
            ModuleImpl::Ntp(NtpModule::new(
                inst.name.clone(),
                state_dir,
                reporter,
                system_clock,
                Box::new(SntpSource::new(server)),
                Duration::from_secs(inst.poll_interval.unwrap_or(DEFAULT_NTP_POLL_SECS)),
                inst.user_priority,
                inst.accuracy,
                servo,
            ))
        }
        ModuleKind::Crny => ModuleImpl::Crny(CrnyModule::new(
            inst.name.clone(),
            cfg.crny.clone(),
            state_dir,
            system_clock,
            reporter,
            Box::new(ScriptClockControl::new(cfg.crny.control_script.clone())),
            inst.user_priority,
            inst.accuracy,
        )),
        ModuleKind::Ptp | ModuleKind::Pps | ModuleKind::Gps => {
            // The protocol engines behind these kinds are external
            // collaborators; until one is attached the instance listens.
            let label = match inst.kind {
                ModuleKind::Ptp => "ptp",
                ModuleKind::Pps => "pps",
                _ => "gps",
            };
            ModuleImpl::External(ExternalModule::new(
                inst.name.clone(),
                label,
                state_dir,
                reporter,
                clock_for_kind(inst.kind, clocks),
                Box::new(IdleSource),
                Duration::from_secs(inst.poll_interval.unwrap_or(DEFAULT_SOURCE_POLL_SECS)),
                inst.user_priority,
                inst.accuracy,
                servo,
            ))
        }
    };
    Ok(module)
}

fn run_daemon(cfg: Config) -> Result<()> {
    let _ = sd_notify::notify(
        false,
        &[sd_notify::NotifyState::Status(
            format!("v{} | Starting...", env!("CARGO_PKG_VERSION")).as_str(),
        )],
    );

    let running = Arc::new(AtomicBool::new(true));

    // Clock table: the system clock plus every PHC-capable link.
    let links = LinkTable::discover();
    let clocks = build_clock_table(&links, cfg.clock_id_suffix)?;
    info!("clock table: {} clocks", clocks.len());

    // Engine inbox and the clock-feed service.
    let (engine_tx, engine_rx) = sync_channel(INBOX_DEPTH);
    let (feed, feed_join) = spawn_feed(cfg.clockfeed.base_poll_log2, engine_tx.clone());
    for clock in clocks.iter().filter(|c| c.role() == ClockRole::Phc) {
        feed.add_clock(clock.clone(), cfg.clockfeed.base_poll_log2)
            .map_err(|e| anyhow!("registering {} with clockfeed: {}", clock.name(), e))?;
    }

    // Sync-module instances.
    let mut entries = Vec::new();
    let mut joins = Vec::new();
    for (i, inst) in cfg.sync_instances.iter().enumerate() {
        let handle = InstanceHandle(i);
        let (tx, rx) = sync_channel(INBOX_DEPTH);
        let reporter = StatusReporter::new(handle, engine_tx.clone());
        let module = build_module(&cfg, inst, reporter, &clocks)?;
        info!("instance {} ({}) ready", inst.name, inst.kind);
        joins.push(spawn_instance(inst.name.clone(), module, rx));
        entries.push(InstanceEntry {
            handle,
            kind: inst.kind,
            name: inst.name.clone(),
            tx,
            last_status: InstanceStatus::default(),
            clock_id: clock_for_kind(inst.kind, &clocks).id(),
        });
    }

    // Control surface.
    let control = ControlServer::bind(&cfg.control_socket, engine_tx.clone(), running.clone())?;
    let control_join = control.spawn();

    let policy = SelectionPolicy {
        strategy: cfg.selection.strategy,
        rules: cfg.selection.rules.clone(),
        initial_instance: cfg.selection.initial_instance.clone(),
        holdoff: Duration::from_secs(cfg.selection.holdoff_secs),
    };
    let engine = Engine::new(
        engine_rx,
        entries,
        policy,
        feed,
        clocks,
        cfg.servo.clone(),
        cfg.state_dir.clone(),
        running.clone(),
    );

    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received.");
        r.store(false, Ordering::SeqCst);
    })?;

    let _ = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Ready,
            sd_notify::NotifyState::Status(
                format!("v{} | Running", env!("CARGO_PKG_VERSION")).as_str(),
            ),
        ],
    );

    // The engine loop is the daemon's main line; it returns on exit/signal
    // after fanning shutdown out to every task.
    engine.run();

    for join in joins {
        let _ = join.join();
    }
    let _ = control_join.join();
    let _ = feed_join.join();

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    info!("refsyncd exiting.");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    info!("refsyncd v{}", env!("CARGO_PKG_VERSION"));

    if timesyncd_running() {
        error!("systemd-timesyncd is running; refusing to fight over the system clock");
        std::process::exit(Errno::EPROTONOSUPPORT as i32);
    }

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(Errno::ENOENT as i32);
        }
    };

    let _lock_file = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if cfg.crny.control_script.is_none()
        && cfg.sync_instances.iter().any(|i| i.kind == ModuleKind::Crny)
    {
        warn!("no chrony control script configured; clock ownership follows chronyd's own settings");
    }

    run_daemon(cfg)
}
