//! The engine: owns the global instance table, accepts asynchronous status
//! updates, runs the selection pipeline with holdoff, fans out control-flag
//! changes and disciplines every non-LRC clock through clock-feed
//! subscriptions.

use crate::clock::{Clock, ClockId};
use crate::config::ServoConfig;
use crate::error::ErrorKind;
use crate::feed::{compare, FeedHandle, Subscription};
use crate::instance::{
    CtrlCommand, CtrlFlags, EngineMsg, InstanceHandle, InstanceMsg, InstanceStatus, ModuleKind,
};
use crate::selection::{select, Entrant, Holdoff, HoldoffVerdict, SelectionPolicy, Strategy};
use crate::servo::PiServo;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

const SAVE_STATE_INTERVAL: Duration = Duration::from_secs(60);
const LOG_STATS_INTERVAL: Duration = Duration::from_secs(60);
const STATS_PERIOD: Duration = Duration::from_secs(300);
const IDLE_TICK: Duration = Duration::from_millis(500);

/// One row of the engine's instance table.
pub struct InstanceEntry {
    pub handle: InstanceHandle,
    pub kind: ModuleKind,
    pub name: String,
    pub tx: SyncSender<InstanceMsg>,
    pub last_status: InstanceStatus,
    /// The clock this instance reads or disciplines; the LRC when selected.
    pub clock_id: ClockId,
}

struct SecondaryServo {
    target: Arc<Clock>,
    /// `None` when the LRC is the system clock.
    sub_ref: Option<Subscription>,
    /// `None` when the target is the system clock.
    sub_target: Option<Subscription>,
    servo: PiServo,
}

pub struct Engine {
    inbox: Receiver<EngineMsg>,
    instances: Vec<InstanceEntry>,
    policy: SelectionPolicy,
    manual_name: Option<String>,
    manual_overridden: bool,
    selected: Option<InstanceHandle>,
    holdoff: Holdoff,
    feed: FeedHandle,
    clocks: Vec<Arc<Clock>>,
    servos: Vec<SecondaryServo>,
    servo_cfg: ServoConfig,
    state_dir: PathBuf,
    running: Arc<AtomicBool>,
    next_save: Instant,
    next_stats: Instant,
    next_period: Instant,
}

impl Engine {
    pub fn new(
        inbox: Receiver<EngineMsg>,
        instances: Vec<InstanceEntry>,
        policy: SelectionPolicy,
        feed: FeedHandle,
        clocks: Vec<Arc<Clock>>,
        servo_cfg: ServoConfig,
        state_dir: PathBuf,
        running: Arc<AtomicBool>,
    ) -> Self {
        let manual_name = policy.initial_instance.clone();
        let now = Instant::now();
        Engine {
            inbox,
            instances,
            policy,
            manual_name,
            manual_overridden: false,
            selected: None,
            holdoff: Holdoff::default(),
            feed,
            clocks,
            servos: Vec::new(),
            servo_cfg,
            state_dir,
            running,
            next_save: now + SAVE_STATE_INTERVAL,
            next_stats: now + LOG_STATS_INTERVAL,
            next_period: now + STATS_PERIOD,
        }
    }

    pub fn run(mut self) {
        info!(
            "engine: {} instances, {} clocks, strategy {:?}",
            self.instances.len(),
            self.clocks.len(),
            self.policy.strategy
        );
        for inst in &self.instances {
            self.send_to(inst.handle, InstanceMsg::Run);
        }

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let mut deadline = now + IDLE_TICK;
            if let Some(d) = self.holdoff.deadline() {
                deadline = deadline.min(d);
            }
            deadline = deadline.min(self.next_save).min(self.next_stats);

            match self
                .inbox
                .recv_timeout(deadline.saturating_duration_since(now))
            {
                Ok(msg) => self.handle(msg),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            // A pending holdoff commits once its deadline passes with the
            // same winner still ahead.
            if self.holdoff.deadline().is_some_and(|d| Instant::now() >= d) {
                self.run_selection();
            }
            self.periodic_duties();
        }

        self.shutdown();
    }

    fn periodic_duties(&mut self) {
        let now = Instant::now();
        if now >= self.next_save {
            self.next_save = now + SAVE_STATE_INTERVAL;
            for inst in &self.instances {
                self.send_to(inst.handle, InstanceMsg::SaveState);
            }
        }
        if now >= self.next_stats {
            self.next_stats = now + LOG_STATS_INTERVAL;
            let at = SystemTime::now();
            for inst in &self.instances {
                self.send_to(inst.handle, InstanceMsg::LogStats { at });
            }
        }
        if now >= self.next_period {
            self.next_period = now + STATS_PERIOD;
            let at = SystemTime::now();
            for inst in &self.instances {
                self.send_to(inst.handle, InstanceMsg::StatsEndPeriod { at });
            }
        }
    }

    fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::StatusChanged { from, status } => {
                if let Some(entry) = self.entry_mut(from) {
                    debug!(
                        "engine: {} now {} (offset {}ns)",
                        entry.name, status.state, status.offset_from_master_ns
                    );
                    entry.last_status = status;
                    self.run_selection();
                }
            }
            EngineMsg::RtStats {
                from,
                offset_ns,
                in_sync,
            } => {
                debug!("engine: rt-stats {} offset={}ns in_sync={}", from, offset_ns, in_sync);
            }
            EngineMsg::ClusteringInput { from, score } => {
                if let Some(entry) = self.entry_mut(from) {
                    debug!("engine: {} clustering score {}", entry.name, score);
                    entry.last_status.clustering_score = score;
                    self.run_selection();
                }
            }
            EngineMsg::SyncEvent => self.run_servos(),
            EngineMsg::Command(cmd) => self.handle_command(cmd),
        }
    }

    fn handle_command(&mut self, cmd: CtrlCommand) {
        info!("engine: command {:?}", cmd);
        match cmd {
            CtrlCommand::Exit => self.running.store(false, Ordering::SeqCst),
            CtrlCommand::LogRotate => {
                // stderr logging has no files to reopen; acknowledged so
                // operator tooling can fire it unconditionally.
                info!("engine: log rotation requested");
            }
            CtrlCommand::StepClocks => self.step_clocks(),
            CtrlCommand::DumpTables => self.dump_tables(),
            CtrlCommand::SelectInstance(name) => {
                if self.instances.iter().any(|e| e.name == name) {
                    self.manual_name = Some(name);
                    self.manual_overridden = true;
                    self.run_selection();
                } else {
                    warn!("engine: selectinstance: no instance named '{}'", name);
                }
            }
            CtrlCommand::TestMode { mode, args } => self.test_mode(&mode, &args),
            CtrlCommand::PidAdjust {
                kp,
                ki,
                kd,
                targets,
            } => {
                if kd.is_some() {
                    warn!("engine: pid_adjust: derivative term not used by the PI servo");
                }
                if targets.iter().any(|t| t == "reset") {
                    for servo in &mut self.servos {
                        servo.servo.reset();
                    }
                    info!("engine: servo integrals reset");
                }
                if kp.is_some() || ki.is_some() {
                    if let Some(kp) = kp {
                        self.servo_cfg.kp = kp;
                    }
                    if let Some(ki) = ki {
                        self.servo_cfg.ki = ki;
                    }
                    for servo in &mut self.servos {
                        servo.servo.set_gains(kp, ki);
                    }
                    info!(
                        "engine: servo gains kp={} ki={}",
                        self.servo_cfg.kp, self.servo_cfg.ki
                    );
                }
            }
        }
    }

    fn test_mode(&mut self, mode: &str, args: &[String]) {
        match mode {
            "step_clock" => {
                let offset_ns: i64 = args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(0);
                if offset_ns == 0 {
                    warn!("engine: testmode=step_clock needs a non-zero ns offset");
                    return;
                }
                if let Some(clock) = self.lrc_clock().cloned() {
                    match clock.step_ns(offset_ns) {
                        Ok(()) => {
                            info!("engine: test step of {:+}ns applied", offset_ns);
                            self.fanout_step_clock();
                        }
                        Err(e) => warn!("engine: test step failed: {}", e),
                    }
                }
            }
            other => warn!("engine: unsupported test mode '{}'", other),
        }
    }

    fn entry_mut(&mut self, handle: InstanceHandle) -> Option<&mut InstanceEntry> {
        self.instances.iter_mut().find(|e| e.handle == handle)
    }

    fn entry(&self, handle: InstanceHandle) -> Option<&InstanceEntry> {
        self.instances.iter().find(|e| e.handle == handle)
    }

    fn name_of(&self, handle: Option<InstanceHandle>) -> &str {
        handle
            .and_then(|h| self.entry(h))
            .map(|e| e.name.as_str())
            .unwrap_or("(none)")
    }

    /// The engine never blocks on an instance: asynchronous sends only, with
    /// pool exhaustion logged and dropped.
    fn send_to(&self, handle: InstanceHandle, msg: InstanceMsg) {
        let Some(entry) = self.entry(handle) else {
            return;
        };
        match entry.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("engine: inbox of {} full, dropping message", entry.name);
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("engine: instance {} is gone", entry.name);
            }
        }
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    fn run_selection(&mut self) {
        let automatic = match self.policy.strategy {
            Strategy::Automatic => true,
            Strategy::Manual => false,
            Strategy::ManualStartup => self.manual_overridden,
        };
        let entrants: Vec<Entrant> = self
            .instances
            .iter()
            .map(|e| Entrant {
                handle: e.handle,
                name: &e.name,
                status: &e.last_status,
            })
            .collect();
        let winner = select(
            &self.policy,
            self.manual_name.as_deref(),
            automatic,
            &entrants,
        );

        match self
            .holdoff
            .update(self.selected, winner, self.policy.holdoff, Instant::now())
        {
            HoldoffVerdict::Keep => {}
            HoldoffVerdict::Pending(deadline) => {
                debug!(
                    "engine: {} would replace {}; holding off until {:?}",
                    self.name_of(winner),
                    self.name_of(self.selected),
                    deadline
                );
            }
            HoldoffVerdict::Commit(new) => self.commit(new),
        }
    }

    fn commit(&mut self, new: Option<InstanceHandle>) {
        let old = self.selected;
        self.selected = new;
        info!(
            "engine: selected instance {} -> {}",
            self.name_of(old),
            self.name_of(new)
        );

        // Grant first, then revoke: the new LRC owner must see its grant
        // before the previous owner processes the revocation.
        if let Some(h) = new {
            self.send_to(
                h,
                InstanceMsg::Control {
                    mask: CtrlFlags::CLOCK_CTRL | CtrlFlags::CLUSTERING_DETERMINANT,
                    flags: CtrlFlags::CLOCK_CTRL | CtrlFlags::CLUSTERING_DETERMINANT,
                    reply: None,
                },
            );
        }
        if let Some(h) = old.filter(|h| Some(*h) != new) {
            self.send_to(
                h,
                InstanceMsg::Control {
                    mask: CtrlFlags::CLOCK_CTRL,
                    flags: CtrlFlags::empty(),
                    reply: None,
                },
            );
        }

        self.rebuild_servos();
    }

    // ------------------------------------------------------------------
    // Secondary clock discipline
    // ------------------------------------------------------------------

    fn lrc_clock_id(&self) -> Option<ClockId> {
        self.selected.and_then(|h| self.entry(h)).map(|e| e.clock_id)
    }

    fn lrc_clock(&self) -> Option<&Arc<Clock>> {
        let id = self.lrc_clock_id()?;
        self.clocks.iter().find(|c| c.id() == id)
    }

    fn rebuild_servos(&mut self) {
        self.servos.clear();
        let Some(lrc_id) = self.lrc_clock_id() else {
            return;
        };
        let lrc_is_system = lrc_id == ClockId::system();

        for clock in &self.clocks {
            if clock.id() == lrc_id {
                continue;
            }
            let sub_ref = if lrc_is_system {
                None
            } else {
                match self.feed.subscribe(lrc_id) {
                    Ok(sub) => Some(sub),
                    Err(e) => {
                        warn!("engine: no feed for LRC clock {}: {}", lrc_id, e);
                        return;
                    }
                }
            };
            let sub_target = if clock.is_system() {
                None
            } else {
                match self.feed.subscribe(clock.id()) {
                    Ok(sub) => Some(sub),
                    Err(e) => {
                        warn!("engine: no feed for clock {}: {}", clock.name(), e);
                        continue;
                    }
                }
            };
            self.servos.push(SecondaryServo {
                target: clock.clone(),
                sub_ref,
                sub_target,
                servo: PiServo::new(self.servo_cfg.kp, self.servo_cfg.ki),
            });
        }
        debug!("engine: {} secondary servos active", self.servos.len());
    }

    fn run_servos(&mut self) {
        let mut dead = Vec::new();
        for (i, servo) in self.servos.iter_mut().enumerate() {
            if servo.target.is_blocked() || servo.target.is_read_only() || !servo.target.is_active()
            {
                continue;
            }
            match compare(servo.sub_ref.as_mut(), servo.sub_target.as_mut()) {
                Ok(diff) => {
                    // diff is (LRC − target); the servo wants (target − LRC).
                    let adj = servo.servo.sample(-diff.diff_ns);
                    if let Err(e) = servo.target.slew_ppm(adj) {
                        debug!("engine: slew of {} refused: {}", servo.target.name(), e);
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::TryAgain | ErrorKind::Stale => {
                        debug!("engine: servo sample for {}: {}", servo.target.name(), e)
                    }
                    ErrorKind::NoData => {
                        warn!("engine: feed overrun for {}", servo.target.name())
                    }
                    ErrorKind::Dead | ErrorKind::NoEntry => dead.push(i),
                    _ => warn!("engine: servo error for {}: {}", servo.target.name(), e),
                },
            }
        }
        for i in dead.into_iter().rev() {
            let servo = self.servos.remove(i);
            info!("engine: dropping servo for removed clock {}", servo.target.name());
        }
    }

    /// Step every writable clock onto the LRC, then tell all instances their
    /// offsets predate a step.
    fn step_clocks(&mut self) {
        let lrc_diff = match self.lrc_clock() {
            Some(clock) => match clock.compare_to_system_ns() {
                Ok(d) => d,
                Err(e) => {
                    warn!("engine: stepclocks: cannot read LRC: {}", e);
                    return;
                }
            },
            None => {
                warn!("engine: stepclocks with no selected instance");
                return;
            }
        };
        let lrc_id = self.lrc_clock_id();

        for clock in &self.clocks {
            if Some(clock.id()) == lrc_id {
                continue;
            }
            let diff = match clock.compare_to_system_ns() {
                Ok(d) => d,
                Err(e) => {
                    warn!("engine: stepclocks: cannot read {}: {}", clock.name(), e);
                    continue;
                }
            };
            // (LRC − clock) brings the clock onto the reference.
            let step = lrc_diff - diff;
            match clock.step_ns(step) {
                Ok(()) => info!("engine: stepped {} by {:+}ns", clock.name(), step),
                Err(e) => warn!("engine: step of {} refused: {}", clock.name(), e),
            }
        }

        self.fanout_step_clock();
    }

    fn fanout_step_clock(&mut self) {
        for inst in &self.instances {
            self.send_to(inst.handle, InstanceMsg::StepClock { reply: None });
        }
        // Post-step servo history is meaningless.
        for servo in &mut self.servos {
            servo.servo.reset();
        }
    }

    fn dump_tables(&self) {
        let path = self.state_dir.join("topology");
        let mut table = String::new();
        table.push_str("instances:\n");
        for e in &self.instances {
            table.push_str(&format!(
                "  {} kind={} state={} offset={}ns selected={}\n",
                e.name,
                e.kind,
                e.last_status.state,
                e.last_status.offset_from_master_ns,
                Some(e.handle) == self.selected,
            ));
        }
        table.push_str("clocks:\n");
        for c in &self.clocks {
            table.push_str(&format!(
                "  {} id={} blocked={} active={}\n",
                c.name(),
                c.id(),
                c.is_blocked(),
                c.is_active()
            ));
        }

        // Per-instance topology arrives asynchronously; a collector thread
        // appends it so the engine never waits on an instance.
        let (reply_tx, reply_rx) = mpsc::channel::<String>();
        for inst in &self.instances {
            self.send_to(
                inst.handle,
                InstanceMsg::WriteTopology {
                    reply: reply_tx.clone(),
                },
            );
        }
        drop(reply_tx);

        let state_dir = self.state_dir.clone();
        std::thread::spawn(move || {
            let mut out = table;
            while let Ok(section) = reply_rx.recv_timeout(Duration::from_secs(2)) {
                out.push('\n');
                out.push_str(&section);
            }
            if let Err(e) = std::fs::create_dir_all(&state_dir)
                .and_then(|_| std::fs::write(&path, out))
            {
                warn!("engine: writing topology dump failed: {}", e);
            } else {
                info!("engine: topology dumped to {}", path.display());
            }
        });
    }

    fn shutdown(&mut self) {
        info!("engine: shutting down");
        // Servo subscriptions must go before the feed drains its sources.
        self.servos.clear();
        for inst in &self.instances {
            let _ = inst.tx.try_send(InstanceMsg::Shutdown);
        }
        self.feed.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================
