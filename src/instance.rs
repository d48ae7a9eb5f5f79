//! Sync-module framework: the uniform status/control contract every
//! sync-module instance exposes to the engine, and the task loop that hosts
//! an instance.
//!
//! Each instance runs as one long-lived thread with a bounded inbox. The
//! engine addresses it only through an opaque `InstanceHandle` and the
//! `InstanceMsg` vocabulary; the instance talks back with asynchronous
//! `EngineMsg` posts, debounced so that exactly one `StatusChanged` is sent
//! per equivalence-class change.

use crate::clock::ClockId;
use bitflags::bitflags;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

pub const MAX_INSTANCE_NAME: usize = 63;

/// Default inbox depth for instance and engine message pools.
pub const INBOX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Freerun,
    Ptp,
    Pps,
    Ntp,
    Crny,
    Gps,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleKind::Freerun => "freerun",
            ModuleKind::Ptp => "ptp",
            ModuleKind::Pps => "pps",
            ModuleKind::Ntp => "ntp",
            ModuleKind::Crny => "crny",
            ModuleKind::Gps => "gps",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Listening,
    Selection,
    Slave,
    Master,
    Passive,
    Disabled,
    Faulty,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Listening => "listening",
            SyncState::Selection => "selection",
            SyncState::Slave => "slave",
            SyncState::Master => "master",
            SyncState::Passive => "passive",
            SyncState::Disabled => "disabled",
            SyncState::Faulty => "faulty",
        };
        f.write_str(s)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Alarms: u32 {
        const CLOCK_NEAR_EPOCH    = 1 << 0;
        const NO_TX_TIMESTAMPS    = 1 << 1;
        const NO_RX_TIMESTAMPS    = 1 << 2;
        const UNRECOVERABLE_STEP  = 1 << 3;
        const NO_INTERFACE        = 1 << 4;
        const SOURCE_LOST         = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Constraints: u32 {
        const MUST_BE_SELECTED    = 1 << 0;
        const CANNOT_BE_SELECTED  = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlFlags: u32 {
        const CLOCK_CTRL             = 1 << 0;
        const CLUSTERING_DETERMINANT = 1 << 1;
    }
}

/// Descriptive information about the upstream master an instance follows.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterInfo {
    pub clock_class: u8,
    pub time_source: u8,
    pub steps_removed: u16,
    pub clock_id: ClockId,
    /// Master-reported accuracy; `INFINITY` when unknown.
    pub accuracy: f64,
}

impl Default for MasterInfo {
    fn default() -> Self {
        MasterInfo {
            clock_class: 255,
            time_source: 0,
            steps_removed: 0,
            clock_id: ClockId::system(),
            accuracy: f64::INFINITY,
        }
    }
}

/// The payload of every sync module → engine status update.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub state: SyncState,
    pub alarms: Alarms,
    pub constraints: Constraints,
    /// Signed offset from the reference, ns; 0 when no reference.
    pub offset_from_master_ns: i64,
    /// Local accuracy estimate; `INFINITY` when unknown.
    pub local_accuracy: f64,
    pub allan_variance: f64,
    pub user_priority: u32,
    pub clustering_score: i32,
    pub master: MasterInfo,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus {
            state: SyncState::Listening,
            alarms: Alarms::empty(),
            constraints: Constraints::empty(),
            offset_from_master_ns: 0,
            local_accuracy: f64::INFINITY,
            allan_variance: f64::INFINITY,
            user_priority: 0,
            clustering_score: 0,
            master: MasterInfo::default(),
        }
    }
}

/// Opaque process-wide identifier for one sync-module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(pub usize);

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// MESSAGE VOCABULARY
// ============================================================================

/// Engine → instance messages.
pub enum InstanceMsg {
    /// Begin periodic activity. No reply.
    Run,
    /// Synchronous full status query.
    GetStatus { reply: Sender<InstanceStatus> },
    /// Apply `new = (old & !mask) | (flags & mask)`. Reply carries no body;
    /// the sender may drop the channel if it does not care (the engine never
    /// blocks on an instance).
    Control {
        mask: CtrlFlags,
        flags: CtrlFlags,
        reply: Option<Sender<()>>,
    },
    /// The LRC was stepped; invalidate any offset whose validity depends on
    /// pre-step state.
    StepClock { reply: Option<Sender<()>> },
    LogStats { at: SystemTime },
    SaveState,
    WriteTopology { reply: Sender<String> },
    StatsEndPeriod { at: SystemTime },
    /// Shutdown marker; the instance runs its teardown and exits its task.
    Shutdown,
}

/// Operator commands accepted by the control surface, forwarded verbatim to
/// the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CtrlCommand {
    Exit,
    LogRotate,
    StepClocks,
    DumpTables,
    SelectInstance(String),
    TestMode { mode: String, args: Vec<String> },
    PidAdjust {
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
        targets: Vec<String>,
    },
}

/// Instance (and service) → engine messages.
pub enum EngineMsg {
    StatusChanged {
        from: InstanceHandle,
        status: InstanceStatus,
    },
    RtStats {
        from: InstanceHandle,
        offset_ns: i64,
        in_sync: bool,
    },
    ClusteringInput {
        from: InstanceHandle,
        score: i32,
    },
    /// Posted by the clock-feed service after each sampling pass.
    SyncEvent,
    Command(CtrlCommand),
}

// ============================================================================
// STATUS REPORTER (debounced)
// ============================================================================

/// Posts `StatusChanged` to the engine, suppressing no-op updates: exactly
/// one message per equivalence-class change of the status.
pub struct StatusReporter {
    handle: InstanceHandle,
    tx: SyncSender<EngineMsg>,
    last: Option<InstanceStatus>,
}

impl StatusReporter {
    pub fn new(handle: InstanceHandle, tx: SyncSender<EngineMsg>) -> Self {
        StatusReporter {
            handle,
            tx,
            last: None,
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn last(&self) -> Option<&InstanceStatus> {
        self.last.as_ref()
    }

    /// Post the status if it differs from what the engine last saw.
    pub fn post(&mut self, status: InstanceStatus) {
        if self.last.as_ref() == Some(&status) {
            return;
        }
        if let Some(prev) = &self.last {
            if prev.state != status.state {
                info!(
                    "instance {}: state {} -> {}",
                    self.handle, prev.state, status.state
                );
            }
        } else {
            info!("instance {}: state {}", self.handle, status.state);
        }
        match self.tx.try_send(EngineMsg::StatusChanged {
            from: self.handle,
            status: status.clone(),
        }) {
            Ok(()) => {
                self.last = Some(status);
            }
            Err(TrySendError::Full(_)) => {
                // Message pool exhausted. The update is dropped; because the
                // reporter did not record it, the next post re-attempts.
                warn!(
                    "instance {}: engine inbox full, dropping status update",
                    self.handle
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("instance {}: engine gone", self.handle);
            }
        }
    }

    pub fn post_rt_stats(&self, offset_ns: i64, in_sync: bool) {
        let msg = EngineMsg::RtStats {
            from: self.handle,
            offset_ns,
            in_sync,
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(msg) {
            warn!("instance {}: engine inbox full, dropping rt stats", self.handle);
        }
    }

    pub fn post_clustering(&self, score: i32) {
        let msg = EngineMsg::ClusteringInput {
            from: self.handle,
            score,
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(msg) {
            warn!(
                "instance {}: engine inbox full, dropping clustering input",
                self.handle
            );
        }
    }
}

// ============================================================================
// MODULE CORE AND TASK LOOP
// ============================================================================

/// Behaviour common to every module kind, driven by the task loop. The
/// concrete kinds are closed over by `ModuleImpl`; adding a kind means
/// extending that variant.
pub trait ModuleCore: Send {
    /// Interval between `tick()` calls while running.
    fn tick_interval(&self) -> Duration;
    /// Called once when the engine sends `RUN`.
    fn on_run(&mut self);
    /// Periodic activity.
    fn tick(&mut self);
    /// Current full status.
    fn status(&self) -> InstanceStatus;
    /// Control-flag change, after the mask/flags merge has been applied.
    fn on_control(&mut self, old: CtrlFlags, new: CtrlFlags);
    /// The LRC was stepped.
    fn on_step_clock(&mut self);
    fn on_save_state(&mut self);
    fn on_log_stats(&mut self, at: SystemTime);
    fn on_stats_end_period(&mut self, at: SystemTime);
    fn write_topology(&self) -> String;
    /// Teardown before task exit.
    fn on_shutdown(&mut self);
}

/// Tagged variant over the sync-module kinds.
pub enum ModuleImpl {
    Freerun(crate::modules::freerun::FreerunModule),
    Ntp(crate::modules::ntp::NtpModule),
    External(crate::modules::external::ExternalModule),
    Crny(crate::crny::adapter::CrnyModule),
}

impl ModuleImpl {
    fn core(&mut self) -> &mut dyn ModuleCore {
        match self {
            ModuleImpl::Freerun(m) => m,
            ModuleImpl::Ntp(m) => m,
            ModuleImpl::External(m) => m,
            ModuleImpl::Crny(m) => m,
        }
    }
}

/// Host task for one instance: single-threaded cooperative message loop.
/// Suspends only on the inbox (with a deadline for the periodic tick).
pub fn run_instance(name: String, mut module: ModuleImpl, inbox: Receiver<InstanceMsg>) {
    let core = module.core();
    let mut running = false;
    let mut ctrl_flags = CtrlFlags::empty();
    let mut next_tick = Instant::now();

    loop {
        let timeout = if running {
            next_tick.saturating_duration_since(Instant::now())
        } else {
            Duration::from_secs(3600)
        };

        let msg = match inbox.recv_timeout(timeout) {
            Ok(m) => Some(m),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => None,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match msg {
            Some(InstanceMsg::Run) => {
                debug!("instance {}: run", name);
                running = true;
                core.on_run();
                next_tick = Instant::now();
            }
            Some(InstanceMsg::GetStatus { reply }) => {
                let _ = reply.send(core.status());
            }
            Some(InstanceMsg::Control { mask, flags, reply }) => {
                let old = ctrl_flags;
                let new = (old & !mask) | (flags & mask);
                if new != old {
                    debug!("instance {}: ctrl flags {:?} -> {:?}", name, old, new);
                    ctrl_flags = new;
                    core.on_control(old, new);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Some(InstanceMsg::StepClock { reply }) => {
                core.on_step_clock();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Some(InstanceMsg::LogStats { at }) => core.on_log_stats(at),
            Some(InstanceMsg::SaveState) => core.on_save_state(),
            Some(InstanceMsg::WriteTopology { reply }) => {
                let _ = reply.send(core.write_topology());
            }
            Some(InstanceMsg::StatsEndPeriod { at }) => core.on_stats_end_period(at),
            Some(InstanceMsg::Shutdown) => {
                info!("instance {}: shutting down", name);
                core.on_shutdown();
                break;
            }
            None => {
                if running && Instant::now() >= next_tick {
                    core.tick();
                    next_tick = Instant::now() + core.tick_interval();
                }
            }
        }
    }
}

/// Spawn the host task for an instance and return its join handle.
pub fn spawn_instance(
    name: String,
    module: ModuleImpl,
    inbox: Receiver<InstanceMsg>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_instance(name, module, inbox))
        .expect("spawning instance task")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn status_with_offset(offset: i64) -> InstanceStatus {
        InstanceStatus {
            state: SyncState::Slave,
            offset_from_master_ns: offset,
            ..Default::default()
        }
    }

    #[test]
    fn test_reporter_debounces_identical_status() {
        let (tx, rx) = mpsc::sync_channel(INBOX_DEPTH);
        let mut rep = StatusReporter::new(InstanceHandle(1), tx);

        rep.post(status_with_offset(100));
        rep.post(status_with_offset(100));
        rep.post(status_with_offset(200));

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_reporter_retries_after_full_inbox() {
        // Depth-1 pool: the second distinct post is dropped, but the reporter
        // must not record it so a later post re-attempts.
        let (tx, rx) = mpsc::sync_channel(1);
        let mut rep = StatusReporter::new(InstanceHandle(1), tx);

        rep.post(status_with_offset(1));
        rep.post(status_with_offset(2)); // dropped, pool full
        assert!(rx.try_recv().is_ok());
        rep.post(status_with_offset(2)); // retried now that there is room

        match rx.try_recv() {
            Ok(EngineMsg::StatusChanged { status, .. }) => {
                assert_eq!(status.offset_from_master_ns, 2)
            }
            _ => panic!("expected retried status update"),
        }
    }

    #[test]
    fn test_control_merge_semantics() {
        // new = (old & !mask) | (flags & mask)
        let old = CtrlFlags::CLOCK_CTRL;
        let mask = CtrlFlags::CLOCK_CTRL | CtrlFlags::CLUSTERING_DETERMINANT;
        let flags = CtrlFlags::CLUSTERING_DETERMINANT;
        let new = (old & !mask) | (flags & mask);
        assert_eq!(new, CtrlFlags::CLUSTERING_DETERMINANT);

        let mask = CtrlFlags::CLOCK_CTRL;
        let flags = CtrlFlags::empty();
        let new = (old & !mask) | (flags & mask);
        assert_eq!(new, CtrlFlags::empty());
    }

    #[test]
    fn test_instance_name_limit() {
        assert!("a".repeat(MAX_INSTANCE_NAME).len() <= 63);
    }

    #[test]
    fn test_alarm_bit_count_orders_severity() {
        let none = Alarms::empty();
        let one = Alarms::NO_RX_TIMESTAMPS;
        let two = Alarms::NO_RX_TIMESTAMPS | Alarms::SOURCE_LOST;
        assert!(none.bits().count_ones() < one.bits().count_ones());
        assert!(one.bits().count_ones() < two.bits().count_ones());
    }
}
