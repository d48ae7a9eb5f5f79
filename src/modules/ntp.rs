//! NTP sync-module instance: samples an upstream NTP server and offers the
//! measured offset to the selector. When granted clock control it slews its
//! local clock toward the upstream time.

use crate::clock::Clock;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::instance::{
    Alarms, CtrlFlags, InstanceStatus, MasterInfo, ModuleCore, StatusReporter, SyncState,
};
use crate::servo::PiServo;
use crate::status::{save_instance_state, StateExtra};
use log::{debug, info, warn};
use rsntp::SntpClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// PTP timeSource value for an NTP-fed reference.
const TIME_SOURCE_NTP: u8 = 0x60;

/// Seam onto the SNTP client so tests control the upstream.
#[cfg_attr(test, mockall::automock)]
pub trait NtpSource: Send {
    /// (local − server) in nanoseconds.
    fn offset_ns(&mut self) -> SyncResult<i64>;
}

pub struct SntpSource {
    server: String,
}

impl SntpSource {
    pub fn new(server: &str) -> Self {
        SntpSource {
            server: server.to_string(),
        }
    }
}

impl NtpSource for SntpSource {
    fn offset_ns(&mut self) -> SyncResult<i64> {
        let client = SntpClient::new();
        let result = client
            .synchronize(&self.server)
            .map_err(|e| SyncError::with(ErrorKind::TryAgain, e.to_string()))?;
        // clock_offset is the correction to apply to the local clock, so the
        // local clock leads the server by its negation.
        let correction_secs = result.clock_offset().as_secs_f64();
        Ok((-correction_secs * 1e9) as i64)
    }
}

pub struct NtpModule {
    name: String,
    state_dir: PathBuf,
    reporter: StatusReporter,
    clock: Arc<Clock>,
    source: Box<dyn NtpSource>,
    poll_interval: Duration,
    next_poll: Instant,
    servo: PiServo,
    status: InstanceStatus,
    ctrl_flags: CtrlFlags,
    /// Set after a step until a fresh measurement replaces the stale offset.
    offset_invalid: bool,
}

impl NtpModule {
    pub fn new(
        name: String,
        state_dir: PathBuf,
        reporter: StatusReporter,
        clock: Arc<Clock>,
        source: Box<dyn NtpSource>,
        poll_interval: Duration,
        user_priority: u32,
        accuracy: Option<f64>,
        servo: PiServo,
    ) -> Self {
        let status = InstanceStatus {
            state: SyncState::Listening,
            user_priority,
            local_accuracy: accuracy.unwrap_or(f64::INFINITY),
            ..Default::default()
        };
        NtpModule {
            name,
            state_dir,
            reporter,
            clock,
            source,
            poll_interval,
            next_poll: Instant::now(),
            servo,
            status,
            ctrl_flags: CtrlFlags::empty(),
            offset_invalid: false,
        }
    }

    fn poll_upstream(&mut self) {
        match self.source.offset_ns() {
            Ok(offset_ns) => {
                if self.offset_invalid {
                    debug!("ntp {}: fresh measurement replaces pre-step offset", self.name);
                    self.offset_invalid = false;
                }
                self.status.state = SyncState::Slave;
                self.status.alarms.remove(Alarms::SOURCE_LOST);
                self.status.offset_from_master_ns = offset_ns;
                self.status.master = MasterInfo {
                    clock_class: 248,
                    time_source: TIME_SOURCE_NTP,
                    steps_removed: 1,
                    clock_id: self.status.master.clock_id,
                    accuracy: self.status.master.accuracy,
                };
                debug!("ntp {}: offset {:+}ns", self.name, offset_ns);

                if self.ctrl_flags.contains(CtrlFlags::CLOCK_CTRL) {
                    let adj = self.servo.sample(offset_ns);
                    if let Err(e) = self.clock.slew_ppm(adj) {
                        warn!("ntp {}: slew failed: {}", self.name, e);
                    }
                }
                self.reporter
                    .post_rt_stats(offset_ns, true);
            }
            Err(e) => {
                debug!("ntp {}: poll failed: {}", self.name, e);
                self.status.state = match e.kind() {
                    ErrorKind::NotRunning => SyncState::Disabled,
                    ErrorKind::TryAgain => SyncState::Listening,
                    _ => SyncState::Faulty,
                };
                self.status.alarms.insert(Alarms::SOURCE_LOST);
                self.status.offset_from_master_ns = 0;
            }
        }
        self.reporter.post(self.status.clone());
    }
}

impl ModuleCore for NtpModule {
    fn tick_interval(&self) -> Duration {
        Duration::from_millis(250)
    }

    fn on_run(&mut self) {
        self.next_poll = Instant::now();
        self.reporter.post(self.status.clone());
    }

    fn tick(&mut self) {
        if Instant::now() >= self.next_poll {
            self.next_poll = Instant::now() + self.poll_interval;
            self.poll_upstream();
        }
    }

    fn status(&self) -> InstanceStatus {
        self.status.clone()
    }

    fn on_control(&mut self, old: CtrlFlags, new: CtrlFlags) {
        self.ctrl_flags = new;
        if (old ^ new).contains(CtrlFlags::CLOCK_CTRL) {
            self.servo.reset();
            info!(
                "ntp {}: clock control {}",
                self.name,
                if new.contains(CtrlFlags::CLOCK_CTRL) {
                    "granted"
                } else {
                    "revoked"
                }
            );
        }
    }

    fn on_step_clock(&mut self) {
        // The last measured offset predates the step.
        self.offset_invalid = true;
        self.servo.reset();
        if self.status.state == SyncState::Slave {
            self.status.state = SyncState::Listening;
            self.status.offset_from_master_ns = 0;
            self.reporter.post(self.status.clone());
        }
    }

    fn on_save_state(&mut self) {
        let extra = StateExtra {
            in_sync: self.status.state == SyncState::Slave,
            ..Default::default()
        };
        if let Err(e) = save_instance_state(
            &self.state_dir,
            &self.name,
            &self.status,
            self.ctrl_flags,
            &extra,
        ) {
            warn!("ntp {}: saving state failed: {}", self.name, e);
        }
    }

    fn on_log_stats(&mut self, _at: SystemTime) {
        info!(
            "ntp {}: state={} offset={}ns",
            self.name, self.status.state, self.status.offset_from_master_ns
        );
    }

    fn on_stats_end_period(&mut self, _at: SystemTime) {}

    fn write_topology(&self) -> String {
        format!(
            "ntp instance {}\nstate {}\noffset {}ns\n",
            self.name, self.status.state, self.status.offset_from_master_ns
        )
    }

    fn on_shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockId, ClockRole, MockClockDevice};
    use crate::instance::{EngineMsg, InstanceHandle};
    use std::sync::mpsc;

    fn sys_clock(dev: MockClockDevice) -> Arc<Clock> {
        Arc::new(Clock::new(
            ClockId::system(),
            "system",
            ClockRole::System,
            Box::new(dev),
        ))
    }

    fn module(
        source: MockNtpSource,
        dev: MockClockDevice,
    ) -> (NtpModule, mpsc::Receiver<EngineMsg>) {
        let (tx, rx) = mpsc::sync_channel(64);
        let m = NtpModule::new(
            "ntp1".to_string(),
            std::env::temp_dir(),
            StatusReporter::new(InstanceHandle(2), tx),
            sys_clock(dev),
            Box::new(source),
            Duration::from_secs(4),
            0,
            None,
            PiServo::new(0.3, 0.1),
        );
        (m, rx)
    }

    #[test]
    fn test_successful_poll_reports_slave() {
        let mut source = MockNtpSource::new();
        source.expect_offset_ns().returning(|| Ok(42_000));
        let (mut m, rx) = module(source, MockClockDevice::new());

        m.poll_upstream();
        assert_eq!(m.status.state, SyncState::Slave);
        assert_eq!(m.status.offset_from_master_ns, 42_000);
        assert_eq!(m.status.master.steps_removed, 1);
        assert!(rx.try_iter().count() >= 1);
    }

    #[test]
    fn test_failed_poll_raises_source_lost() {
        let mut source = MockNtpSource::new();
        source
            .expect_offset_ns()
            .returning(|| Err(SyncError::new(ErrorKind::TryAgain)));
        let (mut m, _rx) = module(source, MockClockDevice::new());

        m.poll_upstream();
        assert_eq!(m.status.state, SyncState::Listening);
        assert!(m.status.alarms.contains(Alarms::SOURCE_LOST));
    }

    #[test]
    fn test_clock_ctrl_slews_clock() {
        let mut source = MockNtpSource::new();
        source.expect_offset_ns().returning(|| Ok(1_000_000));
        let mut dev = MockClockDevice::new();
        dev.expect_set_freq_ppm().times(1).returning(|_| Ok(()));
        let (mut m, _rx) = module(source, dev);

        m.on_control(CtrlFlags::empty(), CtrlFlags::CLOCK_CTRL);
        m.poll_upstream();
    }

    #[test]
    fn test_no_slew_without_clock_ctrl() {
        let mut source = MockNtpSource::new();
        source.expect_offset_ns().returning(|| Ok(1_000_000));
        let mut dev = MockClockDevice::new();
        dev.expect_set_freq_ppm().never();
        let (mut m, _rx) = module(source, dev);

        m.poll_upstream();
    }

    #[test]
    fn test_step_clock_invalidates_offset() {
        let mut source = MockNtpSource::new();
        source.expect_offset_ns().returning(|| Ok(500));
        let (mut m, _rx) = module(source, MockClockDevice::new());

        m.poll_upstream();
        assert_eq!(m.status.state, SyncState::Slave);

        m.on_step_clock();
        assert!(m.offset_invalid);
        assert_eq!(m.status.state, SyncState::Listening);
        assert_eq!(m.status.offset_from_master_ns, 0);

        // The next measurement restores slave.
        m.poll_upstream();
        assert!(!m.offset_invalid);
        assert_eq!(m.status.state, SyncState::Slave);
    }
}
