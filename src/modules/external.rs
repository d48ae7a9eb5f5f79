//! Host for the pluggable sync-module kinds (ptp, pps, gps): a `TimeSource`
//! provider does the protocol work, this module gives it the instance
//! contract and optional clock discipline.

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::instance::{
    Alarms, CtrlFlags, InstanceStatus, MasterInfo, ModuleCore, StatusReporter, SyncState,
};
use crate::modules::TimeSource;
use crate::servo::PiServo;
use crate::status::{save_instance_state, StateExtra};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub struct ExternalModule {
    name: String,
    kind_label: &'static str,
    state_dir: PathBuf,
    reporter: StatusReporter,
    /// The clock this instance disciplines when granted control; a PHC for
    /// ptp instances, the system clock otherwise.
    clock: Arc<Clock>,
    source: Box<dyn TimeSource>,
    poll_interval: Duration,
    next_poll: Instant,
    servo: PiServo,
    status: InstanceStatus,
    ctrl_flags: CtrlFlags,
}

impl ExternalModule {
    pub fn new(
        name: String,
        kind_label: &'static str,
        state_dir: PathBuf,
        reporter: StatusReporter,
        clock: Arc<Clock>,
        source: Box<dyn TimeSource>,
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
        ExternalModule {
            name,
            kind_label,
            state_dir,
            reporter,
            clock,
            source,
            poll_interval,
            next_poll: Instant::now(),
            servo,
            status,
            ctrl_flags: CtrlFlags::empty(),
        }
    }

    fn poll_source(&mut self) {
        match self.source.poll() {
            Ok(sample) => {
                self.status.state = sample.state;
                self.status.alarms = sample.alarms;
                self.status.offset_from_master_ns = sample.offset_ns;
                self.status.master = MasterInfo {
                    clock_class: sample.clock_class,
                    time_source: sample.time_source,
                    steps_removed: sample.steps_removed,
                    clock_id: sample.clock_id,
                    accuracy: sample.accuracy,
                };

                if sample.state == SyncState::Slave
                    && self.ctrl_flags.contains(CtrlFlags::CLOCK_CTRL)
                {
                    let adj = self.servo.sample(sample.offset_ns);
                    if let Err(e) = self.clock.slew_ppm(adj) {
                        warn!("{} {}: slew failed: {}", self.kind_label, self.name, e);
                    }
                }
                self.reporter
                    .post_rt_stats(sample.offset_ns, sample.state == SyncState::Slave);
            }
            Err(e) => {
                debug!("{} {}: poll failed: {}", self.kind_label, self.name, e);
                self.status.state = match e.kind() {
                    ErrorKind::NotRunning => SyncState::Disabled,
                    ErrorKind::TryAgain => SyncState::Listening,
                    _ => SyncState::Faulty,
                };
                self.status.offset_from_master_ns = 0;
                if e.kind() != ErrorKind::TryAgain {
                    self.status.alarms.insert(Alarms::SOURCE_LOST);
                }
            }
        }
        self.reporter.post(self.status.clone());
    }
}

impl ModuleCore for ExternalModule {
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
            self.poll_source();
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
                "{} {}: clock control {}",
                self.kind_label,
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
        self.source.invalidate();
        self.servo.reset();
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
            warn!("{} {}: saving state failed: {}", self.kind_label, self.name, e);
        }
    }

    fn on_log_stats(&mut self, _at: SystemTime) {
        info!(
            "{} {}: state={} offset={}ns",
            self.kind_label, self.name, self.status.state, self.status.offset_from_master_ns
        );
    }

    fn on_stats_end_period(&mut self, _at: SystemTime) {}

    fn write_topology(&self) -> String {
        format!(
            "{} instance {}\nclock {}\nstate {}\n",
            self.kind_label,
            self.name,
            self.clock.id(),
            self.status.state
        )
    }

    fn on_shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockId, ClockRole, MockClockDevice};
    use crate::error::SyncError;
    use crate::instance::InstanceHandle;
    use crate::modules::{MockTimeSource, SourceSample};
    use std::sync::mpsc;

    fn sample(state: SyncState, offset: i64) -> SourceSample {
        SourceSample {
            state,
            offset_ns: offset,
            accuracy: 1e-7,
            clock_class: 6,
            time_source: 0x20,
            steps_removed: 1,
            clock_id: ClockId::from_mac([0, 1, 2, 3, 4, 5], [0xff, 0xfe]),
            alarms: Alarms::empty(),
        }
    }

    fn module(source: MockTimeSource, dev: MockClockDevice) -> ExternalModule {
        let (tx, _rx) = mpsc::sync_channel(64);
        let clock = Arc::new(Clock::new(
            ClockId::from_mac([0, 1, 2, 3, 4, 5], [0xff, 0xfe]),
            "phc-eth0",
            ClockRole::Phc,
            Box::new(dev),
        ));
        ExternalModule::new(
            "ptp1".to_string(),
            "ptp",
            std::env::temp_dir(),
            StatusReporter::new(InstanceHandle(1), tx),
            clock,
            Box::new(source),
            Duration::from_secs(1),
            0,
            None,
            PiServo::new(0.3, 0.1),
        )
    }

    #[test]
    fn test_sample_populates_master_info() {
        let mut source = MockTimeSource::new();
        source
            .expect_poll()
            .returning(|| Ok(sample(SyncState::Slave, 2_500)));
        let mut m = module(source, MockClockDevice::new());

        m.poll_source();
        assert_eq!(m.status.state, SyncState::Slave);
        assert_eq!(m.status.offset_from_master_ns, 2_500);
        assert_eq!(m.status.master.clock_class, 6);
        assert_eq!(m.status.master.steps_removed, 1);
    }

    #[test]
    fn test_slave_with_control_disciplines_clock() {
        let mut source = MockTimeSource::new();
        source
            .expect_poll()
            .returning(|| Ok(sample(SyncState::Slave, 10_000)));
        let mut dev = MockClockDevice::new();
        dev.expect_set_freq_ppm().times(1).returning(|_| Ok(()));
        let mut m = module(source, dev);

        m.on_control(CtrlFlags::empty(), CtrlFlags::CLOCK_CTRL);
        m.poll_source();
    }

    #[test]
    fn test_source_errors_map_to_states() {
        for (kind, want) in [
            (ErrorKind::NotRunning, SyncState::Disabled),
            (ErrorKind::TryAgain, SyncState::Listening),
            (ErrorKind::Fatal, SyncState::Faulty),
        ] {
            let mut source = MockTimeSource::new();
            source.expect_poll().returning(move || Err(SyncError::new(kind)));
            let mut m = module(source, MockClockDevice::new());
            m.poll_source();
            assert_eq!(m.status.state, want);
        }
    }

    #[test]
    fn test_step_clock_invalidates_source() {
        let mut source = MockTimeSource::new();
        source.expect_invalidate().times(1).returning(|| ());
        let mut m = module(source, MockClockDevice::new());
        m.on_step_clock();
    }
}
