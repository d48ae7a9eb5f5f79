//! Free-running clock instance: offers a local oscillator as a selection
//! candidate of last resort. It never follows anything, so it is always in
//! the master state with its configured accuracy.

use crate::clock::Clock;
use crate::instance::{
    CtrlFlags, InstanceStatus, MasterInfo, ModuleCore, StatusReporter, SyncState,
};
use crate::status::{save_instance_state, StateExtra};
use log::warn;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// PTP timeSource value for an internal oscillator.
const TIME_SOURCE_INTERNAL: u8 = 0xA0;

pub struct FreerunModule {
    name: String,
    state_dir: PathBuf,
    reporter: StatusReporter,
    clock: Arc<Clock>,
    status: InstanceStatus,
    ctrl_flags: CtrlFlags,
}

impl FreerunModule {
    pub fn new(
        name: String,
        state_dir: PathBuf,
        reporter: StatusReporter,
        clock: Arc<Clock>,
        user_priority: u32,
        accuracy: Option<f64>,
    ) -> Self {
        let status = InstanceStatus {
            state: SyncState::Master,
            user_priority,
            local_accuracy: accuracy.unwrap_or(f64::INFINITY),
            master: MasterInfo {
                clock_class: 248,
                time_source: TIME_SOURCE_INTERNAL,
                steps_removed: 0,
                clock_id: clock.id(),
                accuracy: accuracy.unwrap_or(f64::INFINITY),
            },
            ..Default::default()
        };
        FreerunModule {
            name,
            state_dir,
            reporter,
            clock,
            status,
            ctrl_flags: CtrlFlags::empty(),
        }
    }
}

impl ModuleCore for FreerunModule {
    fn tick_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn on_run(&mut self) {
        self.reporter.post(self.status.clone());
    }

    fn tick(&mut self) {
        // Nothing to sample; the debounced reporter makes re-posting free.
        self.reporter.post(self.status.clone());
    }

    fn status(&self) -> InstanceStatus {
        self.status.clone()
    }

    fn on_control(&mut self, _old: CtrlFlags, new: CtrlFlags) {
        self.ctrl_flags = new;
    }

    fn on_step_clock(&mut self) {}

    fn on_save_state(&mut self) {
        let extra = StateExtra {
            in_sync: true,
            ..Default::default()
        };
        if let Err(e) = save_instance_state(
            &self.state_dir,
            &self.name,
            &self.status,
            self.ctrl_flags,
            &extra,
        ) {
            warn!("freerun {}: saving state failed: {}", self.name, e);
        }
    }

    fn on_log_stats(&mut self, _at: SystemTime) {}

    fn on_stats_end_period(&mut self, _at: SystemTime) {}

    fn write_topology(&self) -> String {
        format!(
            "freerun instance {}\nclock {}\nstate {}\n",
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
    use crate::instance::{EngineMsg, InstanceHandle};
    use std::sync::mpsc;

    #[test]
    fn test_freerun_reports_master_once() {
        let (tx, rx) = mpsc::sync_channel(16);
        let clock = Arc::new(Clock::new(
            ClockId::system(),
            "system",
            ClockRole::System,
            Box::new(MockClockDevice::new()),
        ));
        let mut module = FreerunModule::new(
            "fr0".to_string(),
            std::env::temp_dir(),
            StatusReporter::new(InstanceHandle(3), tx),
            clock,
            20,
            Some(1e-4),
        );

        module.on_run();
        module.tick();
        module.tick();

        let mut updates = 0;
        while let Ok(msg) = rx.try_recv() {
            if let EngineMsg::StatusChanged { status, .. } = msg {
                assert_eq!(status.state, SyncState::Master);
                assert_eq!(status.user_priority, 20);
                assert_eq!(status.local_accuracy, 1e-4);
                updates += 1;
            }
        }
        assert_eq!(updates, 1, "identical statuses must be debounced");
    }
}
