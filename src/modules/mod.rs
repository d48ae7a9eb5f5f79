//! The non-chrony sync-module kinds. The protocol engines behind `ptp`,
//! `pps` and `gps` are external collaborators plugged in as `TimeSource`
//! providers; the modules here host them behind the common instance
//! contract.

pub mod external;
pub mod freerun;
pub mod ntp;

use crate::clock::ClockId;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::instance::{Alarms, SyncState};

/// One upstream observation delivered by a pluggable time source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSample {
    pub state: SyncState,
    /// (local − upstream) in nanoseconds.
    pub offset_ns: i64,
    /// Upstream accuracy estimate in seconds; `INFINITY` when unknown.
    pub accuracy: f64,
    pub clock_class: u8,
    pub time_source: u8,
    pub steps_removed: u16,
    pub clock_id: ClockId,
    pub alarms: Alarms,
}

/// Provider seam for the ptp/pps/gps engines.
#[cfg_attr(test, mockall::automock)]
pub trait TimeSource: Send {
    /// Fetch the current observation. `TryAgain` means no fix yet,
    /// `NotRunning` that the upstream engine is absent.
    fn poll(&mut self) -> SyncResult<SourceSample>;

    /// The local clock was stepped; drop any state derived from pre-step
    /// readings.
    fn invalidate(&mut self) {}
}

/// Stand-in provider for a protocol engine that has not been attached:
/// reports "no fix yet" forever, keeping the instance in listening.
pub struct IdleSource;

impl TimeSource for IdleSource {
    fn poll(&mut self) -> SyncResult<SourceSample> {
        Err(SyncError::new(ErrorKind::TryAgain))
    }
}
