//! Persisted per-instance state snapshots: plain key:value text files under
//! the state directory, overwritten on each SAVE_STATE cycle. These are a
//! user-observability artefact, never an input.

use crate::instance::{CtrlFlags, InstanceStatus};
use chrono::Utc;
use std::io::Write;
use std::path::Path;

/// Instance-kind specific fields of the snapshot.
#[derive(Debug, Clone, Default)]
pub struct StateExtra {
    pub selected_peer: Option<String>,
    pub num_peers: usize,
    pub num_candidates: usize,
    pub in_sync: bool,
}

pub fn save_instance_state(
    state_dir: &Path,
    name: &str,
    status: &InstanceStatus,
    ctrl_flags: CtrlFlags,
    extra: &StateExtra,
) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join(name);
    let mut out = std::fs::File::create(&path)?;

    writeln!(out, "instance: {}", name)?;
    writeln!(out, "saved-at: {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"))?;
    writeln!(out, "state: {}", status.state)?;
    writeln!(out, "alarms: {:#06x}", status.alarms.bits())?;
    writeln!(out, "constraints: {:#06x}", status.constraints.bits())?;
    writeln!(out, "control-flags: {:#06x}", ctrl_flags.bits())?;
    writeln!(out, "offset-from-peer: {}", status.offset_from_master_ns)?;
    writeln!(out, "in-sync: {}", extra.in_sync)?;
    writeln!(
        out,
        "selected-peer: {}",
        extra.selected_peer.as_deref().unwrap_or("none")
    )?;
    writeln!(out, "num-peers: {}", extra.num_peers)?;
    writeln!(out, "num-candidates: {}", extra.num_candidates)?;
    writeln!(out, "clustering-score: {}", status.clustering_score)?;
    Ok(())
}
