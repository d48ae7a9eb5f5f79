//! The external-NTP adapter task: drives the polling FSM against a running
//! chrony daemon's control socket and arbitrates ownership of the system
//! clock.
//!
//! The adapter never synthesises time. It reflects the daemon's view of its
//! peers into the engine's selector and, when a helper script is configured,
//! can hand the system clock back and forth between chrony and this daemon.

use crate::clock::Clock;
use crate::config::CrnyConfig;
use crate::crny::fsm::{
    state_for_error, Action, Fsm, OffsetId, PeerRecord, QueryState, ReplyPayload, ScanResult,
};
use crate::crny::proto::{
    self, check_reply, encode_request, Query, REPLY_LEN,
};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::instance::{
    Constraints, CtrlFlags, InstanceStatus, MasterInfo, ModuleCore, StatusReporter, SyncState,
};
use crate::status::{save_instance_state, StateExtra};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::ErrorKind as IoErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// FSM tick cadence.
const FSM_TICK: Duration = Duration::from_millis(250);
/// Inbox poll granularity; bounds traffic latency well inside the reply
/// deadline.
const LOOP_TICK: Duration = Duration::from_millis(50);
/// Reply expiry after the last request.
const REPLY_DEADLINE: Duration = Duration::from_secs(1);

/// PTP timeSource value for an NTP-fed reference.
const TIME_SOURCE_NTP: u8 = 0x60;
/// clockClass for a source of unknown quality.
const CLOCK_CLASS_DEFAULT: u8 = 248;

/// Peers whose offset lies within this band of the selected peer's offset
/// count toward the clustering score.
const CLUSTER_TOLERANCE_SECS: f64 = 1e-3;

// ============================================================================
// CLOCK-CONTROL HELPER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockCtrlOp {
    Nop,
    Enable,
    Disable,
    Save,
    Restore,
    RestoreNorestart,
}

impl ClockCtrlOp {
    fn action_arg(self) -> &'static str {
        match self {
            ClockCtrlOp::Nop => "nop",
            ClockCtrlOp::Enable => "enable",
            ClockCtrlOp::Disable => "disable",
            ClockCtrlOp::Save => "save",
            ClockCtrlOp::Restore => "restore",
            ClockCtrlOp::RestoreNorestart => "restorenorestart",
        }
    }

    fn is_restore(self) -> bool {
        matches!(self, ClockCtrlOp::Restore | ClockCtrlOp::RestoreNorestart)
    }
}

/// Seam onto the helper script and the chronyd process probe.
#[cfg_attr(test, mockall::automock)]
pub trait ClockControl: Send {
    /// Invoke the helper for `op`. Exit 0 maps to ok, a non-zero exit to the
    /// errno of that value, abnormal termination to `ECHILD`.
    fn run(&mut self, op: ClockCtrlOp) -> Result<(), Errno>;

    /// Whether chrony is currently disciplining the system clock.
    fn probe_enabled(&mut self) -> SyncResult<bool>;

    /// A helper script is configured, so control can actually be changed.
    fn has_script(&self) -> bool;
}

/// Production implementation: external helper script plus /proc inspection.
pub struct ScriptClockControl {
    script: Option<PathBuf>,
}

impl ScriptClockControl {
    pub fn new(script: Option<PathBuf>) -> Self {
        ScriptClockControl { script }
    }
}

impl ClockControl for ScriptClockControl {
    fn run(&mut self, op: ClockCtrlOp) -> Result<(), Errno> {
        let Some(script) = &self.script else {
            return Err(Errno::ENOENT);
        };
        info!("crny: invoking {} {}", script.display(), op.action_arg());
        let status = Command::new(script)
            .arg(op.action_arg())
            .status()
            .map_err(|e| {
                error!("crny: helper failed to start: {}", e);
                Errno::ECHILD
            })?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => {
                error!("crny: helper {} exited {}", op.action_arg(), code);
                Err(Errno::from_i32(code))
            }
            None => {
                error!("crny: helper {} terminated abnormally", op.action_arg());
                Err(Errno::ECHILD)
            }
        }
    }

    fn probe_enabled(&mut self) -> SyncResult<bool> {
        let pid = find_chronyd_pid().ok_or_else(|| SyncError::new(ErrorKind::NotRunning))?;
        let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid))
            .map_err(|_| SyncError::new(ErrorKind::NotRunning))?;
        // -x as a standalone argument means chronyd is not setting the clock.
        let has_x = cmdline.split(|b| *b == 0).any(|arg| arg == b"-x");
        Ok(!has_x)
    }

    fn has_script(&self) -> bool {
        self.script.is_some()
    }
}

fn find_chronyd_pid() -> Option<u32> {
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if let Ok(comm) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
            if comm.trim_end() == "chronyd" {
                return Some(pid);
            }
        }
    }
    None
}

/// Enforces the save/restore and rate-limit rules around helper invocations.
pub struct CtrlArbiter {
    saved: bool,
    clock_control_at_save: bool,
    last_invoke: Option<Instant>,
    min_interval: Duration,
}

impl CtrlArbiter {
    pub fn new(min_interval: Duration) -> Self {
        CtrlArbiter {
            saved: false,
            clock_control_at_save: false,
            last_invoke: None,
            min_interval,
        }
    }

    pub fn saved(&self) -> bool {
        self.saved
    }

    /// Apply the collapse rules and invoke the helper. Returns the op that
    /// actually ran (`Nop` when the request collapsed away).
    pub fn invoke(
        &mut self,
        ctl: &mut dyn ClockControl,
        op: ClockCtrlOp,
        current_enabled: bool,
        now: Instant,
    ) -> Result<ClockCtrlOp, Errno> {
        let effective = match op {
            ClockCtrlOp::Save => {
                if self.saved {
                    return Ok(ClockCtrlOp::Nop);
                }
                ClockCtrlOp::Save
            }
            ClockCtrlOp::Enable if current_enabled => return Ok(ClockCtrlOp::Nop),
            ClockCtrlOp::Disable if !current_enabled => return Ok(ClockCtrlOp::Nop),
            ClockCtrlOp::Restore if current_enabled == self.clock_control_at_save => {
                ClockCtrlOp::RestoreNorestart
            }
            ClockCtrlOp::Nop => return Ok(ClockCtrlOp::Nop),
            other => other,
        };

        if !effective.is_restore() {
            if let Some(last) = self.last_invoke {
                if now.duration_since(last) < self.min_interval {
                    return Err(Errno::EAGAIN);
                }
            }
        }

        ctl.run(effective)?;

        if effective == ClockCtrlOp::Save {
            self.saved = true;
            self.clock_control_at_save = current_enabled;
        }
        if !effective.is_restore() {
            self.last_invoke = Some(now);
        }
        Ok(effective)
    }
}

// ============================================================================
// ADAPTER MODULE
// ============================================================================

struct PendingRequest {
    query: Query,
    sequence: u32,
    deadline: Instant,
}

pub struct CrnyModule {
    name: String,
    cfg: CrnyConfig,
    state_dir: PathBuf,
    reporter: StatusReporter,
    system_clock: Arc<Clock>,
    ctl: Box<dyn ClockControl>,
    arbiter: CtrlArbiter,

    fsm: Fsm,
    sock: Option<UnixDatagram>,
    local_path: Option<PathBuf>,
    pending: Option<PendingRequest>,
    /// Armed while an in-progress connect awaits the socket's verdict.
    connect_deadline: Option<Instant>,

    next_fsm_tick: Instant,
    next_poll: Instant,

    ctrl_flags: CtrlFlags,
    offset_unsafe: bool,
    offset_id: OffsetId,
    observed_enabled: Option<bool>,
    have_blocked_sys: bool,

    status: InstanceStatus,
    peers: Vec<PeerRecord>,
    selected_peer_idx: i32,
}

impl CrnyModule {
    pub fn new(
        name: String,
        cfg: CrnyConfig,
        state_dir: PathBuf,
        system_clock: Arc<Clock>,
        reporter: StatusReporter,
        ctl: Box<dyn ClockControl>,
        user_priority: u32,
        local_accuracy: Option<f64>,
    ) -> Self {
        let arbiter = CtrlArbiter::new(Duration::from_secs(cfg.min_script_interval_secs));
        let status = InstanceStatus {
            state: SyncState::Listening,
            user_priority,
            local_accuracy: local_accuracy.unwrap_or(f64::INFINITY),
            ..Default::default()
        };
        let now = Instant::now();
        CrnyModule {
            name,
            cfg,
            state_dir,
            reporter,
            system_clock,
            ctl,
            arbiter,
            fsm: Fsm::new(),
            sock: None,
            local_path: None,
            pending: None,
            connect_deadline: None,
            next_fsm_tick: now,
            next_poll: now,
            ctrl_flags: CtrlFlags::empty(),
            offset_unsafe: false,
            offset_id: OffsetId::default(),
            observed_enabled: None,
            have_blocked_sys: false,
            status,
            peers: Vec::new(),
            selected_peer_idx: -1,
        }
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    fn local_socket_path(&self) -> PathBuf {
        // chronyd only answers sockets living next to its own, so bind in
        // the daemon's directory with our PID in the name.
        let dir = self
            .cfg
            .socket_path
            .parent()
            .unwrap_or_else(|| Path::new("/var/run"));
        dir.join(format!("refsyncd.{}.sock", std::process::id()))
    }

    fn open_socket(&mut self) -> Result<bool, ErrorKind> {
        let local = self.local_socket_path();
        let _ = std::fs::remove_file(&local);

        let sock = Socket::new(Domain::UNIX, Type::DGRAM, None).map_err(|e| {
            warn!("crny {}: socket creation failed: {}", self.name, e);
            ErrorKind::Fatal
        })?;
        sock.set_nonblocking(true).map_err(|_| ErrorKind::Fatal)?;
        sock.set_cloexec(true).map_err(|_| ErrorKind::Fatal)?;

        let local_addr = SockAddr::unix(&local).map_err(|_| ErrorKind::Fatal)?;
        if let Err(e) = sock.bind(&local_addr) {
            warn!("crny {}: bind {} failed: {}", self.name, local.display(), e);
            return Err(ErrorKind::Fatal);
        }
        self.local_path = Some(local.clone());

        let remote =
            SockAddr::unix(&self.cfg.socket_path).map_err(|_| ErrorKind::Fatal)?;
        match sock.connect(&remote) {
            Ok(()) => {
                self.sock = Some(sock.into());
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.sock = Some(sock.into());
                Ok(false)
            }
            Err(e) => {
                debug!(
                    "crny {}: connect {} failed: {}",
                    self.name,
                    self.cfg.socket_path.display(),
                    e
                );
                // Socket file removed on connect failure.
                let _ = std::fs::remove_file(&local);
                self.local_path = None;
                let kind = match e.raw_os_error() {
                    Some(libc::ENOENT) | Some(libc::ECONNREFUSED) => ErrorKind::NotRunning,
                    Some(code) => ErrorKind::from_errno(Errno::from_i32(code)),
                    None => ErrorKind::Fatal,
                };
                Err(kind)
            }
        }
    }

    fn close_socket(&mut self) {
        self.sock = None;
        self.pending = None;
        if let Some(path) = self.local_path.take() {
            let _ = std::fs::remove_file(&path);
        }
    }

    fn issue(&mut self, query: Query) {
        let Some(sock) = &self.sock else {
            // The FSM never requests a query without a socket; treat as a
            // logic bug surfaced as a lost connection.
            error!("crny {}: query issued with no socket", self.name);
            let acts = self.fsm.on_conn_lost(ErrorKind::Fatal);
            self.exec(acts);
            return;
        };
        let sequence: u32 = rand::random();
        let frame = encode_request(&query, sequence);
        match sock.send(&frame) {
            Ok(_) => {
                self.pending = Some(PendingRequest {
                    query,
                    sequence,
                    deadline: Instant::now() + REPLY_DEADLINE,
                });
            }
            Err(e) => {
                debug!("crny {}: send failed: {}", self.name, e);
                let kind = match e.raw_os_error() {
                    Some(libc::ENOENT) | Some(libc::ECONNREFUSED) => ErrorKind::NotRunning,
                    _ => ErrorKind::TryAgain,
                };
                let acts = self.fsm.on_conn_lost(kind);
                self.exec(acts);
            }
        }
    }

    // ------------------------------------------------------------------
    // Traffic
    // ------------------------------------------------------------------

    fn drain_socket(&mut self) {
        loop {
            let Some(sock) = &self.sock else { return };
            let mut buf = [0u8; REPLY_LEN + 64];
            match sock.recv(&mut buf) {
                Ok(len) => {
                    if self.fsm.state() == QueryState::ConnectWait {
                        let ok = matches!(sock.take_error(), Ok(None));
                        self.connect_deadline = None;
                        let acts = self.fsm.on_connect_ready(ok);
                        self.exec(acts);
                        continue;
                    }
                    self.handle_reply(&buf[..len]);
                }
                Err(e) if e.kind() == IoErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("crny {}: recv failed: {}", self.name, e);
                    let acts = self.fsm.on_conn_lost(ErrorKind::NotRunning);
                    self.exec(acts);
                    return;
                }
            }
        }
    }

    fn handle_reply(&mut self, frame: &[u8]) {
        let Some(pending) = &self.pending else {
            debug!("crny {}: unsolicited packet dropped", self.name);
            return;
        };
        let query = pending.query;
        let sequence = pending.sequence;

        let parsed = check_reply(frame, query.command(), sequence, query.expected_reply())
            .and_then(|payload| match query {
                Query::Tracking => proto::parse_tracking(payload).map(ReplyPayload::Tracking),
                Query::NumSources => {
                    proto::parse_num_sources(payload).map(ReplyPayload::NumSources)
                }
                Query::SourceData(_) => {
                    proto::parse_source_datum(payload).map(ReplyPayload::SourceDatum)
                }
                Query::NtpData(_) => proto::parse_ntp_datum(payload).map(ReplyPayload::NtpDatum),
            });

        match parsed {
            Ok(payload) => {
                self.pending = None;
                let offset_unsafe = self.offset_unsafe;
                let offset_id = self.offset_id.clone();
                let acts = self.fsm.on_traffic(payload, offset_unsafe, &offset_id);
                self.exec(acts);
            }
            Err(e) => {
                // Mismatched or malformed reply: abandon this request and
                // re-scan from the top on the next poll.
                debug!("crny {}: bad reply: {}", self.name, e);
                self.pending = None;
                let acts = self.fsm.on_bad_reply();
                self.exec(acts);
            }
        }
    }

    // ------------------------------------------------------------------
    // Action execution
    // ------------------------------------------------------------------

    fn exec(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect => {
                    let result = self.open_socket();
                    let in_progress = matches!(result, Ok(false));
                    let acts = self.fsm.on_connect_result(result);
                    if in_progress {
                        self.connect_deadline = Some(Instant::now() + REPLY_DEADLINE);
                    }
                    self.exec(acts);
                }
                Action::Issue(query) => self.issue(query),
                Action::Close => self.close_socket(),
                Action::PublishScan(result) => self.publish_scan(result),
                Action::PublishError(kind) => self.publish_error(kind),
            }
        }
    }

    // ------------------------------------------------------------------
    // Publication and clock-control arbitration
    // ------------------------------------------------------------------

    fn publish_scan(&mut self, r: ScanResult) {
        if r.clear_offset_unsafe && self.offset_unsafe {
            info!("crny {}: upstream recomputed offset, offsets trusted again", self.name);
            self.offset_unsafe = false;
        }
        if let Some(id) = r.new_offset_id {
            self.offset_id = id;
        }
        self.peers = r.peers;
        self.selected_peer_idx = r.selected_peer_idx;

        let score = cluster_score(&self.peers, self.selected_peer_idx);
        if score != self.status.clustering_score {
            self.status.clustering_score = score;
            self.reporter.post_clustering(score);
        }

        self.status.state = r.state;
        self.status.offset_from_master_ns = (r.offset * 1e9) as i64;
        self.status.master = MasterInfo {
            clock_class: CLOCK_CLASS_DEFAULT,
            time_source: TIME_SOURCE_NTP,
            steps_removed: r.stratum,
            clock_id: self.status.master.clock_id,
            accuracy: if r.state == SyncState::Slave {
                r.root_dispersion
            } else {
                f64::INFINITY
            },
        };

        self.check_clock_control();
        self.reporter.post(self.status.clone());
        self.reporter
            .post_rt_stats(self.status.offset_from_master_ns, r.state == SyncState::Slave);
    }

    fn publish_error(&mut self, kind: ErrorKind) {
        self.status.state = state_for_error(kind);
        self.status.offset_from_master_ns = 0;
        self.status.master.accuracy = f64::INFINITY;
        self.selected_peer_idx = -1;
        if self.status.clustering_score != 0 {
            self.status.clustering_score = 0;
            self.reporter.post_clustering(0);
        }
        self.reporter.post(self.status.clone());
    }

    /// Pre-RUN constraint derivation: without a helper script the user
    /// cannot change which daemon owns the system clock, so the selector
    /// must respect the status quo.
    fn derive_constraints(&mut self) {
        if self.ctl.has_script() {
            return;
        }
        match self.ctl.probe_enabled() {
            Ok(true) => {
                info!(
                    "crny {}: chrony disciplines the system clock and no control script is configured",
                    self.name
                );
                self.status.constraints = Constraints::MUST_BE_SELECTED;
            }
            Ok(false) => {
                self.status.constraints = Constraints::CANNOT_BE_SELECTED;
            }
            Err(_) => {
                self.status.constraints = Constraints::empty();
            }
        }
    }

    /// Track the observed clock-control state and reconcile it with what the
    /// engine wants.
    fn check_clock_control(&mut self) {
        let observed = match self.ctl.probe_enabled() {
            Ok(v) => v,
            Err(_) => return,
        };

        if self.observed_enabled != Some(observed) {
            self.observed_enabled = Some(observed);
            if observed {
                self.system_clock.set_blocked(true);
                self.have_blocked_sys = true;
            } else if self.have_blocked_sys {
                self.system_clock.set_blocked(false);
                self.have_blocked_sys = false;
            }
        }

        let wanted = self.ctrl_flags.contains(CtrlFlags::CLOCK_CTRL);
        if observed != wanted
            && self.status.state != SyncState::Disabled
            && self.ctl.has_script()
        {
            self.reconcile_clock_control(observed, wanted);
        }
    }

    fn reconcile_clock_control(&mut self, observed: bool, wanted: bool) {
        if !self.arbiter.saved() {
            if let Err(e) = self.arbiter.invoke(
                self.ctl.as_mut(),
                ClockCtrlOp::Save,
                observed,
                Instant::now(),
            ) {
                warn!("crny {}: clock-control save failed: {}", self.name, e);
                return;
            }
        }

        let op = if wanted {
            ClockCtrlOp::Enable
        } else {
            ClockCtrlOp::Disable
        };
        // The daemon restarts over this boundary; drop the control
        // connection and let the state machine re-open it on the next poll.
        self.close_socket();
        self.fsm.on_socket_closed();

        match self
            .arbiter
            .invoke(self.ctl.as_mut(), op, observed, Instant::now())
        {
            Ok(ran) => {
                info!(
                    "crny {}: clock control {} (ran {:?})",
                    self.name,
                    if wanted { "enabled" } else { "disabled" },
                    ran
                );
                self.observed_enabled = Some(wanted);
                if wanted {
                    self.system_clock.set_blocked(true);
                    self.have_blocked_sys = true;
                } else if self.have_blocked_sys {
                    self.system_clock.set_blocked(false);
                    self.have_blocked_sys = false;
                }
            }
            Err(Errno::EAGAIN) => {
                debug!("crny {}: clock-control change rate-limited", self.name);
            }
            Err(e) => {
                warn!("crny {}: clock-control helper failed: {}", self.name, e);
            }
        }
    }
}

/// How many peers agree with the selected peer's offset. A daemon whose
/// reference is corroborated by its other sources scores higher than one
/// following a lone voice.
fn cluster_score(peers: &[PeerRecord], selected_idx: i32) -> i32 {
    if selected_idx < 0 {
        return 0;
    }
    let Some(sel) = peers.get(selected_idx as usize) else {
        return 0;
    };
    peers
        .iter()
        .filter(|p| !p.self_source)
        .filter(|p| (p.offset - sel.offset).abs() <= CLUSTER_TOLERANCE_SECS)
        .count() as i32
}

impl ModuleCore for CrnyModule {
    fn tick_interval(&self) -> Duration {
        LOOP_TICK
    }

    fn on_run(&mut self) {
        self.derive_constraints();
        let now = Instant::now();
        self.next_fsm_tick = now + FSM_TICK;
        self.next_poll = now + Duration::from_secs(self.cfg.effective_poll_secs());
        let acts = self.fsm.on_run();
        self.exec(acts);
    }

    fn tick(&mut self) {
        // TRAFFIC: anything readable on the control socket.
        self.drain_socket();

        // REPLY_TIMEOUT: synthesised when a reply is overdue, or when an
        // in-progress connect never resolved.
        if let Some(pending) = &self.pending {
            if Instant::now() >= pending.deadline && self.fsm.state().expects_reply() {
                debug!("crny {}: reply timeout", self.name);
                self.pending = None;
                let acts = self.fsm.on_reply_timeout();
                self.exec(acts);
            }
        }
        if let Some(deadline) = self.connect_deadline {
            if self.fsm.state() != QueryState::ConnectWait {
                self.connect_deadline = None;
            } else if Instant::now() >= deadline {
                debug!("crny {}: connect timed out", self.name);
                self.connect_deadline = None;
                let acts = self.fsm.on_reply_timeout();
                self.exec(acts);
            }
        }

        // TICK: the 250 ms FSM cadence with the poll-interval gate.
        let now = Instant::now();
        if now >= self.next_fsm_tick {
            self.next_fsm_tick = now + FSM_TICK;
            let poll_due = now >= self.next_poll;
            if poll_due {
                self.next_poll = now + Duration::from_secs(self.cfg.effective_poll_secs());
            }
            let acts = self.fsm.on_tick(poll_due);
            self.exec(acts);
        }
    }

    fn status(&self) -> InstanceStatus {
        self.status.clone()
    }

    fn on_control(&mut self, old: CtrlFlags, new: CtrlFlags) {
        self.ctrl_flags = new;
        if self.ctrl_flags.contains(CtrlFlags::CLOCK_CTRL) && !self.ctl.has_script() {
            // Without a helper the instance can neither acquire nor cede the
            // system clock; the grant is meaningless and is dropped.
            info!(
                "crny {}: no control script, clock-control grant cleared",
                self.name
            );
            self.ctrl_flags.remove(CtrlFlags::CLOCK_CTRL);
        }
        if (old ^ new).contains(CtrlFlags::CLOCK_CTRL) {
            self.check_clock_control();
        }
    }

    fn on_step_clock(&mut self) {
        // Offsets computed against the pre-step clock cannot be trusted
        // until the upstream daemon has repolled its peers.
        info!("crny {}: clock stepped, marking offsets unsafe", self.name);
        self.offset_unsafe = true;
        self.offset_id.valid = false;
    }

    fn on_save_state(&mut self) {
        let selected_peer = if self.selected_peer_idx >= 0 {
            self.peers
                .get(self.selected_peer_idx as usize)
                .map(|p| p.addr.to_string())
        } else {
            None
        };
        let extra = StateExtra {
            selected_peer,
            num_peers: self.peers.len(),
            num_candidates: self
                .peers
                .iter()
                .filter(|p| p.candidate || p.shortlist)
                .count(),
            in_sync: self.status.state == SyncState::Slave,
        };
        if let Err(e) = save_instance_state(
            &self.state_dir,
            &self.name,
            &self.status,
            self.ctrl_flags,
            &extra,
        ) {
            warn!("crny {}: saving state failed: {}", self.name, e);
        }
    }

    fn on_log_stats(&mut self, _at: SystemTime) {
        info!(
            "crny {}: state={} offset={}ns peers={} selected={}",
            self.name,
            self.status.state,
            self.status.offset_from_master_ns,
            self.peers.len(),
            self.selected_peer_idx
        );
    }

    fn on_stats_end_period(&mut self, _at: SystemTime) {}

    fn write_topology(&self) -> String {
        let mut out = format!("crny instance {}\nstate {}\n", self.name, self.status.state);
        for (i, p) in self.peers.iter().enumerate() {
            out.push_str(&format!(
                "peer {} addr={} sel={} short={} cand={} self={} stratum={} offset={:.9}\n",
                i, p.addr, p.selected, p.shortlist, p.candidate, p.self_source, p.stratum, p.offset
            ));
        }
        out
    }

    fn on_shutdown(&mut self) {
        // Restore whatever control arrangement chrony had when we saved it.
        if self.arbiter.saved() {
            let observed = self.ctl.probe_enabled().unwrap_or(false);
            self.close_socket();
            match self
                .arbiter
                .invoke(self.ctl.as_mut(), ClockCtrlOp::Restore, observed, Instant::now())
            {
                Ok(ran) => info!("crny {}: clock control restored ({:?})", self.name, ran),
                Err(e) => warn!("crny {}: clock-control restore failed: {}", self.name, e),
            }
        }
        if self.have_blocked_sys {
            self.system_clock.set_blocked(false);
            self.have_blocked_sys = false;
        }
        self.close_socket();
    }
}

// ============================================================================
// TESTS
// ============================================================================
