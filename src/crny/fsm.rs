//! The chrony adapter's polling state machine.
//!
//! Every transition is a pure function from (state, event, parsed inputs) to
//! (state', actions). The adapter task owns the socket and timers and
//! executes the returned actions, feeding outcomes back in. This keeps the
//! whole scan cycle testable without a daemon on the other end.

use crate::crny::proto::{
    NtpDatum, PeerAddr, Query, SourceDatum, TrackingInfo, NTP_MODE_SERVER, SD_STATE_CANDIDATE,
    SD_STATE_SELECTED,
};
use crate::error::ErrorKind;
use crate::instance::SyncState;
use log::{debug, warn};

/// Peer records retained per scan; anything beyond is dropped with a
/// log-once warning.
pub const MAX_PEERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    SleepDisconnected,
    SleepConnected,
    Connect,
    ConnectWait,
    SysInfo,
    SourceCount,
    SourceDatum,
    NtpDatum,
}

impl QueryState {
    /// States in which a reply is outstanding.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            QueryState::ConnectWait
                | QueryState::SysInfo
                | QueryState::SourceCount
                | QueryState::SourceDatum
                | QueryState::NtpDatum
        )
    }
}

/// One reconstructed peer of the upstream daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub addr: PeerAddr,
    pub selected: bool,
    pub shortlist: bool,
    pub candidate: bool,
    pub self_source: bool,
    pub stratum: u16,
    pub pkts_sent: u32,
    pub pkts_received: u32,
    /// Seconds, signed: upstream daemon's view of (peer − daemon).
    pub offset: f64,
    pub root_dispersion: f64,
}

/// Fingerprint that changes iff the upstream daemon recalculated an offset.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetId {
    pub addr: PeerAddr,
    pub pkts_received: u32,
    pub valid: bool,
}

impl Default for OffsetId {
    fn default() -> Self {
        OffsetId {
            addr: PeerAddr::Unspec,
            pkts_received: 0,
            valid: false,
        }
    }
}

/// Side-effect requests returned by transitions.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Create the local socket and connect to the daemon path; the driver
    /// reports back through `on_connect_result`.
    Connect,
    /// Send a query; failure is reported through `on_conn_lost`.
    Issue(Query),
    /// Close the socket and unlink the local path.
    Close,
    /// A full scan completed; publish the derived state.
    PublishScan(ScanResult),
    /// The daemon is unreachable or misbehaving; publish the state implied
    /// by the error kind without touching offset-unsafe.
    PublishError(ErrorKind),
}

/// Output of the finish-scan derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub state: SyncState,
    /// Selected peer's offset in seconds; 0 when no reference.
    pub offset: f64,
    pub stratum: u16,
    pub root_dispersion: f64,
    pub selected_peer_idx: i32,
    pub peers: Vec<PeerRecord>,
    /// The scan observed a recomputed offset while offsets were unsafe.
    pub clear_offset_unsafe: bool,
    /// Updated fingerprint, present iff a selected peer with a usable
    /// address was seen.
    pub new_offset_id: Option<OffsetId>,
}

/// Map an error kind onto the published sync state (derivation rules 1–3).
pub fn state_for_error(kind: ErrorKind) -> SyncState {
    match kind {
        ErrorKind::NotRunning => SyncState::Disabled,
        ErrorKind::TryAgain => SyncState::Listening,
        _ => SyncState::Faulty,
    }
}

/// Parsed reply payloads the driver feeds into `on_traffic`.
#[derive(Debug)]
pub enum ReplyPayload {
    Tracking(TrackingInfo),
    NumSources(u32),
    SourceDatum(SourceDatum),
    NtpDatum(NtpDatum),
}

pub struct Fsm {
    state: QueryState,
    tracking: Option<TrackingInfo>,
    num_sources: u32,
    index: u32,
    pending_source: Option<SourceDatum>,
    peers: Vec<PeerRecord>,
    cap_warned: bool,
}

impl Fsm {
    pub fn new() -> Self {
        Fsm {
            state: QueryState::SleepDisconnected,
            tracking: None,
            num_sources: 0,
            index: 0,
            pending_source: None,
            peers: Vec::new(),
            cap_warned: false,
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn tracking(&self) -> Option<&TrackingInfo> {
        self.tracking.as_ref()
    }

    fn set_state(&mut self, next: QueryState) {
        if next != self.state {
            debug!("crny fsm: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn begin_scan(&mut self) -> Vec<Action> {
        self.tracking = None;
        self.num_sources = 0;
        self.index = 0;
        self.pending_source = None;
        self.peers.clear();
        self.set_state(QueryState::SysInfo);
        vec![Action::Issue(Query::Tracking)]
    }

    /// `RUN` from the engine: start polling immediately.
    pub fn on_run(&mut self) -> Vec<Action> {
        match self.state {
            QueryState::SleepDisconnected => {
                self.set_state(QueryState::Connect);
                vec![Action::Connect]
            }
            _ => vec![],
        }
    }

    /// Periodic tick. `poll_due` is the configured poll-interval gate.
    pub fn on_tick(&mut self, poll_due: bool) -> Vec<Action> {
        if !poll_due {
            return vec![];
        }
        match self.state {
            QueryState::SleepDisconnected => {
                self.set_state(QueryState::Connect);
                vec![Action::Connect]
            }
            QueryState::SleepConnected => self.begin_scan(),
            _ => vec![],
        }
    }

    /// Outcome of the `Connect` action. `Ok(true)` means connected at once,
    /// `Ok(false)` means in progress (the socket will signal readiness).
    pub fn on_connect_result(&mut self, result: Result<bool, ErrorKind>) -> Vec<Action> {
        debug_assert_eq!(self.state, QueryState::Connect);
        match result {
            Ok(true) => self.begin_scan(),
            Ok(false) => {
                self.set_state(QueryState::ConnectWait);
                vec![]
            }
            Err(kind) => {
                self.set_state(QueryState::SleepDisconnected);
                vec![Action::Close, Action::PublishError(kind)]
            }
        }
    }

    /// Traffic while waiting for an in-progress connect: the driver has
    /// checked SO_ERROR.
    pub fn on_connect_ready(&mut self, ok: bool) -> Vec<Action> {
        debug_assert_eq!(self.state, QueryState::ConnectWait);
        if ok {
            self.begin_scan()
        } else {
            self.disconnect(ErrorKind::NotRunning)
        }
    }

    /// The socket died under a queried state (send failure, recv error,
    /// protocol mismatch escalated by the driver).
    pub fn on_conn_lost(&mut self, kind: ErrorKind) -> Vec<Action> {
        self.disconnect(kind)
    }

    fn disconnect(&mut self, kind: ErrorKind) -> Vec<Action> {
        self.set_state(QueryState::SleepDisconnected);
        vec![Action::Close, Action::PublishError(kind)]
    }

    /// The 1 s reply deadline passed while a reply was outstanding. The
    /// connection itself is kept; the next poll restarts from SYS_INFO.
    pub fn on_reply_timeout(&mut self) -> Vec<Action> {
        if self.state.expects_reply() {
            debug!("crny fsm: reply timeout in {:?}", self.state);
            self.set_state(QueryState::SleepConnected);
        }
        vec![]
    }

    /// A mismatched or malformed reply: abandon the outstanding request and
    /// restart the scan on the next poll, keeping the connection.
    pub fn on_bad_reply(&mut self) -> Vec<Action> {
        if self.state.expects_reply() {
            self.set_state(QueryState::SleepConnected);
        }
        vec![]
    }

    /// The driver closed the socket out of band (clock-control handover);
    /// the next due poll re-opens it.
    pub fn on_socket_closed(&mut self) {
        self.set_state(QueryState::SleepDisconnected);
    }

    /// A validated reply arrived. `offset_unsafe` and `offset_id` belong to
    /// the adapter; they parameterise the finish-scan derivation.
    pub fn on_traffic(
        &mut self,
        payload: ReplyPayload,
        offset_unsafe: bool,
        offset_id: &OffsetId,
    ) -> Vec<Action> {
        match (self.state, payload) {
            (QueryState::SysInfo, ReplyPayload::Tracking(t)) => {
                self.tracking = Some(t);
                self.set_state(QueryState::SourceCount);
                vec![Action::Issue(Query::NumSources)]
            }
            (QueryState::SourceCount, ReplyPayload::NumSources(n)) => {
                if n == 0 {
                    return self.finish(offset_unsafe, offset_id);
                }
                if n as usize > MAX_PEERS {
                    if !self.cap_warned {
                        warn!(
                            "upstream daemon reports {} sources, tracking only {}",
                            n, MAX_PEERS
                        );
                        self.cap_warned = true;
                    }
                    self.num_sources = MAX_PEERS as u32;
                } else {
                    self.num_sources = n;
                }
                self.index = 0;
                self.set_state(QueryState::SourceDatum);
                vec![Action::Issue(Query::SourceData(0))]
            }
            (QueryState::SourceDatum, ReplyPayload::SourceDatum(d)) => {
                if d.is_self() {
                    // Reference sources are the daemon itself; record them
                    // but never query ntp-data for them.
                    self.peers.push(peer_from_self_source(&d));
                    self.advance(offset_unsafe, offset_id)
                } else {
                    self.pending_source = Some(d.clone());
                    self.set_state(QueryState::NtpDatum);
                    vec![Action::Issue(Query::NtpData(d.addr))]
                }
            }
            (QueryState::NtpDatum, ReplyPayload::NtpDatum(nd)) => {
                match self.pending_source.take() {
                    Some(sd) => self.peers.push(peer_from_datum(&sd, &nd)),
                    None => debug!("crny fsm: ntp datum without source datum"),
                }
                self.advance(offset_unsafe, offset_id)
            }
            (state, payload) => {
                debug!("crny fsm: unexpected reply {:?} in {:?}", payload, state);
                self.disconnect(ErrorKind::Protocol)
            }
        }
    }

    fn advance(&mut self, offset_unsafe: bool, offset_id: &OffsetId) -> Vec<Action> {
        if self.index + 1 >= self.num_sources {
            return self.finish(offset_unsafe, offset_id);
        }
        self.index += 1;
        self.set_state(QueryState::SourceDatum);
        vec![Action::Issue(Query::SourceData(self.index))]
    }

    /// Apply the state derivation rule to the assembled scan and go back to
    /// sleep on the open connection.
    fn finish(&mut self, offset_unsafe: bool, offset_id: &OffsetId) -> Vec<Action> {
        let result = derive_scan(&self.peers, offset_unsafe, offset_id);
        self.set_state(QueryState::SleepConnected);
        vec![Action::PublishScan(result)]
    }
}

fn peer_from_self_source(sd: &SourceDatum) -> PeerRecord {
    PeerRecord {
        addr: sd.addr,
        selected: false,
        shortlist: false,
        candidate: false,
        self_source: true,
        stratum: sd.stratum,
        pkts_sent: 0,
        pkts_received: 0,
        offset: 0.0,
        root_dispersion: 0.0,
    }
}

fn peer_from_datum(sd: &SourceDatum, nd: &NtpDatum) -> PeerRecord {
    PeerRecord {
        addr: sd.addr,
        selected: sd.state == SD_STATE_SELECTED,
        shortlist: sd.state == SD_STATE_CANDIDATE,
        candidate: nd.mode == NTP_MODE_SERVER,
        self_source: false,
        stratum: nd.stratum as u16,
        pkts_sent: nd.total_tx_count,
        pkts_received: nd.total_rx_count,
        offset: nd.offset,
        root_dispersion: nd.root_dispersion,
    }
}

/// State derivation rules 4–6 plus the offset-id fingerprint update.
fn derive_scan(peers: &[PeerRecord], offset_unsafe: bool, offset_id: &OffsetId) -> ScanResult {
    let selected: Vec<usize> = peers
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.self_source && p.selected)
        .map(|(i, _)| i)
        .collect();
    if selected.len() > 1 {
        warn!(
            "upstream daemon reports {} selected peers, taking the first",
            selected.len()
        );
    }
    let selected_idx = selected.first().copied();

    // Fingerprint update and the offset-unsafe recovery rule: a changed id
    // while offsets were unsafe and the stored id no longer vouches for them
    // means the daemon recomputed, so offsets are trustworthy again.
    let mut clear_offset_unsafe = false;
    let mut new_offset_id = None;
    if let Some(i) = selected_idx {
        let p = &peers[i];
        if !p.addr.is_unspec() {
            let changed = p.addr != offset_id.addr || p.pkts_received != offset_id.pkts_received;
            if changed && offset_unsafe && !offset_id.valid {
                clear_offset_unsafe = true;
            }
            new_offset_id = Some(OffsetId {
                addr: p.addr,
                pkts_received: p.pkts_received,
                valid: true,
            });
        }
    }

    let unsafe_now = offset_unsafe && !clear_offset_unsafe;

    let (state, offset, stratum, root_dispersion, selected_peer_idx) = match selected_idx {
        Some(i) if !unsafe_now => {
            let p = &peers[i];
            (SyncState::Slave, p.offset, p.stratum, p.root_dispersion, i as i32)
        }
        _ => {
            let any_candidate = peers
                .iter()
                .any(|p| !p.self_source && (p.candidate || p.shortlist));
            let state = if any_candidate {
                SyncState::Selection
            } else {
                SyncState::Listening
            };
            (state, 0.0, 0, 0.0, -1)
        }
    };

    ScanResult {
        state,
        offset,
        stratum,
        root_dispersion,
        selected_peer_idx,
        peers: peers.to_vec(),
        clear_offset_unsafe,
        new_offset_id,
    }
}

// ============================================================================
// TESTS
// ============================================================================
