//! Clock-feed service: periodically samples (clock − system clock) for every
//! tracked hardware clock, writes each sample into a per-clock lock-free ring
//! and serves consistent, optionally freshness-constrained snapshots to
//! concurrent readers with overrun detection.
//!
//! The rings are the only shared-mutable data in the daemon. Each has a
//! single writer (the feed task) and many readers (servo code); correctness
//! rests on publishing `write_counter` last and on readers re-reading it to
//! detect overrun.

use crate::clock::{now_monotonic_ns, now_realtime_ns, Clock, ClockId};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::instance::{EngineMsg, INBOX_DEPTH};
use log::{debug, info, warn};
use nix::errno::Errno;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Ring depth. A reader that falls more than `RING_DEPTH - 1` samples behind
/// the writer observes an overrun.
pub const RING_DEPTH: usize = 16;

/// One comparison record as read out of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Monotonically increasing publication counter.
    pub seq: u64,
    /// Monotonic timestamp captured just before the comparison.
    pub mono_ns: i64,
    /// System-clock timestamp captured alongside.
    pub system_ns: i64,
    /// The clock's reading, `system + (clock − system)`; zeroed iff rc ≠ 0.
    pub snapshot_ns: i64,
    /// 0 on success, else an errno value.
    pub rc: i32,
}

impl Sample {
    /// (clock − system) for this sample.
    fn diff_ns(&self) -> i64 {
        self.snapshot_ns - self.system_ns
    }
}

#[derive(Default)]
struct Slot {
    seq: AtomicU64,
    mono_ns: AtomicI64,
    system_ns: AtomicI64,
    snapshot_ns: AtomicI64,
    rc: AtomicI32,
}

/// Single-writer multi-reader sample ring. Field stores are individually
/// atomic; a torn read across fields is detected by the counter re-read.
pub struct Ring {
    slots: [Slot; RING_DEPTH],
    write_counter: AtomicU64,
}

impl Ring {
    fn new() -> Self {
        Ring {
            slots: Default::default(),
            write_counter: AtomicU64::new(0),
        }
    }

    /// Writer side. Fields first, counter increment last (release).
    fn publish(&self, mono_ns: i64, system_ns: i64, snapshot_ns: i64, rc: i32) {
        let w = self.write_counter.load(Ordering::Relaxed);
        let slot = &self.slots[(w % RING_DEPTH as u64) as usize];
        slot.seq.store(w, Ordering::Relaxed);
        slot.mono_ns.store(mono_ns, Ordering::Relaxed);
        slot.system_ns.store(system_ns, Ordering::Relaxed);
        slot.snapshot_ns.store(snapshot_ns, Ordering::Relaxed);
        slot.rc.store(rc, Ordering::Relaxed);
        self.write_counter.store(w + 1, Ordering::Release);
    }

    /// First half of a read: the newest sample and the counter value that
    /// located it. `TryAgain` before the first write.
    fn read_begin(&self) -> SyncResult<(Sample, u64)> {
        let w1 = self.write_counter.load(Ordering::Acquire);
        if w1 == 0 {
            return Err(SyncError::new(ErrorKind::TryAgain));
        }
        let slot = &self.slots[((w1 - 1) % RING_DEPTH as u64) as usize];
        let sample = Sample {
            seq: slot.seq.load(Ordering::Relaxed),
            mono_ns: slot.mono_ns.load(Ordering::Relaxed),
            system_ns: slot.system_ns.load(Ordering::Relaxed),
            snapshot_ns: slot.snapshot_ns.load(Ordering::Relaxed),
            rc: slot.rc.load(Ordering::Relaxed),
        };
        if sample.rc != 0 {
            return Err(SyncError::new(ErrorKind::from_errno(Errno::from_i32(
                sample.rc,
            ))));
        }
        Ok((sample, w1))
    }

    /// Second half: re-read the counter; if the writer advanced far enough to
    /// have begun overwriting the slot read at `w1`, the read is void.
    fn read_commit(&self, w1: u64) -> SyncResult<()> {
        fence(Ordering::Acquire);
        let w2 = self.write_counter.load(Ordering::Relaxed);
        if w2 >= w1 + RING_DEPTH as u64 - 1 {
            return Err(SyncError::new(ErrorKind::NoData));
        }
        Ok(())
    }

    /// Reader side: the newest sample, or `TryAgain` before the first write,
    /// or `NoData` when the writer lapped us mid-read.
    fn read_latest(&self) -> SyncResult<(Sample, u64)> {
        let (sample, w1) = self.read_begin()?;
        self.read_commit(w1)?;
        Ok((sample, w1))
    }

    pub fn write_counter(&self) -> u64 {
        self.write_counter.load(Ordering::Acquire)
    }
}

/// One tracked clock inside the feed service.
pub struct FeedSource {
    clock: Arc<Clock>,
    ring: Ring,
    active: AtomicBool,
    subscribers: AtomicUsize,
    poll_log2: i32,
}

impl FeedSource {
    fn new(clock: Arc<Clock>, poll_log2: i32) -> Arc<Self> {
        Arc::new(FeedSource {
            clock,
            ring: Ring::new(),
            active: AtomicBool::new(true),
            subscribers: AtomicUsize::new(0),
            poll_log2,
        })
    }

    fn sample_once(&self) {
        let mono = now_monotonic_ns();
        let system = now_realtime_ns();
        match self.clock.compare_to_system_ns() {
            Ok(diff) => self.ring.publish(mono, system, system + diff, 0),
            Err(e) => {
                self.ring.publish(mono, system, 0, e.kind().to_errno() as i32);
                debug!("feed: sampling {} failed: {}", self.clock.name(), e);
            }
        }
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// A reader handle onto one feed source.
pub struct Subscription {
    source: Arc<FeedSource>,
    read_counter: u64,
    min_counter: u64,
    pub max_age: Option<Duration>,
    pub max_age_diff: Option<Duration>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("read_counter", &self.read_counter)
            .field("min_counter", &self.min_counter)
            .field("max_age", &self.max_age)
            .field("max_age_diff", &self.max_age_diff)
            .finish()
    }
}

impl Subscription {
    fn new(source: Arc<FeedSource>) -> Self {
        source.subscribers.fetch_add(1, Ordering::AcqRel);
        Subscription {
            source,
            read_counter: 0,
            min_counter: 0,
            max_age: None,
            max_age_diff: None,
        }
    }

    /// Require the next `compare` to observe a sample newer than anything
    /// already read through this handle.
    pub fn require_fresh(&mut self) {
        self.min_counter = self.read_counter + 1;
    }

    pub fn clock_id(&self) -> ClockId {
        self.source.clock.id()
    }

    /// Read the newest sample, applying the full freshness/liveness ladder.
    fn read_checked(&mut self, now_mono_ns: i64) -> SyncResult<Sample> {
        let (sample, w1) = self.source.ring.read_latest()?;
        if !self.source.active.load(Ordering::Acquire) {
            return Err(SyncError::new(ErrorKind::Dead));
        }
        if !self.source.clock.is_active() {
            return Err(SyncError::new(ErrorKind::NoEntry));
        }
        if self.min_counter > w1 {
            return Err(SyncError::new(ErrorKind::Stale));
        }
        if let Some(max_age) = self.max_age {
            let age = now_mono_ns.saturating_sub(sample.mono_ns);
            if age > max_age.as_nanos() as i64 {
                return Err(SyncError::new(ErrorKind::Stale));
            }
        }
        self.read_counter = w1;
        Ok(sample)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.source.subscribers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Result of a feed comparison: (clock1 − clock2) and the sampling instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedDiff {
    pub diff_ns: i64,
    pub mono_ns: i64,
}

/// Compare two subscribed clocks; `None` means the system clock. The result
/// is composed only from samples that survive the staleness and overrun
/// checks on both sides.
pub fn compare(
    sub1: Option<&mut Subscription>,
    sub2: Option<&mut Subscription>,
) -> SyncResult<FeedDiff> {
    let now_mono = now_monotonic_ns();
    let max_age_diff = [&sub1, &sub2]
        .iter()
        .filter_map(|s| s.as_ref().and_then(|s| s.max_age_diff))
        .min();

    let s1 = match sub1 {
        Some(sub) => Some(sub.read_checked(now_mono)?),
        None => None,
    };
    let s2 = match sub2 {
        Some(sub) => Some(sub.read_checked(now_mono)?),
        None => None,
    };

    if let (Some(a), Some(b), Some(bound)) = (&s1, &s2, max_age_diff) {
        let skew = (a.mono_ns - b.mono_ns).unsigned_abs();
        if skew > bound.as_nanos() as u64 {
            return Err(SyncError::new(ErrorKind::Stale));
        }
    }

    let (diff1, mono1) = match &s1 {
        Some(s) => (s.diff_ns(), s.mono_ns),
        None => (0, now_mono),
    };
    let (diff2, mono2) = match &s2 {
        Some(s) => (s.diff_ns(), s.mono_ns),
        None => (0, now_mono),
    };

    Ok(FeedDiff {
        diff_ns: diff1 - diff2,
        mono_ns: mono1.min(mono2),
    })
}

// ============================================================================
// SERVICE TASK
// ============================================================================

pub enum FeedMsg {
    AddClock {
        clock: Arc<Clock>,
        poll_log2: i32,
        reply: Sender<SyncResult<()>>,
    },
    Subscribe {
        clock_id: ClockId,
        reply: Sender<SyncResult<Subscription>>,
    },
    RemoveClock {
        clock_id: ClockId,
    },
    Shutdown,
}

/// Process-lifetime handle onto the clock-feed service, passed explicitly to
/// whoever needs subscriptions.
#[derive(Clone)]
pub struct FeedHandle {
    tx: SyncSender<FeedMsg>,
}

impl FeedHandle {
    pub fn add_clock(&self, clock: Arc<Clock>, poll_log2: i32) -> SyncResult<()> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(FeedMsg::AddClock {
                clock,
                poll_log2,
                reply,
            })
            .map_err(|_| SyncError::new(ErrorKind::Dead))?;
        rx.recv().map_err(|_| SyncError::new(ErrorKind::Dead))?
    }

    pub fn subscribe(&self, clock_id: ClockId) -> SyncResult<Subscription> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(FeedMsg::Subscribe { clock_id, reply })
            .map_err(|_| SyncError::new(ErrorKind::Dead))?;
        rx.recv().map_err(|_| SyncError::new(ErrorKind::Dead))?
    }

    pub fn remove_clock(&self, clock_id: ClockId) {
        let _ = self.tx.send(FeedMsg::RemoveClock { clock_id });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(FeedMsg::Shutdown);
    }
}

struct ClockFeed {
    inbox: Receiver<FeedMsg>,
    engine_tx: SyncSender<EngineMsg>,
    base_log2: i32,
    sources: Vec<Arc<FeedSource>>,
    inactive: Vec<Arc<FeedSource>>,
    cycles: u64,
}

impl ClockFeed {
    fn run(mut self) {
        let period = Duration::from_secs(1 << self.base_log2.max(0) as u32);
        let mut next_sample = Instant::now() + period;
        info!("clockfeed: sampling every {:?}", period);

        loop {
            let timeout = next_sample.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(timeout) {
                Ok(FeedMsg::AddClock {
                    clock,
                    poll_log2,
                    reply,
                }) => {
                    let _ = reply.send(self.add_clock(clock, poll_log2));
                }
                Ok(FeedMsg::Subscribe { clock_id, reply }) => {
                    let _ = reply.send(self.subscribe(clock_id));
                }
                Ok(FeedMsg::RemoveClock { clock_id }) => self.remove_clock(clock_id),
                Ok(FeedMsg::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.drain();
                    return;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.sample_pass();
                    next_sample += period;
                }
            }
        }
    }

    fn add_clock(&mut self, clock: Arc<Clock>, poll_log2: i32) -> SyncResult<()> {
        if self.sources.iter().any(|s| s.clock.id() == clock.id()) {
            return Err(SyncError::with(
                ErrorKind::TryAgain,
                format!("clock {} already tracked", clock.id()),
            ));
        }
        info!("clockfeed: tracking {} ({})", clock.name(), clock.id());
        self.sources.push(FeedSource::new(clock, poll_log2));
        Ok(())
    }

    fn subscribe(&mut self, clock_id: ClockId) -> SyncResult<Subscription> {
        match self.sources.iter().find(|s| s.clock.id() == clock_id) {
            Some(src) => Ok(Subscription::new(src.clone())),
            None => Err(SyncError::with(
                ErrorKind::NoEntry,
                format!("no feed source for clock {}", clock_id),
            )),
        }
    }

    fn remove_clock(&mut self, clock_id: ClockId) {
        let Some(pos) = self.sources.iter().position(|s| s.clock.id() == clock_id) else {
            return;
        };
        let src = self.sources.remove(pos);
        src.active.store(false, Ordering::Release);
        info!("clockfeed: {} moved to inactive", src.clock.name());
        self.inactive.push(src);
        self.reap();
    }

    /// Free inactive sources once their last subscriber is gone.
    fn reap(&mut self) {
        self.inactive.retain(|src| {
            let live = src.subscribers.load(Ordering::Acquire) > 0;
            if !live {
                debug!("clockfeed: reaping {}", src.clock.name());
            }
            live
        });
    }

    fn sample_pass(&mut self) {
        for src in &self.sources {
            let decim: u64 = 1 << (src.poll_log2 - self.base_log2).max(0) as u32;
            if self.cycles % decim == 0 {
                src.sample_once();
            }
        }
        self.cycles = self.cycles.wrapping_add(1);
        self.reap();

        if let Err(TrySendError::Full(_)) = self.engine_tx.try_send(EngineMsg::SyncEvent) {
            warn!("clockfeed: engine inbox full, dropping sync event");
        }
    }

    fn drain(&mut self) {
        for src in self.sources.drain(..) {
            src.active.store(false, Ordering::Release);
            self.inactive.push(src);
        }
        self.reap();
        info!(
            "clockfeed: exiting ({} sources awaiting subscribers)",
            self.inactive.len()
        );
    }
}

pub fn spawn_feed(base_log2: i32, engine_tx: SyncSender<EngineMsg>) -> (FeedHandle, JoinHandle<()>) {
    let (tx, inbox) = mpsc::sync_channel(INBOX_DEPTH);
    let feed = ClockFeed {
        inbox,
        engine_tx,
        base_log2,
        sources: Vec::new(),
        inactive: Vec::new(),
        cycles: 0,
    };
    let join = std::thread::Builder::new()
        .name("clockfeed".to_string())
        .spawn(move || feed.run())
        .expect("spawning clockfeed task");
    (FeedHandle { tx }, join)
}

// ============================================================================
// TESTS
// ============================================================================
