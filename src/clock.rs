//! Clock abstraction: a uniform handle for the system clock and each NIC
//! hardware clock (PHC).
//!
//! A `Clock` pairs a stable EUI-64-like identity with a `ClockDevice` that
//! performs the actual kernel operations (read, step, slew, compare). The
//! mutable state bits (`blocked`, `read_only`, `active`) are atomics so that
//! servo tasks can consult them without messaging.

use crate::error::{ErrorKind, SyncError, SyncResult};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::fmt;
use std::fs::File;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stable 8-byte hardware identifier, EUI-64-like: the interface MAC with a
/// configurable 2-byte pad inserted in the middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockId(pub [u8; 8]);

impl ClockId {
    pub fn from_mac(mac: [u8; 6], suffix: [u8; 2]) -> Self {
        ClockId([
            mac[0], mac[1], mac[2], suffix[0], suffix[1], mac[3], mac[4], mac[5],
        ])
    }

    /// Identity used for the system clock, which has no MAC of its own.
    pub fn system() -> Self {
        ClockId([0; 8])
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRole {
    System,
    Phc,
}

/// Kernel-facing clock operations. Mocked in tests.
#[cfg_attr(test, mockall::automock)]
pub trait ClockDevice: Send + Sync {
    /// Current reading of this clock in nanoseconds since the epoch.
    fn now_ns(&self) -> SyncResult<i64>;

    /// Step the clock by the signed offset.
    fn step_ns(&self, offset_ns: i64) -> SyncResult<()>;

    /// Slew the clock frequency by the given ppm adjustment.
    fn set_freq_ppm(&self, ppm: f64) -> SyncResult<()>;

    /// (this clock − system clock) in nanoseconds.
    fn diff_to_system_ns(&self) -> SyncResult<i64>;
}

pub struct Clock {
    id: ClockId,
    name: String,
    role: ClockRole,
    blocked: AtomicBool,
    read_only: AtomicBool,
    active: AtomicBool,
    dev: Box<dyn ClockDevice>,
}

impl Clock {
    pub fn new(id: ClockId, name: impl Into<String>, role: ClockRole, dev: Box<dyn ClockDevice>) -> Self {
        Clock {
            id,
            name: name.into(),
            role,
            blocked: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            active: AtomicBool::new(true),
            dev,
        }
    }

    pub fn id(&self) -> ClockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ClockRole {
        self.role
    }

    pub fn is_system(&self) -> bool {
        self.role == ClockRole::System
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Refuse frequency and step adjustments from other writers. Set by the
    /// sync-module instance that discovered an external daemon owns this
    /// clock (typically the chrony adapter).
    pub fn set_blocked(&self, blocked: bool) {
        let was = self.blocked.swap(blocked, Ordering::AcqRel);
        if was != blocked {
            info!(
                "clock {}: {}",
                self.name,
                if blocked { "blocked" } else { "unblocked" }
            );
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, ro: bool) {
        self.read_only.store(ro, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn now_ns(&self) -> SyncResult<i64> {
        self.dev.now_ns()
    }

    /// (this clock − system clock) in ns. Zero for the system clock itself.
    pub fn compare_to_system_ns(&self) -> SyncResult<i64> {
        if self.is_system() {
            return Ok(0);
        }
        self.dev.diff_to_system_ns()
    }

    pub fn step_ns(&self, offset_ns: i64) -> SyncResult<()> {
        if self.is_blocked() || self.is_read_only() {
            return Err(SyncError::with(
                ErrorKind::TryAgain,
                format!("clock {} is not writable", self.name),
            ));
        }
        debug!("clock {}: step {:+}ns", self.name, offset_ns);
        self.dev.step_ns(offset_ns)
    }

    pub fn slew_ppm(&self, ppm: f64) -> SyncResult<()> {
        if self.is_blocked() || self.is_read_only() {
            return Err(SyncError::with(
                ErrorKind::TryAgain,
                format!("clock {} is not writable", self.name),
            ));
        }
        self.dev.set_freq_ppm(ppm)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("blocked", &self.is_blocked())
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// SYSTEM CLOCK DEVICE (adjtimex / clock_settime)
// ============================================================================

fn clock_gettime_ns(clockid: libc::clockid_t) -> SyncResult<i64> {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(clockid, &mut ts) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

pub fn now_monotonic_ns() -> i64 {
    // CLOCK_MONOTONIC cannot fail for a valid clockid.
    clock_gettime_ns(libc::CLOCK_MONOTONIC).unwrap_or(0)
}

pub fn now_realtime_ns() -> i64 {
    clock_gettime_ns(libc::CLOCK_REALTIME).unwrap_or(0)
}

/// The system realtime clock, disciplined through `adjtimex`. The frequency
/// value found at startup is restored on drop.
pub struct SystemClockDev {
    original_freq: i64,
}

impl SystemClockDev {
    pub fn new() -> Result<Self> {
        let mut tx: libc::timex = unsafe { mem::zeroed() };
        tx.modes = 0; // Query mode

        let ret = unsafe { libc::adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed (are you root?)"));
        }

        Ok(SystemClockDev {
            original_freq: tx.freq,
        })
    }
}

impl ClockDevice for SystemClockDev {
    fn now_ns(&self) -> SyncResult<i64> {
        clock_gettime_ns(libc::CLOCK_REALTIME)
    }

    fn step_ns(&self, offset_ns: i64) -> SyncResult<()> {
        let now = clock_gettime_ns(libc::CLOCK_REALTIME)?;
        let target = now + offset_ns;
        let ts = libc::timespec {
            tv_sec: (target / 1_000_000_000) as libc::time_t,
            tv_nsec: (target % 1_000_000_000) as libc::c_long,
        };
        let ret = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn set_freq_ppm(&self, ppm: f64) -> SyncResult<()> {
        // The kernel takes frequency in 16-bit fixed point ppm.
        let freq_val = (ppm * 65536.0) as i64;
        let mut tx: libc::timex = unsafe { mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY;
        tx.freq = freq_val;

        let ret = unsafe { libc::adjtimex(&mut tx) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn diff_to_system_ns(&self) -> SyncResult<i64> {
        Ok(0)
    }
}

impl Drop for SystemClockDev {
    fn drop(&mut self) {
        let mut tx: libc::timex = unsafe { mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY;
        tx.freq = self.original_freq;
        unsafe { libc::adjtimex(&mut tx) };
    }
}

// ============================================================================
// PHC DEVICE (/dev/ptpN)
// ============================================================================

/// A NIC hardware clock exposed as a POSIX dynamic clock. The open file
/// keeps the clockid valid.
pub struct PhcDev {
    _file: File,
    clockid: libc::clockid_t,
}

impl PhcDev {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        // Dynamic clock id derivation for /dev/ptpN fds.
        let fd = file.as_raw_fd();
        let clockid = ((!(fd as libc::clockid_t)) << 3) | 3;
        Ok(PhcDev {
            _file: file,
            clockid,
        })
    }
}

impl ClockDevice for PhcDev {
    fn now_ns(&self) -> SyncResult<i64> {
        clock_gettime_ns(self.clockid)
    }

    fn step_ns(&self, offset_ns: i64) -> SyncResult<()> {
        let now = clock_gettime_ns(self.clockid)?;
        let target = now + offset_ns;
        let ts = libc::timespec {
            tv_sec: (target / 1_000_000_000) as libc::time_t,
            tv_nsec: (target % 1_000_000_000) as libc::c_long,
        };
        let ret = unsafe { libc::clock_settime(self.clockid, &ts) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn set_freq_ppm(&self, ppm: f64) -> SyncResult<()> {
        let mut tx: libc::timex = unsafe { mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY;
        tx.freq = (ppm * 65536.0) as i64;
        let ret = unsafe { libc::clock_adjtime(self.clockid, &mut tx) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn diff_to_system_ns(&self) -> SyncResult<i64> {
        // Bracket the PHC read between two system reads and use the midpoint,
        // which cancels the read latency to first order.
        let sys1 = clock_gettime_ns(libc::CLOCK_REALTIME)?;
        let phc = clock_gettime_ns(self.clockid)?;
        let sys2 = clock_gettime_ns(libc::CLOCK_REALTIME)?;
        Ok(phc - (sys1 + (sys2 - sys1) / 2))
    }
}

// ============================================================================
// LINK TABLE
// ============================================================================

/// One network interface as delivered by interface discovery.
#[derive(Debug, Clone)]
pub struct Link {
    pub if_name: String,
    pub mac: [u8; 6],
    pub phc_path: Option<PathBuf>,
}

/// The set of usable links on the host. Interface discovery proper is a
/// collaborator; this table is built from `if-addrs` plus sysfs.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    pub links: Vec<Link>,
}

impl LinkTable {
    pub fn discover() -> Self {
        let mut links = Vec::new();
        let ifaces = match if_addrs::get_if_addrs() {
            Ok(v) => v,
            Err(e) => {
                warn!("interface discovery failed: {}", e);
                return LinkTable::default();
            }
        };

        for iface in ifaces {
            if iface.is_loopback() || links.iter().any(|l: &Link| l.if_name == iface.name) {
                continue;
            }
            let mac = match read_mac(&iface.name) {
                Some(m) => m,
                None => continue,
            };
            let phc_path = find_phc(&iface.name);
            links.push(Link {
                if_name: iface.name,
                mac,
                phc_path,
            });
        }
        links
            .iter()
            .for_each(|l| debug!("link {}: mac={:02x?} phc={:?}", l.if_name, l.mac, l.phc_path));
        LinkTable { links }
    }
}

fn read_mac(if_name: &str) -> Option<[u8; 6]> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{}/address", if_name)).ok()?;
    parse_mac(raw.trim())
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() || mac == [0u8; 6] {
        return None;
    }
    Some(mac)
}

fn find_phc(if_name: &str) -> Option<PathBuf> {
    let dir = format!("/sys/class/net/{}/device/ptp", if_name);
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("ptp") {
            return Some(PathBuf::from(format!("/dev/{}", name)));
        }
    }
    None
}

/// Build the clock set for this host: the system clock plus one clock per
/// PHC-capable link. Invariant: exactly one system clock, created first.
pub fn build_clock_table(table: &LinkTable, suffix: [u8; 2]) -> Result<Vec<Arc<Clock>>> {
    let sys_dev = SystemClockDev::new()?;
    let mut clocks = vec![Arc::new(Clock::new(
        ClockId::system(),
        "system",
        ClockRole::System,
        Box::new(sys_dev),
    ))];

    for link in &table.links {
        let Some(phc_path) = &link.phc_path else {
            continue;
        };
        match PhcDev::open(phc_path) {
            Ok(dev) => {
                let id = ClockId::from_mac(link.mac, suffix);
                info!("clock {} ({}) on {}", id, phc_path.display(), link.if_name);
                clocks.push(Arc::new(Clock::new(
                    id,
                    format!("phc-{}", link.if_name),
                    ClockRole::Phc,
                    Box::new(dev),
                )));
            }
            Err(e) => warn!("skipping PHC {} on {}: {}", phc_path.display(), link.if_name, e),
        }
    }
    Ok(clocks)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_id_from_mac() {
        let id = ClockId::from_mac([0x00, 0x0f, 0x53, 0x12, 0x34, 0x56], [0xff, 0xfe]);
        assert_eq!(id.0, [0x00, 0x0f, 0x53, 0xff, 0xfe, 0x12, 0x34, 0x56]);
        assert_eq!(id.to_string(), "00:0f:53:ff:fe:12:34:56");
    }

    #[test]
    fn test_clock_id_suffix_is_configurable() {
        let mac = [0x00, 0x0f, 0x53, 0x12, 0x34, 0x56];
        let a = ClockId::from_mac(mac, [0xff, 0xfe]);
        let b = ClockId::from_mac(mac, [0x00, 0x01]);
        assert_ne!(a, b);
        assert_eq!(b.0[3..5], [0x00, 0x01]);
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("00:0f:53:12:34:56"),
            Some([0x00, 0x0f, 0x53, 0x12, 0x34, 0x56])
        );
        assert_eq!(parse_mac("00:00:00:00:00:00"), None);
        assert_eq!(parse_mac("not-a-mac"), None);
        assert_eq!(parse_mac("00:0f:53:12:34"), None);
    }

    #[test]
    fn test_blocked_clock_refuses_writes() {
        let mut dev = MockClockDevice::new();
        dev.expect_step_ns().never();
        dev.expect_set_freq_ppm().never();

        let clock = Clock::new(ClockId::system(), "system", ClockRole::System, Box::new(dev));
        clock.set_blocked(true);

        assert!(clock.step_ns(1000).is_err());
        assert!(clock.slew_ppm(1.0).is_err());
        assert_eq!(clock.step_ns(1000).unwrap_err().kind(), ErrorKind::TryAgain);
    }

    #[test]
    fn test_system_clock_compares_as_zero() {
        let dev = MockClockDevice::new();
        let clock = Clock::new(ClockId::system(), "system", ClockRole::System, Box::new(dev));
        assert_eq!(clock.compare_to_system_ns().unwrap(), 0);
    }

    #[test]
    fn test_phc_clock_compare_uses_device() {
        let mut dev = MockClockDevice::new();
        dev.expect_diff_to_system_ns().returning(|| Ok(42_000));
        let clock = Clock::new(
            ClockId::from_mac([0, 1, 2, 3, 4, 5], [0xff, 0xfe]),
            "phc-eth0",
            ClockRole::Phc,
            Box::new(dev),
        );
        assert_eq!(clock.compare_to_system_ns().unwrap(), 42_000);
    }
}
