//! Clock-feed service exercised through its task API: subscription
//! freshness, comparisons against live sampling, source removal and the
//! SyncEvent multicast.

use refsyncd::clock::{Clock, ClockDevice, ClockId, ClockRole};
use refsyncd::error::{ErrorKind, SyncResult};
use refsyncd::feed::{compare, spawn_feed};
use refsyncd::instance::EngineMsg;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::time::Duration;

struct FixedDiffDevice {
    diff_ns: i64,
}

impl ClockDevice for FixedDiffDevice {
    fn now_ns(&self) -> SyncResult<i64> {
        Ok(0)
    }
    fn step_ns(&self, _offset_ns: i64) -> SyncResult<()> {
        Ok(())
    }
    fn set_freq_ppm(&self, _ppm: f64) -> SyncResult<()> {
        Ok(())
    }
    fn diff_to_system_ns(&self) -> SyncResult<i64> {
        Ok(self.diff_ns)
    }
}

fn phc_clock(last_mac_byte: u8, diff_ns: i64) -> Arc<Clock> {
    Arc::new(Clock::new(
        ClockId::from_mac([0, 1, 2, 3, 4, last_mac_byte], [0xff, 0xfe]),
        format!("phc-{}", last_mac_byte),
        ClockRole::Phc,
        Box::new(FixedDiffDevice { diff_ns }),
    ))
}

#[test]
fn feed_serves_fresh_comparisons() {
    let (engine_tx, engine_rx) = sync_channel(64);
    let (feed, _join) = spawn_feed(0, engine_tx);

    let clock = phc_clock(1, 42_000);
    feed.add_clock(clock.clone(), 0).unwrap();
    let mut sub = feed.subscribe(clock.id()).unwrap();

    // Nothing sampled yet.
    assert_eq!(
        compare(Some(&mut sub), None).unwrap_err().kind(),
        ErrorKind::TryAgain
    );

    // The 1 s base period fires and the diff becomes visible, along with a
    // SyncEvent on the engine inbox.
    let event = engine_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("sync event after first sampling pass");
    assert!(matches!(event, EngineMsg::SyncEvent));

    let d = compare(Some(&mut sub), None).unwrap();
    assert_eq!(d.diff_ns, 42_000);

    // Freshness: an immediate re-read with require_fresh is stale until the
    // next sampling pass publishes a newer sequence number.
    sub.require_fresh();
    assert_eq!(
        compare(Some(&mut sub), None).unwrap_err().kind(),
        ErrorKind::Stale
    );
    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(compare(Some(&mut sub), None).unwrap().diff_ns, 42_000);

    feed.shutdown();
}

#[test]
fn feed_composite_diff_between_two_clocks() {
    let (engine_tx, _engine_rx) = sync_channel(64);
    let (feed, _join) = spawn_feed(0, engine_tx);

    let a = phc_clock(1, 10_000);
    let b = phc_clock(2, 4_000);
    feed.add_clock(a.clone(), 0).unwrap();
    feed.add_clock(b.clone(), 0).unwrap();

    let mut sub_a = feed.subscribe(a.id()).unwrap();
    let mut sub_b = feed.subscribe(b.id()).unwrap();

    std::thread::sleep(Duration::from_millis(1500));
    let d = compare(Some(&mut sub_a), Some(&mut sub_b)).unwrap();
    assert_eq!(d.diff_ns, 6_000);

    feed.shutdown();
}

#[test]
fn removed_source_reports_dead_to_subscribers() {
    let (engine_tx, _engine_rx) = sync_channel(64);
    let (feed, _join) = spawn_feed(0, engine_tx);

    let clock = phc_clock(3, 1_000);
    feed.add_clock(clock.clone(), 0).unwrap();
    let mut sub = feed.subscribe(clock.id()).unwrap();

    std::thread::sleep(Duration::from_millis(1500));
    assert!(compare(Some(&mut sub), None).is_ok());

    feed.remove_clock(clock.id());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        compare(Some(&mut sub), None).unwrap_err().kind(),
        ErrorKind::Dead
    );

    // A fresh subscription to the removed clock is refused.
    assert_eq!(
        feed.subscribe(clock.id()).unwrap_err().kind(),
        ErrorKind::NoEntry
    );

    feed.shutdown();
}

#[test]
fn duplicate_clock_registration_is_refused() {
    let (engine_tx, _engine_rx) = sync_channel(64);
    let (feed, _join) = spawn_feed(0, engine_tx);

    let clock = phc_clock(4, 0);
    feed.add_clock(clock.clone(), 0).unwrap();
    assert!(feed.add_clock(clock, 0).is_err());

    feed.shutdown();
}
