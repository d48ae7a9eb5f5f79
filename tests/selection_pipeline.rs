//! Selection pipeline scenarios: rule ordering experiments and the
//! constraint handling that backs clock-ownership arbitration.

use refsyncd::clock::ClockId;
use refsyncd::instance::{Alarms, Constraints, InstanceHandle, InstanceStatus, SyncState};
use refsyncd::selection::{select, Entrant, RuleId, SelectionPolicy};

fn slave() -> InstanceStatus {
    InstanceStatus {
        state: SyncState::Slave,
        ..Default::default()
    }
}

fn entrant<'a>(idx: usize, name: &'a str, status: &'a InstanceStatus) -> Entrant<'a> {
    Entrant {
        handle: InstanceHandle(idx),
        name,
        status,
    }
}

fn policy_with_rules(rules: Vec<RuleId>) -> SelectionPolicy {
    SelectionPolicy {
        rules,
        ..Default::default()
    }
}

#[test]
fn rule_order_experiment() {
    // A: clock class 6, total accuracy 100 µs. B: clock class 7, total
    // accuracy 1 µs. The configured rule order decides which wins.
    let mut a = slave();
    a.master.clock_class = 6;
    a.local_accuracy = 50e-6;
    a.master.accuracy = 50e-6;

    let mut b = slave();
    b.master.clock_class = 7;
    b.local_accuracy = 0.5e-6;
    b.master.accuracy = 0.5e-6;

    let ents = [entrant(0, "a", &a), entrant(1, "b", &b)];

    let by_class = policy_with_rules(vec![
        RuleId::ClockClass,
        RuleId::TotalAccuracy,
        RuleId::TieBreak,
    ]);
    assert_eq!(select(&by_class, None, true, &ents), Some(InstanceHandle(0)));

    let by_accuracy = policy_with_rules(vec![
        RuleId::TotalAccuracy,
        RuleId::ClockClass,
        RuleId::TieBreak,
    ]);
    assert_eq!(
        select(&by_accuracy, None, true, &ents),
        Some(InstanceHandle(1))
    );
}

#[test]
fn must_be_selected_overrides_everything() {
    // The chrony adapter raises this constraint when chrony owns the system
    // clock and no helper script can change that.
    let mut chrony = slave();
    chrony.constraints = Constraints::MUST_BE_SELECTED;
    chrony.user_priority = 100;
    chrony.master.clock_class = 255;

    let mut good = slave();
    good.user_priority = 0;
    good.master.clock_class = 6;
    good.local_accuracy = 1e-9;
    good.master.accuracy = 1e-9;

    let ents = [entrant(0, "chrony1", &chrony), entrant(1, "ptp1", &good)];
    let policy = SelectionPolicy::default();
    assert_eq!(select(&policy, None, true, &ents), Some(InstanceHandle(0)));
}

#[test]
fn cannot_be_selected_removes_candidacy() {
    let mut only = slave();
    only.constraints = Constraints::CANNOT_BE_SELECTED;
    let ents = [entrant(0, "chrony1", &only)];
    let policy = SelectionPolicy::default();
    assert_eq!(select(&policy, None, true, &ents), None);
}

#[test]
fn alarmed_instances_lose_to_clean_ones() {
    let mut alarmed = slave();
    alarmed.alarms = Alarms::NO_RX_TIMESTAMPS;
    alarmed.master.clock_class = 6;

    let clean = slave();

    let ents = [entrant(0, "a", &alarmed), entrant(1, "b", &clean)];
    let policy = SelectionPolicy::default();
    // The candidacy filter removes the alarmed instance outright.
    assert_eq!(select(&policy, None, true, &ents), Some(InstanceHandle(1)));
}

#[test]
fn slave_preferred_over_master_state() {
    let follower = slave();
    let mut freerunner = slave();
    freerunner.state = SyncState::Master;

    let ents = [entrant(0, "fr0", &freerunner), entrant(1, "ntp1", &follower)];
    let policy = SelectionPolicy::default();
    assert_eq!(select(&policy, None, true, &ents), Some(InstanceHandle(1)));
}

#[test]
fn tie_break_is_deterministic_by_clock_id() {
    let mut a = slave();
    a.master.clock_id = ClockId([2, 0, 0, 0, 0, 0, 0, 1]);
    let mut b = slave();
    b.master.clock_id = ClockId([2, 0, 0, 0, 0, 0, 0, 0]);

    let ents = [entrant(0, "a", &a), entrant(1, "b", &b)];
    // Even with no explicit tie-break rule configured, identity decides.
    let policy = policy_with_rules(vec![RuleId::UserPriority]);
    assert_eq!(select(&policy, None, true, &ents), Some(InstanceHandle(1)));
}

#[test]
fn manual_rule_inside_automatic_pipeline() {
    let a = slave();
    let b = slave();
    let ents = [entrant(0, "a", &a), entrant(1, "b", &b)];
    let policy = SelectionPolicy::default();

    assert_eq!(
        select(&policy, Some("b"), true, &ents),
        Some(InstanceHandle(1))
    );
    assert_eq!(
        select(&policy, Some("a"), true, &ents),
        Some(InstanceHandle(0))
    );
}
