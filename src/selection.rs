//! Best-master election: the candidacy filter, the selection strategies and
//! the configurable comparator rule pipeline, plus the holdoff bookkeeping
//! the engine uses before committing a change.

use crate::instance::{Constraints, InstanceHandle, InstanceStatus, SyncState};
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Manual,
    ManualStartup,
    #[default]
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleId {
    Manual,
    ExtConstraints,
    State,
    NoAlarms,
    UserPriority,
    Clustering,
    ClockClass,
    TotalAccuracy,
    AllanVariance,
    StepsRemoved,
    TieBreak,
}

impl RuleId {
    pub fn default_order() -> Vec<RuleId> {
        vec![
            RuleId::Manual,
            RuleId::ExtConstraints,
            RuleId::State,
            RuleId::NoAlarms,
            RuleId::UserPriority,
            RuleId::Clustering,
            RuleId::ClockClass,
            RuleId::TotalAccuracy,
            RuleId::AllanVariance,
            RuleId::StepsRemoved,
            RuleId::TieBreak,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub strategy: Strategy,
    pub rules: Vec<RuleId>,
    pub initial_instance: Option<String>,
    pub holdoff: Duration,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy {
            strategy: Strategy::Automatic,
            rules: RuleId::default_order(),
            initial_instance: None,
            holdoff: Duration::from_secs(10),
        }
    }
}

/// One election entrant: a handle plus the status the engine last saw.
#[derive(Debug, Clone, Copy)]
pub struct Entrant<'a> {
    pub handle: InstanceHandle,
    pub name: &'a str,
    pub status: &'a InstanceStatus,
}

/// An instance is a candidate iff it is synchronised, alarm-free and not
/// constrained out.
pub fn is_candidate(status: &InstanceStatus) -> bool {
    matches!(status.state, SyncState::Slave | SyncState::Master)
        && status.alarms.is_empty()
        && !status.constraints.contains(Constraints::CANNOT_BE_SELECTED)
}

fn state_rank(state: SyncState) -> u8 {
    match state {
        SyncState::Slave => 0,
        SyncState::Master => 1,
        _ => 2,
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // Accuracies are non-negative or +inf, never NaN.
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Apply one rule to a pair of candidates. `Less` means `a` is better.
fn compare_rule(rule: RuleId, a: &Entrant, b: &Entrant, manual_name: Option<&str>) -> Ordering {
    match rule {
        RuleId::Manual => {
            let am = Some(a.name) == manual_name;
            let bm = Some(b.name) == manual_name;
            bm.cmp(&am)
        }
        RuleId::ExtConstraints => {
            let am = a.status.constraints.contains(Constraints::MUST_BE_SELECTED);
            let bm = b.status.constraints.contains(Constraints::MUST_BE_SELECTED);
            bm.cmp(&am)
        }
        RuleId::State => state_rank(a.status.state).cmp(&state_rank(b.status.state)),
        RuleId::NoAlarms => a
            .status
            .alarms
            .bits()
            .count_ones()
            .cmp(&b.status.alarms.bits().count_ones()),
        RuleId::UserPriority => a.status.user_priority.cmp(&b.status.user_priority),
        RuleId::Clustering => (-a.status.clustering_score).cmp(&-b.status.clustering_score),
        RuleId::ClockClass => a.status.master.clock_class.cmp(&b.status.master.clock_class),
        RuleId::TotalAccuracy => cmp_f64(
            a.status.local_accuracy + a.status.master.accuracy,
            b.status.local_accuracy + b.status.master.accuracy,
        ),
        RuleId::AllanVariance => cmp_f64(a.status.allan_variance, b.status.allan_variance),
        RuleId::StepsRemoved => a
            .status
            .master
            .steps_removed
            .cmp(&b.status.master.steps_removed),
        RuleId::TieBreak => a.status.master.clock_id.cmp(&b.status.master.clock_id),
    }
}

/// Full pipeline comparison: rules are evaluated in order until one
/// discriminates; the tie-break by clock identity always terminates the
/// pipeline even when not configured explicitly.
fn compare_entrants(
    rules: &[RuleId],
    a: &Entrant,
    b: &Entrant,
    manual_name: Option<&str>,
) -> Ordering {
    for &rule in rules {
        let ord = compare_rule(rule, a, b, manual_name);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if !rules.contains(&RuleId::TieBreak) {
        return compare_rule(RuleId::TieBreak, a, b, manual_name);
    }
    Ordering::Equal
}

/// Run the election over the current instance table. `manual_name` is the
/// operator-selected instance for the manual rule and manual strategies.
pub fn select(
    policy: &SelectionPolicy,
    manual_name: Option<&str>,
    automatic: bool,
    entrants: &[Entrant],
) -> Option<InstanceHandle> {
    if !automatic {
        // manual / manual-startup before the first override: the configured
        // instance if it exists, otherwise none.
        return entrants
            .iter()
            .find(|e| Some(e.name) == manual_name)
            .map(|e| e.handle);
    }

    let mut best: Option<&Entrant> = None;
    for e in entrants {
        if !is_candidate(e.status) {
            continue;
        }
        best = match best {
            None => Some(e),
            Some(cur) => {
                if compare_entrants(&policy.rules, e, cur, manual_name) == Ordering::Less {
                    Some(e)
                } else {
                    Some(cur)
                }
            }
        };
    }
    let winner = best.map(|e| e.handle);
    debug!("selection pass: winner={:?}", winner);
    winner
}

// ============================================================================
// HOLDOFF
// ============================================================================

/// Tracks a would-be selection change until it has remained stable for the
/// holdoff interval.
#[derive(Debug, Default)]
pub struct Holdoff {
    pending: Option<(Option<InstanceHandle>, Instant)>,
}

pub enum HoldoffVerdict {
    /// Nothing to do; the current selection stands.
    Keep,
    /// The change has survived the holdoff; commit it.
    Commit(Option<InstanceHandle>),
    /// A change is pending until the returned deadline.
    Pending(Instant),
}

impl Holdoff {
    /// Feed the latest election result. `current` is the committed selection.
    pub fn update(
        &mut self,
        current: Option<InstanceHandle>,
        winner: Option<InstanceHandle>,
        interval: Duration,
        now: Instant,
    ) -> HoldoffVerdict {
        if winner == current {
            self.pending = None;
            return HoldoffVerdict::Keep;
        }
        // First selection commits immediately; holdoff applies to changes
        // away from an established selection.
        if current.is_none() || interval.is_zero() {
            self.pending = None;
            return HoldoffVerdict::Commit(winner);
        }
        match self.pending {
            Some((pend, deadline)) if pend == winner => {
                if now >= deadline {
                    self.pending = None;
                    HoldoffVerdict::Commit(winner)
                } else {
                    HoldoffVerdict::Pending(deadline)
                }
            }
            _ => {
                let deadline = now + interval;
                self.pending = Some((winner, deadline));
                HoldoffVerdict::Pending(deadline)
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, d)| d)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockId;
    use crate::instance::{Alarms, MasterInfo};

    fn slave_status() -> InstanceStatus {
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

    #[test]
    fn test_candidacy_filter() {
        let mut s = slave_status();
        assert!(is_candidate(&s));

        s.state = SyncState::Listening;
        assert!(!is_candidate(&s));

        s.state = SyncState::Master;
        assert!(is_candidate(&s));

        s.alarms = Alarms::SOURCE_LOST;
        assert!(!is_candidate(&s));

        s.alarms = Alarms::empty();
        s.constraints = Constraints::CANNOT_BE_SELECTED;
        assert!(!is_candidate(&s));
    }

    #[test]
    fn test_rule_order_decides_winner() {
        // A: better clock class, worse accuracy. B: the reverse. The first
        // discriminating rule wins.
        let mut a = slave_status();
        a.master = MasterInfo {
            clock_class: 6,
            ..Default::default()
        };
        a.local_accuracy = 50e-6;
        a.master.accuracy = 50e-6;

        let mut b = slave_status();
        b.master = MasterInfo {
            clock_class: 7,
            ..Default::default()
        };
        b.local_accuracy = 0.5e-6;
        b.master.accuracy = 0.5e-6;

        let ea = entrant(0, "a", &a);
        let eb = entrant(1, "b", &b);

        let mut policy = SelectionPolicy::default();
        policy.rules = vec![RuleId::ClockClass, RuleId::TotalAccuracy, RuleId::TieBreak];
        assert_eq!(
            select(&policy, None, true, &[ea, eb]),
            Some(InstanceHandle(0))
        );

        policy.rules = vec![RuleId::TotalAccuracy, RuleId::ClockClass, RuleId::TieBreak];
        assert_eq!(
            select(&policy, None, true, &[ea, eb]),
            Some(InstanceHandle(1))
        );
    }

    #[test]
    fn test_must_be_selected_dominates() {
        let mut a = slave_status();
        a.user_priority = 10;
        a.constraints = Constraints::MUST_BE_SELECTED;
        let mut b = slave_status();
        b.user_priority = 0;

        let policy = SelectionPolicy::default();
        let got = select(&policy, None, true, &[entrant(0, "a", &a), entrant(1, "b", &b)]);
        assert_eq!(got, Some(InstanceHandle(0)));
    }

    #[test]
    fn test_tie_break_by_clock_id() {
        let mut a = slave_status();
        a.master.clock_id = ClockId([9, 0, 0, 0, 0, 0, 0, 0]);
        let mut b = slave_status();
        b.master.clock_id = ClockId([1, 0, 0, 0, 0, 0, 0, 0]);

        let policy = SelectionPolicy::default();
        let got = select(&policy, None, true, &[entrant(0, "a", &a), entrant(1, "b", &b)]);
        assert_eq!(got, Some(InstanceHandle(1)));
    }

    #[test]
    fn test_manual_strategy_picks_configured_or_none() {
        let a = slave_status();
        let b = InstanceStatus {
            state: SyncState::Listening,
            ..Default::default()
        };
        let policy = SelectionPolicy {
            strategy: Strategy::Manual,
            initial_instance: Some("b".to_string()),
            ..Default::default()
        };
        let ents = [entrant(0, "a", &a), entrant(1, "b", &b)];

        // Manual picks by name even if another instance would win the rules.
        assert_eq!(select(&policy, Some("b"), false, &ents), Some(InstanceHandle(1)));
        assert_eq!(select(&policy, Some("zzz"), false, &ents), None);
    }

    #[test]
    fn test_no_candidates_selects_nothing() {
        let a = InstanceStatus {
            state: SyncState::Disabled,
            ..Default::default()
        };
        let policy = SelectionPolicy::default();
        assert_eq!(select(&policy, None, true, &[entrant(0, "a", &a)]), None);
    }

    #[test]
    fn test_holdoff_delays_then_commits() {
        let mut hold = Holdoff::default();
        let t0 = Instant::now();
        let iv = Duration::from_secs(5);
        let cur = Some(InstanceHandle(0));
        let win = Some(InstanceHandle(1));

        match hold.update(cur, win, iv, t0) {
            HoldoffVerdict::Pending(d) => assert_eq!(d, t0 + iv),
            _ => panic!("expected pending"),
        }
        // Still winning before the deadline: remain pending.
        assert!(matches!(
            hold.update(cur, win, iv, t0 + Duration::from_secs(2)),
            HoldoffVerdict::Pending(_)
        ));
        // Still winning at the deadline: commit.
        match hold.update(cur, win, iv, t0 + iv) {
            HoldoffVerdict::Commit(h) => assert_eq!(h, win),
            _ => panic!("expected commit"),
        }
    }

    #[test]
    fn test_holdoff_reset_when_winner_reverts() {
        let mut hold = Holdoff::default();
        let t0 = Instant::now();
        let iv = Duration::from_secs(5);
        let cur = Some(InstanceHandle(0));

        assert!(matches!(
            hold.update(cur, Some(InstanceHandle(1)), iv, t0),
            HoldoffVerdict::Pending(_)
        ));
        // The incumbent wins again: pending change is abandoned.
        assert!(matches!(
            hold.update(cur, cur, iv, t0 + Duration::from_secs(1)),
            HoldoffVerdict::Keep
        ));
        assert!(hold.deadline().is_none());
    }

    #[test]
    fn test_initial_selection_commits_immediately() {
        let mut hold = Holdoff::default();
        match hold.update(None, Some(InstanceHandle(2)), Duration::from_secs(10), Instant::now()) {
            HoldoffVerdict::Commit(h) => assert_eq!(h, Some(InstanceHandle(2))),
            _ => panic!("expected immediate commit from no selection"),
        }
    }
}
