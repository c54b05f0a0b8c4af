//! Berkeley clock synchronisation, run once per session by the time authority.

use crate::{log, message::ParticipantId};
use color_print::cformat;
use parking_lot::Mutex;
use std::{collections::BTreeMap, time::Duration};
use tokio::{sync::Notify, time::Instant};

/// Result of one synchronisation round.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundOutcome {
    pub average: f64,
    /// Correction each reporting node must add to its clock.
    pub adjustments: BTreeMap<ParticipantId, f64>,
    pub reported: usize,
    pub expected: usize,
}

impl RoundOutcome {
    /// Fewer nodes reported than the round was waiting for.
    pub fn is_degraded(&self) -> bool {
        self.reported < self.expected
    }
}

/// Averages the collected deltas and derives each node's correction.
///
/// Pure: the same offsets always yield the same outcome.
pub fn compute_adjustments(offsets: &BTreeMap<ParticipantId, f64>, expected: usize) -> RoundOutcome {
    let average = if offsets.is_empty() {
        0.0
    } else {
        offsets.values().sum::<f64>() / offsets.len() as f64
    };

    RoundOutcome {
        average,
        adjustments: offsets
            .iter()
            .map(|(node, delta)| (node.clone(), average - delta))
            .collect(),
        reported: offsets.len(),
        expected,
    }
}

#[derive(Debug)]
pub struct ClockSyncCoordinator {
    authority: ParticipantId,
    participants: Vec<ParticipantId>,
    collect_timeout: Duration,
    offsets: Mutex<BTreeMap<ParticipantId, f64>>,
    arrived: Notify,
}

impl ClockSyncCoordinator {
    /// `participants` is the fixed set of nodes (excluding the authority) asked each round.
    pub fn new(
        authority: ParticipantId,
        participants: impl IntoIterator<Item = ParticipantId>,
        collect_timeout: Duration,
    ) -> Self {
        let participants = participants
            .into_iter()
            .filter(|p| *p != authority)
            .collect();

        Self {
            authority,
            participants,
            collect_timeout,
            offsets: Mutex::new(BTreeMap::new()),
            arrived: Notify::new(),
        }
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    /// Number of deltas a complete round collects, the authority included.
    pub fn expected(&self) -> usize {
        self.participants.len() + 1
    }

    /// Clears the previous round and records the authority's own zero delta.
    pub fn begin_round(&self) {
        let mut offsets = self.offsets.lock();
        offsets.clear();
        offsets.insert(self.authority.clone(), 0.0);
    }

    /// Records `from`'s delta. Returns `false` if `from` is not asked in this round.
    pub fn report(&self, from: ParticipantId, delta: f64) -> bool {
        if !self.participants.contains(&from) {
            log::warn(&cformat!(
                "Ignoring clock delta from <bold>{from}</bold>, which is not part of this round."
            ));
            return false;
        }
        log::info(&cformat!(
            "Received clock delta <bold>{delta:+.3}s</bold> from <bold>{from}</bold>."
        ));
        self.offsets.lock().insert(from, delta);
        self.arrived.notify_waiters();
        true
    }

    fn is_complete(&self) -> bool {
        let offsets = self.offsets.lock();
        self.participants.iter().all(|p| offsets.contains_key(p))
    }

    /// Waits until every participant reported or the collection timeout elapsed.
    pub async fn collect(&self) -> RoundOutcome {
        let deadline = Instant::now() + self.collect_timeout;

        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_complete() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let outcome = compute_adjustments(&self.offsets.lock(), self.expected());
        if outcome.is_degraded() {
            log::warn(&cformat!(
                "Clock sync degraded: <bold>{}/{}</bold> nodes reported in time.",
                outcome.reported,
                outcome.expected
            ));
        } else {
            log::info(&cformat!(
                "All <bold>{}</bold> clocks reported, average delta <bold>{:+.3}s</bold>.",
                outcome.reported,
                outcome.average
            ));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn offsets(raw: &[(&str, f64)]) -> BTreeMap<ParticipantId, f64> {
        raw.iter().map(|(id, d)| (ParticipantId::from(*id), *d)).collect()
    }

    #[test]
    fn adjustments_converge_on_the_average() {
        let deltas = offsets(&[("server", 0.0), ("a", 3.0), ("b", -2.0)]);
        let outcome = compute_adjustments(&deltas, 3);

        assert!((outcome.average - 1.0 / 3.0).abs() < 1e-9);
        let adj = &outcome.adjustments;
        assert!((adj[&"server".into()] - 0.3333).abs() < 1e-3);
        assert!((adj[&"a".into()] + 2.6667).abs() < 1e-3);
        assert!((adj[&"b".into()] - 2.3333).abs() < 1e-3);

        // every node lands on the same time in the authority's frame
        for (node, delta) in &deltas {
            assert!((delta + adj[node] - outcome.average).abs() < 1e-9);
        }
        assert!(!outcome.is_degraded());
    }

    #[test]
    fn recomputation_is_idempotent() {
        let deltas = offsets(&[("server", 0.0), ("a", 7.5)]);
        assert_eq!(compute_adjustments(&deltas, 2), compute_adjustments(&deltas, 2));
    }

    #[tokio::test]
    async fn full_round_completes_without_waiting_for_timeout() {
        let sync = Arc::new(ClockSyncCoordinator::new(
            "server".into(),
            ["teacher".into(), "client".into()],
            Duration::from_secs(30),
        ));
        sync.begin_round();

        let reporter = Arc::clone(&sync);
        tokio::spawn(async move {
            reporter.report("teacher".into(), 4.0);
            reporter.report("client".into(), -1.0);
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), sync.collect())
            .await
            .expect("collection should finish once everyone reported");
        assert_eq!(outcome.reported, 3);
        assert!((outcome.average - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reports_degrade_after_timeout() {
        let sync = ClockSyncCoordinator::new(
            "server".into(),
            ["teacher".into(), "client".into()],
            Duration::from_secs(12),
        );
        sync.begin_round();
        sync.report("teacher".into(), 2.0);

        let outcome = sync.collect().await;
        assert!(outcome.is_degraded());
        assert_eq!(outcome.reported, 2);
        assert_eq!(outcome.expected, 3);
        assert!((outcome.adjustments[&"teacher".into()] + 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn outsiders_cannot_fill_a_missing_slot() {
        let sync = ClockSyncCoordinator::new(
            "server".into(),
            ["teacher".into(), "client".into()],
            Duration::from_secs(12),
        );
        sync.begin_round();
        assert!(sync.report("teacher".into(), 2.0));
        assert!(!sync.report("intruder".into(), 9.0));
        assert!(!sync.report("server".into(), 9.0));

        let outcome = sync.collect().await;
        assert!(outcome.is_degraded());
        assert_eq!((outcome.reported, outcome.expected), (2, 3));
        assert!((outcome.average - 1.0).abs() < 1e-9);
    }

    #[test]
    fn new_round_forgets_old_reports() {
        let sync = ClockSyncCoordinator::new("server".into(), ["a".into()], Duration::ZERO);
        sync.begin_round();
        sync.report("a".into(), 5.0);
        assert!(sync.is_complete());
        sync.begin_round();
        assert!(!sync.is_complete());
    }
}
