//! Admission control for final submissions and the exactly-once ledger that
//! records their grades.

use crate::{
    log,
    message::{Desk, ParticipantId, Submission},
};
use color_print::cformat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};

/// How the primary desk decides whether to grade a submission itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// At most `permits` submissions graded concurrently on the primary.
    BoundedConcurrency { permits: usize },
    /// The first `local_limit` submissions of any `window_ms` window stay on the primary.
    SlidingWindow { window_ms: u64, local_limit: usize },
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::SlidingWindow {
            window_ms: 1000,
            local_limit: 3,
        }
    }
}

/// Held while the primary grades; dropping it frees the concurrency slot.
#[derive(Debug)]
pub struct PrimaryPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
pub enum Route {
    Primary(PrimaryPermit),
    Secondary,
}

impl Route {
    pub fn desk(&self) -> Desk {
        match self {
            Self::Primary(_) => Desk::Primary,
            Self::Secondary => Desk::Secondary,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdmissionController {
    inner: Arc<AdmissionState>,
}

#[derive(Debug)]
struct AdmissionState {
    policy: AdmissionPolicy,
    permits: Arc<Semaphore>,
    window: Mutex<VecDeque<(u64, ParticipantId)>>,
    epoch: Instant,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Self {
        let permits = match policy {
            AdmissionPolicy::BoundedConcurrency { permits } => permits,
            AdmissionPolicy::SlidingWindow { .. } => 0,
        };

        Self {
            inner: Arc::new(AdmissionState {
                policy,
                permits: Arc::new(Semaphore::new(permits)),
                window: Mutex::new(VecDeque::new()),
                epoch: Instant::now(),
            }),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.inner.policy
    }

    pub fn admit(&self, who: &ParticipantId) -> Route {
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        self.admit_at(who, now_ms)
    }

    /// Routes a submission arriving at `now_ms` (milliseconds on a monotonic clock).
    pub fn admit_at(&self, who: &ParticipantId, now_ms: u64) -> Route {
        let route = match self.inner.policy {
            AdmissionPolicy::BoundedConcurrency { .. } => {
                match Arc::clone(&self.inner.permits).try_acquire_owned() {
                    Ok(permit) => Route::Primary(PrimaryPermit {
                        _permit: Some(permit),
                    }),
                    Err(_) => Route::Secondary,
                }
            }
            AdmissionPolicy::SlidingWindow {
                window_ms,
                local_limit,
            } => {
                let mut window = self.inner.window.lock();
                let cutoff = now_ms.saturating_sub(window_ms);
                while window.front().is_some_and(|(ts, _)| *ts < cutoff) {
                    window.pop_front();
                }
                window.push_back((now_ms, who.clone()));

                if window.len() - 1 < local_limit {
                    Route::Primary(PrimaryPermit { _permit: None })
                } else {
                    Route::Secondary
                }
            }
        };

        log::info(&cformat!(
            "Submission from <bold>{who}</bold> routed to the <bold>{:?}</bold> desk.",
            route.desk()
        ));
        route
    }

    /// Primary slots currently taken under [`AdmissionPolicy::BoundedConcurrency`].
    pub fn in_flight(&self) -> usize {
        match self.inner.policy {
            AdmissionPolicy::BoundedConcurrency { permits } => {
                permits - self.inner.permits.available_permits()
            }
            AdmissionPolicy::SlidingWindow { .. } => 0,
        }
    }
}

/// Grades a submission.
pub trait Grader: Send + Sync + std::fmt::Debug {
    fn grade(&self, submission: &Submission) -> i64;
}

/// Fixed points per correct answer; an answer of `0` is a skipped question.
#[derive(Clone, Debug)]
pub struct AnswerKeyGrader {
    key: BTreeMap<u32, u32>,
    points: i64,
}

impl AnswerKeyGrader {
    pub fn new(key: BTreeMap<u32, u32>, points: i64) -> Self {
        Self { key, points }
    }

    pub fn max_score(&self) -> i64 {
        self.key.len() as i64 * self.points
    }
}

impl Default for AnswerKeyGrader {
    fn default() -> Self {
        let key = [2, 2, 2, 3, 2, 2, 4, 3, 3, 2];
        Self::new((1..).zip(key).collect(), 10)
    }
}

impl Grader for AnswerKeyGrader {
    fn grade(&self, submission: &Submission) -> i64 {
        let correct = submission
            .answers
            .iter()
            .filter(|&(question, given)| *given != 0 && self.key.get(question) == Some(given))
            .count();
        correct as i64 * self.points
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Finalized {
    pub value: i64,
    pub desk: Desk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finalization {
    Recorded(Finalized),
    /// Already finalized; carries the value that was kept.
    Duplicate(Finalized),
}

impl Finalization {
    pub fn finalized(&self) -> Finalized {
        match self {
            Self::Recorded(f) | Self::Duplicate(f) => *f,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// One grade per participant: the first finalization wins, later ones are no-ops.
#[derive(Debug, Default)]
pub struct FinalizationLedger {
    scores: Mutex<BTreeMap<ParticipantId, Finalized>>,
}

impl FinalizationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `grade` and records its value unless `who` is already finalized.
    pub fn finalize_with(&self, who: &ParticipantId, desk: Desk, grade: impl FnOnce() -> i64) -> Finalization {
        let mut scores = self.scores.lock();
        if let Some(existing) = scores.get(who) {
            log::info(&cformat!(
                "<bold>{who}</bold> already finalized at <bold>{}</bold>, ignoring.",
                existing.value
            ));
            return Finalization::Duplicate(*existing);
        }

        let finalized = Finalized {
            value: grade(),
            desk,
        };
        scores.insert(who.clone(), finalized);
        log::info(&cformat!(
            "Finalized <bold>{who}</bold> at <bold>{}</bold> on the {desk:?} desk.",
            finalized.value
        ));
        Finalization::Recorded(finalized)
    }

    /// Records a grade pushed back by the secondary desk.
    pub fn accept_pushed(&self, who: &ParticipantId, value: i64) -> Finalization {
        self.finalize_with(who, Desk::Secondary, || value)
    }

    pub fn get(&self, who: &ParticipantId) -> Option<Finalized> {
        self.scores.lock().get(who).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.lock().is_empty()
    }
}
