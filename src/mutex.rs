//! Ricart–Agrawala mutual exclusion over the mark-entry critical section.
//!
//! [`MutexCoordinator`] is transport agnostic: every operation updates local
//! state and returns the [`Outbound`] messages the caller must deliver. The
//! student node feeds it incoming messages and ships what it returns.

use crate::{
    clock::LogicalClock,
    error::{Error, Result},
    log,
    message::{ParticipantId, Request},
};
use color_print::cformat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutexState {
    Idle,
    Requesting,
    InCs,
}

/// A message the coordinator wants delivered to another participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Request { to: ParticipantId, request: Request },
    /// Permission for the request `to` made at `timestamp`.
    Ok { to: ParticipantId, timestamp: u64 },
    /// Best-effort notice that lets peers drop our entry from their queue view.
    Release { to: ParticipantId },
}

impl Outbound {
    pub fn recipient(&self) -> &ParticipantId {
        match self {
            Self::Request { to, .. } | Self::Ok { to, .. } | Self::Release { to } => to,
        }
    }
}

/// Point-in-time view of a participant, for logging and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub id: ParticipantId,
    pub clock: u64,
    pub state: MutexState,
    pub request: Option<Request>,
    pub oks: BTreeSet<ParticipantId>,
    pub deferred: BTreeSet<ParticipantId>,
}

#[derive(Debug)]
struct RaState {
    mode: MutexState,
    own: Option<Request>,
    participants: BTreeSet<ParticipantId>,
    oks: BTreeSet<ParticipantId>,
    // deferred peer -> timestamp of the request we owe an OK
    deferred: BTreeMap<ParticipantId, u64>,
    queue: BTreeSet<Request>,
    // newest timestamp each peer has released; older requests are stale
    retired: BTreeMap<ParticipantId, u64>,
}

impl RaState {
    fn others<'a>(&'a self, me: &'a ParticipantId) -> impl Iterator<Item = &'a ParticipantId> {
        self.participants.iter().filter(move |p| *p != me)
    }

    fn has_all_oks(&self, me: &ParticipantId) -> bool {
        self.others(me).all(|p| self.oks.contains(p))
    }
}

#[derive(Debug)]
pub struct MutexCoordinator {
    me: ParticipantId,
    clock: LogicalClock,
    state: Mutex<RaState>,
    entered: Notify,
}

impl MutexCoordinator {
    pub fn new(me: ParticipantId, participants: impl IntoIterator<Item = ParticipantId>) -> Self {
        let mut participants: BTreeSet<ParticipantId> = participants.into_iter().collect();
        participants.insert(me.clone());

        Self {
            me,
            clock: LogicalClock::new(),
            state: Mutex::new(RaState {
                mode: MutexState::Idle,
                own: None,
                participants,
                oks: BTreeSet::new(),
                deferred: BTreeMap::new(),
                queue: BTreeSet::new(),
                retired: BTreeMap::new(),
            }),
            entered: Notify::new(),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.me
    }

    pub fn state(&self) -> MutexState {
        self.state.lock().mode
    }

    /// Replaces the known participant set (ourselves are always included).
    ///
    /// If a pending request is now fully acknowledged, entry is granted.
    pub fn set_participants(&self, participants: impl IntoIterator<Item = ParticipantId>) {
        let mut state = self.state.lock();
        state.participants = participants.into_iter().collect();
        state.participants.insert(self.me.clone());

        if state.mode == MutexState::Requesting && state.has_all_oks(&self.me) {
            self.enter(&mut state);
        }
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.state.lock().participants.iter().cloned().collect()
    }

    /// Starts a new request and returns the broadcast to send.
    pub fn request_entry(&self) -> Result<Vec<Outbound>> {
        let mut state = self.state.lock();
        if state.mode != MutexState::Idle {
            return Err(Error::InvalidState {
                participant: self.me.to_string(),
                operation: "request entry",
                state: state.mode,
            });
        }

        let request = Request::new(self.clock.tick(), self.me.clone());
        state.mode = MutexState::Requesting;
        state.oks.clear();
        state.deferred.clear();
        state.queue.insert(request.clone());
        state.own = Some(request.clone());

        log::info(&cformat!(
            "<bold>{}</bold> requests the critical section at ts=<bold>{}</bold>.",
            self.me,
            request.timestamp
        ));

        let outbound: Vec<Outbound> = state
            .others(&self.me)
            .map(|to| Outbound::Request {
                to: to.clone(),
                request: request.clone(),
            })
            .collect();

        // a lone participant needs nobody's permission
        if state.has_all_oks(&self.me) {
            self.enter(&mut state);
        }

        Ok(outbound)
    }

    /// Handles a peer's request. Returns the immediate OK, or `None` if deferred.
    pub fn receive_request(&self, request: Request) -> Option<Outbound> {
        self.clock.witness(request.timestamp);
        let mut state = self.state.lock();
        let from = request.participant.clone();

        let stale = state
            .retired
            .get(&from)
            .is_some_and(|released| request.timestamp <= *released);
        if stale {
            log::debug(&cformat!(
                "Answering stale request from <bold>{from}</bold> (ts={}).",
                request.timestamp
            ));
            return Some(Outbound::Ok {
                to: from,
                timestamp: request.timestamp,
            });
        }

        state.queue.insert(request.clone());

        let defer = match state.mode {
            MutexState::InCs => true,
            MutexState::Requesting => state.own.as_ref().is_some_and(|own| *own < request),
            MutexState::Idle => false,
        };

        if defer {
            state.deferred.insert(from.clone(), request.timestamp);
            log::info(&cformat!(
                "<bold>{}</bold> deferred the request from <bold>{from}</bold> (ts={}).",
                self.me,
                request.timestamp
            ));
            None
        } else {
            Some(Outbound::Ok {
                to: from,
                timestamp: request.timestamp,
            })
        }
    }

    /// Records a peer's permission for our request made at `timestamp`.
    /// Returns `true` if this OK granted entry.
    ///
    /// An OK for any other request (a late duplicate from an earlier round)
    /// is dropped.
    pub fn receive_ok(&self, from: &ParticipantId, timestamp: u64) -> bool {
        let mut state = self.state.lock();
        if state.mode != MutexState::Requesting {
            log::debug(&cformat!(
                "<bold>{}</bold> ignored an OK from <bold>{from}</bold> while {:?}.",
                self.me,
                state.mode
            ));
            return false;
        }
        let current = state.own.as_ref().map(|own| own.timestamp);
        if current != Some(timestamp) {
            log::debug(&cformat!(
                "<bold>{}</bold> dropped a stale OK from <bold>{from}</bold> (ts={timestamp}, pending {current:?}).",
                self.me
            ));
            return false;
        }

        state.oks.insert(from.clone());
        let needed = state.others(&self.me).count();
        log::info(&cformat!(
            "<bold>{}</bold> received OK from <bold>{from}</bold> ({}/{needed}).",
            self.me,
            state.oks.len()
        ));

        if state.has_all_oks(&self.me) {
            self.enter(&mut state);
            true
        } else {
            false
        }
    }

    /// Drops a released request from the queue view.
    pub fn receive_release(&self, from: &ParticipantId) {
        let mut state = self.state.lock();
        let released: Vec<Request> = state
            .queue
            .iter()
            .filter(|r| &r.participant == from)
            .cloned()
            .collect();

        for request in released {
            let newest = state.retired.entry(from.clone()).or_insert(0);
            *newest = (*newest).max(request.timestamp);
            state.queue.remove(&request);
        }
    }

    /// Leaves the critical section, releasing every deferred peer.
    pub fn exit_cs(&self) -> Result<Vec<Outbound>> {
        let mut state = self.state.lock();
        if state.mode != MutexState::InCs {
            return Err(Error::InvalidState {
                participant: self.me.to_string(),
                operation: "exit the critical section",
                state: state.mode,
            });
        }

        let deferred = std::mem::take(&mut state.deferred);
        let mut outbound: Vec<Outbound> = deferred
            .iter()
            .map(|(to, timestamp)| Outbound::Ok {
                to: to.clone(),
                timestamp: *timestamp,
            })
            .collect();
        outbound.extend(
            state
                .others(&self.me)
                .map(|to| Outbound::Release { to: to.clone() }),
        );

        if let Some(own) = state.own.take() {
            state.queue.remove(&own);
        }
        state.oks.clear();
        state.mode = MutexState::Idle;

        log::info(&cformat!(
            "<bold>{}</bold> left the critical section, releasing {} deferred peer(s).",
            self.me,
            deferred.len()
        ));

        Ok(outbound)
    }

    /// Still-requesting participants whose request precedes ours, earliest first.
    pub fn peek_ahead(&self) -> Vec<ParticipantId> {
        let state = self.state.lock();
        match &state.own {
            Some(own) => state
                .queue
                .range(..own)
                .map(|r| r.participant.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The whole local queue view, earliest first.
    pub fn queue(&self) -> Vec<Request> {
        self.state.lock().queue.iter().cloned().collect()
    }

    /// Our outstanding request together with the peers whose OK is missing.
    pub fn pending(&self) -> Option<(Request, Vec<ParticipantId>)> {
        let state = self.state.lock();
        if state.mode != MutexState::Requesting {
            return None;
        }
        let own = state.own.clone()?;
        let missing = state
            .others(&self.me)
            .filter(|p| !state.oks.contains(*p))
            .cloned()
            .collect();
        Some((own, missing))
    }

    /// Resolves once this participant holds the critical section.
    pub async fn wait_for_entry(&self) {
        loop {
            let notified = self.entered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() == MutexState::InCs {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        let state = self.state.lock();
        ParticipantSnapshot {
            id: self.me.clone(),
            clock: self.clock.current(),
            state: state.mode,
            request: state.own.clone(),
            oks: state.oks.clone(),
            deferred: state.deferred.keys().cloned().collect(),
        }
    }

    fn enter(&self, state: &mut RaState) {
        state.mode = MutexState::InCs;
        log::info(&cformat!(
            "<green, bold>{}</green, bold> entered the critical section.",
            self.me
        ));
        self.entered.notify_waiters();
    }
}
