//! Student and clock-participant nodes.

use crate::{
    clock::LocalClock,
    config::ClusterConfig,
    error::{Error, Result},
    log,
    message::{Desk, ParticipantId, Record, Reply, Request, Rpc, Submission},
    mutex::{MutexCoordinator, Outbound},
    transport::{Caller, Handler},
};
use color_print::cformat;
use futures::{future::{join_all, BoxFuture}, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, time::Duration};
use tokio::sync::Notify;

/// A Berkeley participant: reports its clock delta and applies corrections.
#[derive(Debug)]
pub struct ClockNode {
    id: ParticipantId,
    clock: LocalClock,
    server_address: String,
    caller: Caller,
    phases: Mutex<Vec<String>>,
}

impl ClockNode {
    pub fn new(id: ParticipantId, clock: LocalClock, server_address: String, caller: Caller) -> Self {
        Self {
            id,
            clock,
            server_address,
            caller,
            phases: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn clock(&self) -> &LocalClock {
        &self.clock
    }

    /// Phases the server announced as complete, in arrival order.
    pub fn phases(&self) -> Vec<String> {
        self.phases.lock().clone()
    }

    /// Function that answers the clock-synchronisation calls, or returns the call back.
    async fn handle_clock(&self, rpc: Rpc) -> std::result::Result<Reply, Rpc> {
        match rpc {
            Rpc::CalculateOffset { round, reference } => {
                let delta = self.clock.delta_from(reference);
                log::info(&cformat!(
                    "<bold>{}</bold> is <bold>{delta:+.3}s</bold> from the reference.",
                    self.id
                ));
                let report = Rpc::ReportLocalTime {
                    from: self.id.clone(),
                    round,
                    delta,
                };
                self.caller.notify(&self.server_address, report).await;
                Ok(Reply::Ack)
            }
            Rpc::ApplyAdjustment { delta } => {
                let now = self.clock.apply_adjustment(delta);
                log::info(&cformat!(
                    "<bold>{}</bold> adjusted its clock by <bold>{delta:+.3}s</bold> (now {now:.3}).",
                    self.id
                ));
                Ok(Reply::Ack)
            }
            Rpc::PhaseComplete { phase } => {
                log::info(&cformat!("<green, bold>{phase}</green, bold> complete."));
                self.phases.lock().push(phase);
                Ok(Reply::Ack)
            }
            other => Err(other),
        }
    }

    pub async fn register(&self, address: &str) -> Result<()> {
        let rpc = Rpc::Register {
            participant: self.id.clone(),
            address: address.to_string(),
        };
        self.caller
            .call(&self.server_address, rpc)
            .await
            .into_reply(&self.server_address)?;
        Ok(())
    }
}

impl Handler for ClockNode {
    fn handle(&self, rpc: Rpc) -> BoxFuture<'_, Reply> {
        async move {
            match self.handle_clock(rpc).await {
                Ok(reply) => reply,
                Err(other) => Reply::unsupported(&other),
            }
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct StudentNode {
    address: String,
    server_address: String,
    mutex: MutexCoordinator,
    clock: ClockNode,
    peers: RwLock<BTreeMap<ParticipantId, String>>,
    caller: Caller,
    lock_caller: Caller,
    rebroadcast_after: Duration,
    max_rebroadcasts: u32,
    may_request: Notify,
    results: Mutex<Vec<Record>>,
    results_shown: Notify,
}

impl StudentNode {
    pub fn new(id: ParticipantId, address: String, clock: LocalClock, config: &ClusterConfig, caller: Caller) -> Self {
        Self {
            address,
            server_address: config.server_address.clone(),
            mutex: MutexCoordinator::new(id.clone(), []),
            clock: ClockNode::new(id, clock, config.server_address.clone(), caller.clone()),
            peers: RwLock::new(BTreeMap::new()),
            lock_caller: caller.with_timeout(config.lock_timeout()),
            caller,
            rebroadcast_after: config.rebroadcast_after(),
            max_rebroadcasts: config.mutex.max_rebroadcasts,
            may_request: Notify::new(),
            results: Mutex::new(Vec::new()),
            results_shown: Notify::new(),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        self.mutex.id()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mutex(&self) -> &MutexCoordinator {
        &self.mutex
    }

    pub fn clock(&self) -> &ClockNode {
        &self.clock
    }

    pub fn results(&self) -> Vec<Record> {
        self.results.lock().clone()
    }

    /// Replaces the peer table; every listed student takes part in mutual exclusion.
    pub fn set_peers(&self, peers: BTreeMap<ParticipantId, String>) {
        self.mutex.set_participants(peers.keys().cloned());
        *self.peers.write() = peers;
    }

    fn add_peer(&self, id: ParticipantId, address: String) {
        let mut peers = self.peers.write();
        peers.insert(id, address);
        self.mutex.set_participants(peers.keys().cloned());
    }

    /// Registers with the server and adopts the registry it answers with.
    pub async fn register(&self) -> Result<()> {
        let rpc = Rpc::Register {
            participant: self.id().clone(),
            address: self.address.clone(),
        };
        match self
            .caller
            .call(&self.server_address, rpc)
            .await
            .into_reply(&self.server_address)?
        {
            Reply::Registry(peers) => {
                log::info(&cformat!(
                    "<bold>{}</bold> registered; <bold>{}</bold> student(s) known.",
                    self.id(),
                    peers.len()
                ));
                self.set_peers(peers);
                Ok(())
            }
            other => Err(unexpected(&self.server_address, &other)),
        }
    }

    /// Resolves once the server said this student may request entry.
    pub async fn wait_for_permission(&self) {
        self.may_request.notified().await;
    }

    /// Broadcasts a request and waits for entry, re-sending the unchanged
    /// request to silent peers every `rebroadcast_after`.
    pub async fn request_entry(&self) -> Result<()> {
        let outbound = self.mutex.request_entry()?;

        if let Some(Request { timestamp, .. }) = self.mutex.snapshot().request {
            let intent = Rpc::RegisterIntent {
                timestamp,
                from: self.id().clone(),
            };
            self.caller.notify(&self.server_address, intent).await;
        }

        self.deliver(outbound).await;
        self.await_entry().await;
        Ok(())
    }

    async fn await_entry(&self) {
        let mut rounds = 0;
        while rounds < self.max_rebroadcasts {
            if tokio::time::timeout(self.rebroadcast_after, self.mutex.wait_for_entry())
                .await
                .is_ok()
            {
                return;
            }
            rounds += 1;

            let Some((request, missing)) = self.mutex.pending() else {
                continue;
            };
            log::warn(&cformat!(
                "<bold>{}</bold> still misses OK from {missing:?}; re-sending ts=<bold>{}</bold>.",
                self.id(),
                request.timestamp
            ));
            let outbound = missing
                .into_iter()
                .map(|to| Outbound::Request {
                    to,
                    request: request.clone(),
                })
                .collect();
            self.deliver(outbound).await;
        }
        self.mutex.wait_for_entry().await;
    }

    pub async fn exit_cs(&self) -> Result<()> {
        let outbound = self.mutex.exit_cs()?;
        let exit = Rpc::ExitCs {
            from: self.id().clone(),
        };
        self.caller.notify(&self.server_address, exit).await;
        self.deliver(outbound).await;
        Ok(())
    }

    /// Enters the critical section, records `value` as this student's mark
    /// and leaves again. The section is left even if recording failed.
    pub async fn enter_mark(&self, value: i64) -> Result<()> {
        self.request_entry().await?;

        let mark = Rpc::RecordMark {
            from: self.id().clone(),
            value,
        };
        // one attempt: the server may still be waiting on the chunk's write set
        let recorded = self
            .lock_caller
            .call_once(&self.server_address, mark)
            .await
            .into_reply(&self.server_address);

        self.exit_cs().await?;
        recorded.map(|_| ())
    }

    /// Hands in the final answers and returns the grade with the desk that produced it.
    pub async fn submit(&self, answers: BTreeMap<u32, u32>) -> Result<(i64, Desk)> {
        let rpc = Rpc::SubmitForFinalization {
            submission: Submission {
                participant: self.id().clone(),
                answers,
            },
        };
        match self
            .caller
            .call(&self.server_address, rpc)
            .await
            .into_reply(&self.server_address)?
        {
            Reply::Finalized { value, desk, .. } => Ok((value, desk)),
            other => Err(unexpected(&self.server_address, &other)),
        }
    }

    /// Resolves once a results broadcast arrived.
    pub async fn wait_for_results(&self) -> Vec<Record> {
        loop {
            let notified = self.results_shown.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let results = self.results();
            if !results.is_empty() {
                return results;
            }
            notified.await;
        }
    }

    async fn deliver(&self, outbound: Vec<Outbound>) {
        join_all(outbound.into_iter().map(|message| self.send(message))).await;
    }

    async fn send(&self, message: Outbound) -> bool {
        let Some(address) = self.peers.read().get(message.recipient()).cloned() else {
            log::warn(&cformat!(
                "No address known for <bold>{}</bold>.",
                message.recipient()
            ));
            return false;
        };

        let me = self.id().clone();
        let rpc = match &message {
            Outbound::Request { request, .. } => Rpc::ReceiveRequest {
                timestamp: request.timestamp,
                from: request.participant.clone(),
            },
            Outbound::Ok { timestamp, .. } => Rpc::ReceiveOk {
                from: me.clone(),
                timestamp: *timestamp,
            },
            Outbound::Release { .. } => Rpc::ReceiveRelease { from: me.clone() },
        };

        let delivered = self.caller.notify(&address, rpc).await;
        if let Outbound::Ok { to, .. } = message {
            let signal = Rpc::OkSignal { from: me, to };
            self.caller.notify(&self.server_address, signal).await;
        }
        delivered
    }

    async fn dispatch(&self, rpc: Rpc) -> Reply {
        match rpc {
            Rpc::RequestEntry => {
                log::info(&cformat!(
                    "<bold>{}</bold> may now request the critical section.",
                    self.id()
                ));
                self.may_request.notify_one();
                Reply::Ack
            }
            Rpc::Register {
                participant,
                address,
            } => {
                if participant != *self.id() {
                    self.add_peer(participant, address);
                }
                Reply::Ack
            }
            Rpc::ReceiveRequest { timestamp, from } => {
                if let Some(ok) = self.mutex.receive_request(Request::new(timestamp, from)) {
                    self.send(ok).await;
                }
                Reply::Ack
            }
            Rpc::ReceiveOk { from, timestamp } => {
                self.mutex.receive_ok(&from, timestamp);
                Reply::Ack
            }
            Rpc::ReceiveRelease { from } => {
                self.mutex.receive_release(&from);
                Reply::Ack
            }
            Rpc::ShowResults { rows } => {
                log::info(&cformat!(
                    "<bold>{}</bold> received results for <bold>{}</bold> student(s).",
                    self.id(),
                    rows.len()
                ));
                *self.results.lock() = rows;
                self.results_shown.notify_waiters();
                Reply::Ack
            }
            other => match self.clock.handle_clock(other).await {
                Ok(reply) => reply,
                Err(other) => Reply::unsupported(&other),
            },
        }
    }
}

impl Handler for StudentNode {
    fn handle(&self, rpc: Rpc) -> BoxFuture<'_, Reply> {
        self.dispatch(rpc).boxed()
    }
}

pub(crate) fn unexpected(peer: &str, reply: &Reply) -> Error {
    Error::UnexpectedReply {
        peer: peer.to_string(),
        reply: format!("{reply:?}"),
    }
}
