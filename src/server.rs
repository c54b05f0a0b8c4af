//! The coordinating server: registry, global request queue view, clock
//! authority, chunk lock service and primary submission desk.

use crate::{
    admission::{AdmissionController, FinalizationLedger, Grader, Route},
    berkeley::{ClockSyncCoordinator, RoundOutcome},
    clock::LocalClock,
    config::ClusterConfig,
    error::Result,
    lock::{LockBusy, LockMode},
    log,
    message::{Desk, ParticipantId, Record, Reply, Request, Rpc, Submission},
    peer::unexpected,
    replication::{default_chunk_map, ReplicatedTable},
    store::Fields,
    transport::{CallOutcome, Caller, Handler},
};
use color_print::cformat;
use futures::{future::{join_all, BoxFuture}, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub const CLOCK_SYNC_PHASE: &str = "Berkeley Clock Synchronization";
pub const ISA_PHASE: &str = "Ricart-Agrawala ISA";

/// The server's view of who wants, holds, and has finished the critical section.
#[derive(Debug, Default)]
struct IntentBook {
    queue: BTreeSet<Request>,
    // target -> peers that granted it an OK
    oks: BTreeMap<ParticipantId, BTreeSet<ParticipantId>>,
    completed: BTreeSet<ParticipantId>,
    announced: bool,
}

#[derive(Debug)]
pub struct ServerNode {
    id: ParticipantId,
    config: ClusterConfig,
    caller: Caller,
    clock: LocalClock,
    registry: RwLock<BTreeMap<ParticipantId, String>>,
    intents: Mutex<IntentBook>,
    // number and collector of the latest clock round
    round: RwLock<Option<(u64, Arc<ClockSyncCoordinator>)>>,
    table: ReplicatedTable,
    admission: AdmissionController,
    ledger: FinalizationLedger,
    grader: Arc<dyn Grader>,
}

impl ServerNode {
    pub fn new(
        config: ClusterConfig,
        caller: Caller,
        clock: LocalClock,
        table: ReplicatedTable,
        grader: Arc<dyn Grader>,
    ) -> Self {
        Self {
            id: ParticipantId::from("server"),
            admission: AdmissionController::new(config.admission.clone()),
            config,
            caller,
            clock,
            registry: RwLock::new(BTreeMap::new()),
            intents: Mutex::new(IntentBook::default()),
            round: RwLock::new(None),
            table,
            ledger: FinalizationLedger::new(),
            grader,
        }
    }

    pub fn table(&self) -> &ReplicatedTable {
        &self.table
    }

    pub fn ledger(&self) -> &FinalizationLedger {
        &self.ledger
    }

    pub fn clock(&self) -> &LocalClock {
        &self.clock
    }

    pub fn registry(&self) -> BTreeMap<ParticipantId, String> {
        self.registry.read().clone()
    }

    /// The global request queue as the server last heard it, earliest first.
    pub fn request_queue(&self) -> Vec<Request> {
        self.intents.lock().queue.iter().cloned().collect()
    }

    fn address_of(&self, participant: &ParticipantId) -> Option<String> {
        self.registry
            .read()
            .get(participant)
            .or_else(|| self.config.clock_participants.get(participant))
            .cloned()
    }

    /// Sends `rpc` to every target and returns the number of successful deliveries.
    async fn broadcast(&self, targets: Vec<(ParticipantId, String)>, rpc: Rpc) -> usize {
        let calls = targets.iter().map(|(_, address)| self.caller.notify(address, rpc.clone()));
        join_all(calls).await.into_iter().filter(|ok| *ok).count()
    }

    fn students(&self) -> Vec<(ParticipantId, String)> {
        self.registry
            .read()
            .iter()
            .map(|(id, address)| (id.clone(), address.clone()))
            .collect()
    }

    async fn register(&self, participant: ParticipantId, address: String) -> Reply {
        let (others, registry) = {
            let mut registry = self.registry.write();
            registry.insert(participant.clone(), address.clone());
            let others: Vec<(ParticipantId, String)> = registry
                .iter()
                .filter(|(id, _)| **id != participant)
                .map(|(id, address)| (id.clone(), address.clone()))
                .collect();
            (others, registry.clone())
        };

        log::info(&cformat!(
            "Registered <bold>{participant}</bold> at <bold>{address}</bold> ({} student(s)).",
            registry.len()
        ));
        self.broadcast(others, Rpc::Register { participant, address })
            .await;
        Reply::Registry(registry)
    }

    fn register_intent(&self, timestamp: u64, from: ParticipantId) {
        let mut intents = self.intents.lock();
        intents.queue.insert(Request::new(timestamp, from));
        log::info(&format!("Request queue: {}", render_queue(&intents.queue)));
    }

    fn ok_signal(&self, from: ParticipantId, to: ParticipantId) {
        let needed = self.registry.read().len().saturating_sub(1);
        let mut intents = self.intents.lock();
        let granted = intents.oks.entry(to.clone()).or_default();
        granted.insert(from.clone());
        log::info(&cformat!(
            "<bold>{from}</bold> granted OK to <bold>{to}</bold> ({}/{needed}).",
            granted.len()
        ));
    }

    async fn exit_cs(&self, from: ParticipantId) {
        let everyone_done = {
            let students: BTreeSet<ParticipantId> = self.registry.read().keys().cloned().collect();
            let mut intents = self.intents.lock();
            intents.queue.retain(|r| r.participant != from);
            intents.oks.remove(&from);
            intents.completed.insert(from.clone());
            log::info(&cformat!(
                "<bold>{from}</bold> left the critical section. Request queue: {}",
                render_queue(&intents.queue)
            ));

            let done = !intents.announced && students.is_subset(&intents.completed);
            if done {
                intents.announced = true;
            }
            done
        };

        if everyone_done {
            let phase = Rpc::PhaseComplete {
                phase: ISA_PHASE.to_string(),
            };
            self.broadcast(self.students(), phase).await;
        }
    }

    /// Tells every registered student it may request the critical section.
    pub async fn start_isa(&self) -> usize {
        let students = self.students();
        log::info(&cformat!(
            "Starting the ISA for <bold>{}</bold> student(s).",
            students.len()
        ));
        self.broadcast(students, Rpc::RequestEntry).await
    }

    /// One Berkeley round over the configured clock participants and every
    /// registered student.
    pub async fn run_synchronization(&self) -> RoundOutcome {
        let participants: Vec<ParticipantId> = self
            .config
            .clock_participants
            .keys()
            .chain(self.registry.read().keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let sync = Arc::new(ClockSyncCoordinator::new(
            self.id.clone(),
            participants,
            self.config.collect_timeout(),
        ));
        sync.begin_round();
        let round = {
            let mut current = self.round.write();
            let round = current.as_ref().map_or(1, |(n, _)| n + 1);
            *current = Some((round, Arc::clone(&sync)));
            round
        };

        let reference = self.clock.now();
        log::info(&cformat!(
            "Starting clock sync with reference <bold>{reference:.3}</bold> for <bold>{}</bold> node(s).",
            sync.expected()
        ));
        for participant in sync.participants() {
            let Some(address) = self.address_of(participant) else {
                log::warn(&cformat!("No address known for <bold>{participant}</bold>."));
                continue;
            };
            let caller = self.caller.clone();
            tokio::spawn(async move {
                caller
                    .notify(&address, Rpc::CalculateOffset { round, reference })
                    .await;
            });
        }

        let outcome = sync.collect().await;

        let mut targets = Vec::new();
        for (node, delta) in &outcome.adjustments {
            if *node == self.id {
                self.clock.apply_adjustment(*delta);
                continue;
            }
            if let Some(address) = self.address_of(node) {
                targets.push((address, Rpc::ApplyAdjustment { delta: *delta }));
            }
        }
        join_all(
            targets
                .iter()
                .map(|(address, rpc)| self.caller.notify(address, rpc.clone())),
        )
        .await;

        let everyone: Vec<(ParticipantId, String)> = sync
            .participants()
            .iter()
            .filter_map(|p| self.address_of(p).map(|a| (p.clone(), a)))
            .collect();
        let phase = Rpc::PhaseComplete {
            phase: CLOCK_SYNC_PHASE.to_string(),
        };
        self.broadcast(everyone, phase).await;
        outcome
    }

    fn report_local_time(&self, from: ParticipantId, round: u64, delta: f64) {
        match self.round.read().as_ref() {
            Some((current, sync)) if *current == round => {
                sync.report(from, delta);
            }
            _ => log::warn(&cformat!(
                "Clock delta from <bold>{from}</bold> for round {round} arrived outside that round."
            )),
        }
    }

    async fn record_mark(&self, from: ParticipantId, value: i64) -> Result<()> {
        let fields = Fields::from([("isa".to_string(), value.to_string())]);
        self.table.write_record(&self.id, &from, &fields).await?;
        log::info(&cformat!("Recorded mark <bold>{value}</bold> for <bold>{from}</bold>."));
        Ok(())
    }

    /// Routes a final submission to this desk or the secondary one.
    pub async fn submit(&self, submission: Submission) -> Reply {
        let who = submission.participant.clone();
        if let Some(done) = self.ledger.get(&who) {
            return finalized(who, done.value, done.desk);
        }

        match self.admission.admit(&who) {
            Route::Primary(_permit) => self.finalize_locally(&submission).await,
            Route::Secondary => {
                let backup = self.config.backup_address.clone();
                let forward = Rpc::SubmitForFinalization {
                    submission: submission.clone(),
                };
                match self.caller.call(&backup, forward).await {
                    CallOutcome::Delivered(Reply::Finalized { value, .. }) => {
                        // the push-back normally arrived first; this only fills a lost push
                        self.accept_pushed(who, value).await
                    }
                    outcome => {
                        log::error(&cformat!(
                            "Forwarding <bold>{who}</bold> to the backup failed ({outcome:?}); grading locally."
                        ));
                        self.finalize_locally(&submission).await
                    }
                }
            }
        }
    }

    async fn finalize_locally(&self, submission: &Submission) -> Reply {
        let who = submission.participant.clone();
        let finalization = self
            .ledger
            .finalize_with(&who, Desk::Primary, || self.grader.grade(submission));
        let done = finalization.finalized();

        if !finalization.is_duplicate() {
            if let Err(e) = self.persist_grade(&who, done.value).await {
                return Reply::Err(e.to_string());
            }
        }
        finalized(who, done.value, done.desk)
    }

    /// Records a grade computed by the secondary desk; duplicates are ignored.
    async fn accept_pushed(&self, participant: ParticipantId, value: i64) -> Reply {
        let finalization = self.ledger.accept_pushed(&participant, value);
        let done = finalization.finalized();
        if !finalization.is_duplicate() {
            if let Err(e) = self.persist_grade(&participant, value).await {
                return Reply::Err(e.to_string());
            }
        }
        finalized(participant, done.value, done.desk)
    }

    async fn persist_grade(&self, who: &ParticipantId, value: i64) -> Result<()> {
        let fields = Fields::from([("mcq".to_string(), value.to_string())]);
        self.table.write_record(&self.id, who, &fields).await
    }

    /// Builds replica copies of the current table and starts locking them.
    pub fn create_replication(&self, factor: usize) -> Result<()> {
        self.table.provision(
            factor,
            &default_chunk_map(),
            &self.config.replica_dir,
            &self.config.metadata_path,
        )?;
        Ok(())
    }

    /// Sends the authoritative table to every registered student.
    pub async fn announce_results(&self) -> Result<usize> {
        let rows = self.table.store().read_all()?;
        Ok(self.broadcast(self.students(), Rpc::ShowResults { rows }).await)
    }

    async fn dispatch(&self, rpc: Rpc) -> Reply {
        let locks = self.table.locks();
        match rpc {
            Rpc::Register {
                participant,
                address,
            } => self.register(participant, address).await,
            Rpc::Registry => Reply::Registry(self.registry()),
            Rpc::RegisterIntent { timestamp, from } => {
                self.register_intent(timestamp, from);
                Reply::Ack
            }
            Rpc::OkSignal { from, to } => {
                self.ok_signal(from, to);
                Reply::Ack
            }
            Rpc::ExitCs { from } => {
                self.exit_cs(from).await;
                Reply::Ack
            }
            Rpc::RecordMark { from, value } => reply_from(self.record_mark(from, value).await),
            Rpc::ReportLocalTime { from, round, delta } => {
                self.report_local_time(from, round, delta);
                Reply::Ack
            }
            Rpc::AcquireRead { chunk, who } => {
                locks.acquire_read(&chunk, &who).await;
                Reply::Granted
            }
            Rpc::ReleaseRead { chunk, who } => {
                locks.release_read(&chunk, &who);
                Reply::Ack
            }
            Rpc::AcquireWrite { chunk, who } => {
                locks.acquire_write(&chunk, &who).await;
                Reply::Granted
            }
            Rpc::TryAcquireWrite { chunk, who } => match locks.try_acquire_write(&chunk, &who) {
                Ok(_) => Reply::Granted,
                Err(busy) => Reply::Busy(busy),
            },
            Rpc::ReleaseWrite { chunk, who } => {
                locks.release_write(&chunk, &who);
                Reply::Ack
            }
            Rpc::ReadRecord { chunk, who, id } => {
                if let Err(refusal) = self.check_holder(&chunk, &who, &id, &[LockMode::Read, LockMode::Write]) {
                    return refusal;
                }
                match self.table.read_locked(&chunk, &id) {
                    Ok(record) => Reply::Record(record),
                    Err(e) => Reply::Err(e.to_string()),
                }
            }
            Rpc::UpdateRecord {
                chunk,
                who,
                id,
                fields,
            } => {
                if let Err(refusal) = self.check_holder(&chunk, &who, &id, &[LockMode::Write]) {
                    return refusal;
                }
                reply_from(self.table.update_locked(&chunk, &id, &fields))
            }
            Rpc::SubmitForFinalization { submission } => self.submit(submission).await,
            Rpc::PushFinalizedResult { participant, value } => {
                self.accept_pushed(participant, value).await
            }
            Rpc::StartSynchronization => {
                let outcome = self.run_synchronization().await;
                if outcome.is_degraded() {
                    log::warn(&cformat!(
                        "Clock sync finished without <bold>{}</bold> node(s).",
                        outcome.expected - outcome.reported
                    ));
                }
                Reply::Ack
            }
            Rpc::StartIsa => {
                self.start_isa().await;
                Reply::Ack
            }
            Rpc::CreateReplication { factor } => reply_from(self.create_replication(factor)),
            Rpc::AnnounceResults => reply_from(self.announce_results().await.map(|_| ())),
            other => Reply::unsupported(&other),
        }
    }
}

impl ServerNode {
    /// Refuses a record access unless `id` lives in `chunk` and `who` holds
    /// `chunk` in one of `modes`.
    fn check_holder(
        &self,
        chunk: &str,
        who: &ParticipantId,
        id: &ParticipantId,
        modes: &[LockMode],
    ) -> std::result::Result<(), Reply> {
        let owner = self.table.chunk_of(id);
        let reason = if owner != chunk {
            format!("record {id} belongs to {owner}, not {chunk}")
        } else if !modes.iter().any(|mode| self.table.locks().holds(chunk, who, *mode)) {
            format!("{who} does not hold {chunk}")
        } else {
            return Ok(());
        };
        log::warn(&cformat!("Refused a record access: <bold>{reason}</bold>."));
        Err(Reply::Err(reason))
    }
}

impl Handler for ServerNode {
    fn handle(&self, rpc: Rpc) -> BoxFuture<'_, Reply> {
        self.dispatch(rpc).boxed()
    }

    fn reply_lost(&self, rpc: &Rpc, reply: &Reply) {
        if *reply != Reply::Granted {
            return;
        }
        let locks = self.table.locks();
        match rpc {
            Rpc::AcquireRead { chunk, who } => locks.release_read(chunk, who),
            Rpc::AcquireWrite { chunk, who } | Rpc::TryAcquireWrite { chunk, who } => {
                locks.release_write(chunk, who)
            }
            _ => return,
        }
        log::warn(&cformat!(
            "The grant of <bold>{}</bold> never reached its caller; released it.",
            rpc.method()
        ));
    }
}

fn finalized(participant: ParticipantId, value: i64, desk: Desk) -> Reply {
    Reply::Finalized {
        participant,
        value,
        desk,
    }
}

fn reply_from(result: Result<()>) -> Reply {
    match result {
        Ok(()) => Reply::Ack,
        Err(e) => {
            log::error(&format!("{e}"));
            Reply::Err(e.to_string())
        }
    }
}

fn render_queue(queue: &BTreeSet<Request>) -> String {
    let entries: Vec<String> = queue
        .iter()
        .map(|r| format!("({}, {})", r.participant, r.timestamp))
        .collect();
    format!("[{}]", entries.join(", "))
}

/// Remote access to the server's chunk-locked result table.
#[derive(Debug, Clone)]
pub struct TableClient {
    who: ParticipantId,
    server_address: String,
    caller: Caller,
}

impl TableClient {
    /// `caller` should allow for lock waits in its timeout.
    pub fn new(who: ParticipantId, server_address: String, caller: Caller) -> Self {
        Self {
            who,
            server_address,
            caller,
        }
    }

    async fn call(&self, rpc: Rpc) -> Result<Reply> {
        self.caller
            .call(&self.server_address, rpc)
            .await
            .into_reply(&self.server_address)
    }

    // Never retried: a retry would queue a second acquisition behind the first.
    async fn acquire(&self, rpc: Rpc) -> Result<Reply> {
        self.caller
            .call_once(&self.server_address, rpc)
            .await
            .into_reply(&self.server_address)
    }

    /// Reads `id` while holding `chunk`'s read set.
    pub async fn read(&self, chunk: &str, id: &ParticipantId) -> Result<Option<Record>> {
        let chunk = chunk.to_string();
        self.acquire(Rpc::AcquireRead {
            chunk: chunk.clone(),
            who: self.who.clone(),
        })
        .await?;

        let read = self
            .call(Rpc::ReadRecord {
                chunk: chunk.clone(),
                who: self.who.clone(),
                id: id.clone(),
            })
            .await;
        let released = self
            .call(Rpc::ReleaseRead {
                chunk,
                who: self.who.clone(),
            })
            .await;

        match read? {
            Reply::Record(record) => {
                released?;
                Ok(record)
            }
            other => Err(unexpected(&self.server_address, &other)),
        }
    }

    /// Waits for `chunk`'s write set, updates `id` and releases.
    pub async fn write(&self, chunk: &str, id: &ParticipantId, fields: Fields) -> Result<()> {
        self.acquire(Rpc::AcquireWrite {
            chunk: chunk.to_string(),
            who: self.who.clone(),
        })
        .await?;
        self.update_and_release(chunk, id, fields).await
    }

    /// Like [`Self::write`] but gives up at once if the chunk is busy.
    pub async fn try_write(
        &self,
        chunk: &str,
        id: &ParticipantId,
        fields: Fields,
    ) -> Result<std::result::Result<(), LockBusy>> {
        let attempt = Rpc::TryAcquireWrite {
            chunk: chunk.to_string(),
            who: self.who.clone(),
        };
        match self.acquire(attempt).await? {
            Reply::Granted => self.update_and_release(chunk, id, fields).await.map(Ok),
            Reply::Busy(busy) => Ok(Err(busy)),
            other => Err(unexpected(&self.server_address, &other)),
        }
    }

    async fn update_and_release(&self, chunk: &str, id: &ParticipantId, fields: Fields) -> Result<()> {
        let updated = self
            .call(Rpc::UpdateRecord {
                chunk: chunk.to_string(),
                who: self.who.clone(),
                id: id.clone(),
                fields,
            })
            .await;
        let released = self
            .call(Rpc::ReleaseWrite {
                chunk: chunk.to_string(),
                who: self.who.clone(),
            })
            .await;
        updated?;
        released.map(|_| ())
    }
}
