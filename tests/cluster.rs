//! Whole-cluster scenarios over the in-process transport.

use exam_coordinator::{
    admission::AnswerKeyGrader,
    backup::BackupNode,
    clock::LocalClock,
    config::ClusterConfig,
    lock::{ChunkKey, ChunkLockManager, ChunkLockState, LockBusy, LockMode},
    message::{Desk, Record, Submission},
    mutex::MutexState,
    peer::{ClockNode, StudentNode},
    replication::ReplicatedTable,
    server::{ServerNode, TableClient, CLOCK_SYNC_PHASE, ISA_PHASE},
    store::{Fields, MemoryStore, RecordStore},
    transport::{Caller, Handler, InProcessTransport, RetryPolicy},
    ParticipantId, Reply, Rpc,
};
use futures::{future::BoxFuture, FutureExt};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::time::{timeout, Instant};

struct Cluster {
    config: ClusterConfig,
    transport: Arc<InProcessTransport>,
    caller: Caller,
    server: Arc<ServerNode>,
    backup: Arc<BackupNode>,
    store: Arc<MemoryStore>,
    clocks: Vec<Arc<ClockNode>>,
    students: Vec<Arc<StudentNode>>,
    _dir: TempDir,
}

fn config(dir: &Path) -> ClusterConfig {
    let mut config = ClusterConfig {
        server_address: "server".to_string(),
        backup_address: "backup".to_string(),
        clock_participants: BTreeMap::from([
            ("teacher".into(), "teacher".to_string()),
            ("client".into(), "client".to_string()),
        ]),
        metadata_path: dir.join("replication_metadata.json"),
        replica_dir: dir.to_path_buf(),
        ..ClusterConfig::default()
    };
    config.rpc.timeout_ms = 1000;
    config.rpc.attempts = 2;
    config.rpc.backoff_ms = 5;
    config.sync.collect_timeout_ms = 500;
    config.mutex.rebroadcast_after_ms = 1000;
    config
}

async fn cluster(students: usize) -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let transport = Arc::new(InProcessTransport::new());
    let caller = Caller::new(transport.clone(), config.retry_policy());

    let store = Arc::new(MemoryStore::new((1..=5).map(|n| {
        Record::new(n.to_string().into()).with_field("name", format!("Student{n}"))
    })));
    let table = ReplicatedTable::new(store.clone(), Arc::new(ChunkLockManager::default()));
    let server = Arc::new(ServerNode::new(
        config.clone(),
        caller.clone(),
        LocalClock::frozen(100.0),
        table,
        Arc::new(AnswerKeyGrader::default()),
    ));
    transport.register("server", server.clone());

    let backup = Arc::new(BackupNode::new(
        "server".to_string(),
        caller.clone(),
        Arc::new(AnswerKeyGrader::default()),
    ));
    transport.register("backup", backup.clone());

    let clocks: Vec<Arc<ClockNode>> = [("teacher", 103.0), ("client", 98.0)]
        .into_iter()
        .map(|(id, reading)| {
            let node = Arc::new(ClockNode::new(
                id.into(),
                LocalClock::frozen(reading),
                "server".to_string(),
                caller.clone(),
            ));
            transport.register(id, node.clone());
            node
        })
        .collect();

    let mut nodes = Vec::new();
    for n in 1..=students {
        let address = format!("student-{n}");
        let node = Arc::new(StudentNode::new(
            n.to_string().into(),
            address.clone(),
            LocalClock::frozen(100.0),
            &config,
            caller.clone(),
        ));
        transport.register(address, node.clone());
        node.register().await.unwrap();
        nodes.push(node);
    }

    Cluster {
        config,
        transport,
        caller,
        server,
        backup,
        store,
        clocks,
        students: nodes,
        _dir: dir,
    }
}

/// Swallows the first call of one method, like a link that lost a message.
struct DropFirst {
    inner: Arc<StudentNode>,
    method: &'static str,
    dropped: AtomicBool,
}

impl Handler for DropFirst {
    fn handle(&self, rpc: Rpc) -> BoxFuture<'_, Reply> {
        if rpc.method() == self.method && !self.dropped.swap(true, Ordering::SeqCst) {
            return futures::future::ready(Reply::Ack).boxed();
        }
        self.inner.handle(rpc)
    }
}

/// Two registered students re-sending after 100ms; student `lossy` loses
/// its first incoming `method` call.
async fn lossy_students(
    cluster: &Cluster,
    lossy: usize,
    method: &'static str,
) -> Vec<Arc<StudentNode>> {
    let mut config = cluster.config.clone();
    config.mutex.rebroadcast_after_ms = 100;

    let mut nodes = Vec::new();
    for n in 1..=2 {
        let address = format!("student-{n}");
        let node = Arc::new(StudentNode::new(
            n.to_string().into(),
            address.clone(),
            LocalClock::frozen(100.0),
            &config,
            cluster.caller.clone(),
        ));
        if n == lossy {
            let link = DropFirst {
                inner: Arc::clone(&node),
                method,
                dropped: AtomicBool::new(false),
            };
            cluster.transport.register(address, Arc::new(link));
        } else {
            cluster.transport.register(address, node.clone());
        }
        node.register().await.unwrap();
        nodes.push(node);
    }
    nodes
}

fn submission(id: &str) -> Submission {
    Submission {
        participant: id.into(),
        answers: BTreeMap::from([(1, 2), (2, 2), (3, 1)]),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn marks_are_entered_one_at_a_time() {
    let cluster = cluster(3).await;
    for student in &cluster.students {
        assert_eq!(student.mutex().participants().len(), 3);
    }

    let inside = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = cluster
        .students
        .iter()
        .map(|student| {
            let student = Arc::clone(student);
            let inside = Arc::clone(&inside);
            let most = Arc::clone(&most);
            tokio::spawn(async move {
                student.wait_for_permission().await;
                student.request_entry().await.unwrap();

                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                most.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);

                student.exit_cs().await.unwrap();
            })
        })
        .collect();

    assert_eq!(cluster.server.start_isa().await, 3);
    let finished = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(tasks))
        .await
        .expect("every student should get through the critical section");
    assert!(finished.iter().all(Result::is_ok));

    assert_eq!(most.load(Ordering::SeqCst), 1);
    assert!(cluster.server.request_queue().is_empty());
    for student in &cluster.students {
        assert_eq!(student.mutex().state(), MutexState::Idle);
        assert!(student.mutex().queue().is_empty());
        assert_eq!(student.clock().phases(), [ISA_PHASE]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn marks_reach_every_replica_and_every_student() {
    let cluster = cluster(3).await;
    cluster.server.create_replication(2).unwrap();

    let tasks: Vec<_> = cluster
        .students
        .iter()
        .enumerate()
        .map(|(n, student)| {
            let student = Arc::clone(student);
            tokio::spawn(async move {
                student.wait_for_permission().await;
                student.enter_mark(10 * (n as i64 + 1)).await.unwrap();
            })
        })
        .collect();
    cluster.server.start_isa().await;
    tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(tasks))
        .await
        .unwrap();

    let row = cluster.store.read(&"2".into()).unwrap().unwrap();
    assert_eq!(row.field("isa"), Some("20"));
    for (_, location) in cluster.server.table().locks().directory().replicas_of("chunk1") {
        let copy = cluster.store.read_location(&location.path).unwrap();
        let isa: Vec<Option<&str>> = copy.rows.iter().map(|r| r.field("isa")).collect();
        assert_eq!(isa, [Some("10"), Some("20"), Some("30")]);
    }

    assert_eq!(cluster.server.announce_results().await.unwrap(), 3);
    for student in &cluster.students {
        let results = student.wait_for_results().await;
        assert_eq!(results.len(), 5);
    }
}

#[tokio::test]
async fn clock_round_converges_on_the_average() {
    let cluster = cluster(0).await;
    let outcome = cluster.server.run_synchronization().await;

    assert!(!outcome.is_degraded());
    assert_eq!(outcome.reported, 3);
    assert!((outcome.average - 1.0 / 3.0).abs() < 1e-9);

    let expected = 100.0 + 1.0 / 3.0;
    assert!((cluster.server.clock().now() - expected).abs() < 1e-9);
    for clock in &cluster.clocks {
        assert!((clock.clock().now() - expected).abs() < 1e-9, "{:?}", clock.id());
        assert_eq!(clock.phases(), [CLOCK_SYNC_PHASE]);
    }
}

#[tokio::test]
async fn silent_clock_degrades_the_round() {
    let cluster = cluster(0).await;
    cluster.transport.detach("client");

    let outcome = cluster.server.run_synchronization().await;
    assert!(outcome.is_degraded());
    assert_eq!((outcome.reported, outcome.expected), (2, 3));
    // server at 0, teacher at +3
    assert!((cluster.clocks[0].clock().now() - 101.5).abs() < 1e-9);
    assert!((cluster.server.clock().now() - 101.5).abs() < 1e-9);
}

#[tokio::test]
async fn overflow_is_graded_by_the_backup_exactly_once() {
    let cluster = cluster(0).await;

    let mut desks = Vec::new();
    for id in ["1", "2", "3", "4", "5"] {
        match cluster.server.submit(submission(id)).await {
            Reply::Finalized { value, desk, .. } => {
                assert_eq!(value, 20);
                desks.push(desk);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
    assert_eq!(
        desks,
        [Desk::Primary, Desk::Primary, Desk::Primary, Desk::Secondary, Desk::Secondary]
    );
    assert_eq!(cluster.backup.ledger().len(), 2);
    assert_eq!(cluster.server.ledger().len(), 5);
    for id in ["1", "4", "5"] {
        let row = cluster.store.read(&id.into()).unwrap().unwrap();
        assert_eq!(row.field("mcq"), Some("20"));
    }

    // a late duplicate keeps the first grade and desk
    let again = cluster.server.submit(submission("4")).await;
    assert_eq!(
        again,
        Reply::Finalized {
            participant: "4".into(),
            value: 20,
            desk: Desk::Secondary
        }
    );
    assert_eq!(cluster.backup.ledger().len(), 2);
}

#[tokio::test]
async fn unreachable_backup_falls_back_to_the_primary() {
    let cluster = cluster(0).await;
    cluster.transport.detach("backup");

    let mut desks = Vec::new();
    for id in ["1", "2", "3", "4"] {
        if let Reply::Finalized { desk, .. } = cluster.server.submit(submission(id)).await {
            desks.push(desk);
        }
    }
    assert_eq!(desks, [Desk::Primary; 4]);
    assert_eq!(
        cluster.store.read(&"4".into()).unwrap().unwrap().field("mcq"),
        Some("20")
    );
}

#[tokio::test]
async fn remote_writers_see_busy_chunks() {
    let cluster = cluster(0).await;
    let locks = cluster.server.table().locks();
    let client = TableClient::new(
        "teacher".into(),
        "server".to_string(),
        cluster.caller.with_timeout(Duration::from_secs(5)),
    );
    let grade = Fields::from([("isa".to_string(), "15".to_string())]);
    let reader = ParticipantId::from("2");

    locks.acquire_read("chunk1", &reader).await;
    let refused = client.try_write("chunk1", &"1".into(), grade.clone()).await.unwrap();
    assert_eq!(refused, Err(LockBusy::BeingRead));
    locks.release_read("chunk1", &reader);

    client.try_write("chunk1", &"1".into(), grade).await.unwrap().unwrap();
    let record = client.read("chunk1", &"1".into()).await.unwrap().unwrap();
    assert_eq!(record.field("isa"), Some("15"));
    assert!(!locks.snapshot(&ChunkKey::logical("chunk1")).writer_active);
}

#[tokio::test]
async fn unknown_addresses_are_peer_errors() {
    let transport = Arc::new(InProcessTransport::new());
    let caller = Caller::new(
        transport,
        RetryPolicy {
            timeout: Duration::from_millis(50),
            attempts: 1,
            backoff: Duration::from_millis(1),
        },
    );
    let student = StudentNode::new(
        "1".into(),
        "student-1".to_string(),
        LocalClock::frozen(0.0),
        &ClusterConfig::default(),
        caller,
    );
    assert!(student.register().await.is_err());
}

#[tokio::test]
async fn lost_request_is_sent_again() {
    let cluster = cluster(0).await;
    let students = lossy_students(&cluster, 2, "receive_request").await;
    let (one, two) = (&students[0], &students[1]);

    let started = Instant::now();
    timeout(Duration::from_secs(5), one.request_entry())
        .await
        .expect("the re-sent request should be granted")
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(one.mutex().state(), MutexState::InCs);
    assert_eq!(two.mutex().queue().len(), 1);

    one.exit_cs().await.unwrap();
    assert!(two.mutex().queue().is_empty());
    timeout(Duration::from_secs(5), two.request_entry())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one.mutex().state(), MutexState::Idle);
    two.exit_cs().await.unwrap();
}

#[tokio::test]
async fn lost_ok_is_granted_again_for_the_same_request() {
    let cluster = cluster(0).await;
    let students = lossy_students(&cluster, 1, "receive_ok").await;
    let (one, two) = (&students[0], &students[1]);

    timeout(Duration::from_secs(5), one.request_entry())
        .await
        .expect("the duplicate request should be answered")
        .unwrap();
    assert_eq!(one.mutex().state(), MutexState::InCs);
    // the duplicate did not add a second queue entry
    assert_eq!(two.mutex().queue().len(), 1);
    assert_eq!(two.mutex().state(), MutexState::Idle);
    one.exit_cs().await.unwrap();
}

#[tokio::test]
async fn reports_tagged_with_an_old_round_are_ignored() {
    let cluster = cluster(0).await;
    assert!(!cluster.server.run_synchronization().await.is_degraded());

    cluster.transport.detach("client");
    let server = Arc::clone(&cluster.server);
    let round = tokio::spawn(async move { server.run_synchronization().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let late = Rpc::ReportLocalTime {
        from: "client".into(),
        round: 1,
        delta: 50.0,
    };
    assert_eq!(cluster.server.handle(late).await, Reply::Ack);

    let outcome = round.await.unwrap();
    assert!(outcome.is_degraded());
    assert_eq!((outcome.reported, outcome.expected), (2, 3));
}

#[tokio::test]
async fn record_access_requires_the_matching_chunk_lock() {
    let cluster = cluster(0).await;
    let locks = cluster.server.table().locks();
    let holder = ParticipantId::from("A");
    let update = |who: &str, id: &str| Rpc::UpdateRecord {
        chunk: "chunk1".to_string(),
        who: who.into(),
        id: id.into(),
        fields: Fields::from([("isa".to_string(), "99".to_string())]),
    };

    // nobody holds chunk1 yet
    assert!(matches!(cluster.server.handle(update("A", "1")).await, Reply::Err(_)));

    locks.acquire_write("chunk1", &holder).await;
    assert!(matches!(cluster.server.handle(update("B", "1")).await, Reply::Err(_)));
    // "4" lives in chunk2
    assert!(matches!(cluster.server.handle(update("A", "4")).await, Reply::Err(_)));
    let read_without_lock = Rpc::ReadRecord {
        chunk: "chunk1".to_string(),
        who: "B".into(),
        id: "1".into(),
    };
    assert!(matches!(cluster.server.handle(read_without_lock).await, Reply::Err(_)));
    assert_eq!(cluster.store.read(&"1".into()).unwrap().unwrap().field("isa"), None);

    assert_eq!(cluster.server.handle(update("A", "1")).await, Reply::Ack);
    locks.release_write("chunk1", &holder);
    assert_eq!(
        cluster.store.read(&"1".into()).unwrap().unwrap().field("isa"),
        Some("99")
    );
}

#[tokio::test]
async fn undelivered_grants_are_released() {
    let cluster = cluster(0).await;
    let acquire = Rpc::AcquireWrite {
        chunk: "chunk1".to_string(),
        who: "A".into(),
    };
    assert_eq!(cluster.server.handle(acquire.clone()).await, Reply::Granted);
    let locks = cluster.server.table().locks();
    assert!(locks.holds("chunk1", &"A".into(), LockMode::Write));

    cluster.server.reply_lost(&acquire, &Reply::Granted);
    assert!(!locks.holds("chunk1", &"A".into(), LockMode::Write));
    assert_eq!(locks.snapshot(&ChunkKey::logical("chunk1")), ChunkLockState::default());
}

#[tokio::test]
async fn abandoned_remote_write_leaves_the_chunk_free() {
    let cluster = cluster(0).await;
    let locks = cluster.server.table().locks();
    let reader = ParticipantId::from("2");
    locks.acquire_read("chunk1", &reader).await;

    let impatient = TableClient::new(
        "teacher".into(),
        "server".to_string(),
        cluster.caller.with_timeout(Duration::from_millis(50)),
    );
    let grade = Fields::from([("isa".to_string(), "11".to_string())]);
    assert!(impatient.write("chunk1", &"1".into(), grade.clone()).await.is_err());

    locks.release_read("chunk1", &reader);
    assert_eq!(locks.snapshot(&ChunkKey::logical("chunk1")), ChunkLockState::default());

    let patient = TableClient::new(
        "client".into(),
        "server".to_string(),
        cluster.caller.with_timeout(Duration::from_secs(5)),
    );
    timeout(Duration::from_secs(5), patient.write("chunk1", &"1".into(), grade))
        .await
        .unwrap()
        .unwrap();
}
