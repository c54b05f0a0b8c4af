use clap::{Parser, Subcommand};
use color_print::cformat;
use exam_coordinator::{
    admission::AnswerKeyGrader,
    backup::BackupNode,
    clock::LocalClock,
    config::ClusterConfig,
    lock::ChunkLockManager,
    log,
    peer::{ClockNode, StudentNode},
    replication::{ReplicatedTable, ReplicationDirectory},
    server::{ServerNode, TableClient},
    store::{Fields, JsonFileStore},
    transport::{serve, Caller, TcpTransport},
    ParticipantId, Reply, Result, Rpc,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};

#[derive(Parser, Debug)]
#[command(name = "exam-node", about = "Runs one node of the exam cluster")]
struct Args {
    /// Cluster configuration (JSON); defaults apply when the file is missing.
    #[arg(long, default_value = "cluster.json")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Coordinating server and primary submission desk.
    Server,
    /// Secondary submission desk.
    Backup,
    /// A student: registers, enters its mark under mutual exclusion, submits answers.
    Student {
        #[arg(long)]
        id: String,
        #[arg(long)]
        listen: String,
        #[arg(long, allow_hyphen_values = true)]
        mark: i64,
        /// Answers as `question=option`, repeatable.
        #[arg(long = "answer", value_parser = parse_answer)]
        answers: Vec<(u32, u32)>,
        /// Seconds this node's clock is off before synchronisation.
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        skew: f64,
    },
    /// A bare clock participant listed in the configuration.
    Clock {
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        skew: f64,
    },
    /// Operator commands sent to the server.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand, Debug)]
enum AdminAction {
    Sync,
    StartIsa,
    Replicate {
        #[arg(long, default_value_t = 2)]
        factor: usize,
    },
    Announce,
    Registry,
    Read {
        chunk: String,
        id: String,
    },
    Write {
        chunk: String,
        id: String,
        field: String,
        value: String,
    },
}

fn parse_answer(raw: &str) -> std::result::Result<(u32, u32), String> {
    let (question, option) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected question=option, got {raw}"))?;
    let question = question.trim().parse().map_err(|e| format!("{e}"))?;
    let option = option.trim().parse().map_err(|e| format!("{e}"))?;
    Ok((question, option))
}

async fn run_server(config: ClusterConfig, caller: Caller) -> Result<()> {
    let directory = ReplicationDirectory::load_or_empty(&config.metadata_path)?;
    let locks = Arc::new(ChunkLockManager::new(directory));
    let store = Arc::new(JsonFileStore::new(&config.store_path));
    let table = ReplicatedTable::new(store, locks);

    let address = config.server_address.clone();
    let node = ServerNode::new(
        config,
        caller,
        LocalClock::system(0.0),
        table,
        Arc::new(AnswerKeyGrader::default()),
    );
    serve(&address, Arc::new(node)).await
}

async fn run_student(
    config: ClusterConfig,
    caller: Caller,
    id: String,
    listen: String,
    mark: i64,
    answers: Vec<(u32, u32)>,
    skew: f64,
) -> Result<()> {
    let node = Arc::new(StudentNode::new(
        ParticipantId::from(id),
        listen.clone(),
        LocalClock::system(skew),
        &config,
        caller,
    ));
    let server = tokio::spawn(serve_owned(listen, Arc::clone(&node)));

    node.register().await?;
    node.wait_for_permission().await;
    node.enter_mark(mark).await?;

    if !answers.is_empty() {
        let (value, desk) = node.submit(answers.into_iter().collect()).await?;
        log::info(&cformat!("Final grade <bold>{value}</bold> ({desk:?} desk)."));
    }

    let results = node.wait_for_results().await;
    for row in &results {
        log::info(&format!("{}: {:?}", row.id, row.fields));
    }

    server.await.map_err(|e| exam_coordinator::Error::Call {
        peer: node.address().to_string(),
        reason: e.to_string(),
    })?
}

async fn serve_owned(address: String, node: Arc<StudentNode>) -> Result<()> {
    serve(&address, node).await
}

async fn run_admin(config: ClusterConfig, caller: Caller, action: AdminAction) -> Result<()> {
    let server = config.server_address.clone();
    let rpc = match action {
        AdminAction::Sync => Rpc::StartSynchronization,
        AdminAction::StartIsa => Rpc::StartIsa,
        AdminAction::Replicate { factor } => Rpc::CreateReplication { factor },
        AdminAction::Announce => Rpc::AnnounceResults,
        AdminAction::Registry => Rpc::Registry,
        AdminAction::Read { chunk, id } => {
            let table = TableClient::new("admin".into(), server, caller.with_timeout(config.lock_timeout()));
            let record = table.read(&chunk, &id.into()).await?;
            log::info(&format!("{record:?}"));
            return Ok(());
        }
        AdminAction::Write {
            chunk,
            id,
            field,
            value,
        } => {
            let table = TableClient::new("admin".into(), server, caller.with_timeout(config.lock_timeout()));
            table
                .write(&chunk, &id.into(), Fields::from([(field, value)]))
                .await?;
            log::info("Record updated.");
            return Ok(());
        }
    };

    // a clock round waits for the collection timeout on the server side
    let caller = caller.with_timeout(config.collect_timeout() + config.retry_policy().timeout);
    match caller.call(&server, rpc).await.into_reply(&server)? {
        Reply::Registry(students) => {
            for (id, address) in students {
                log::info(&cformat!("<bold>{id}</bold> at {address}"));
            }
        }
        reply => log::info(&format!("{reply:?}")),
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    let caller = Caller::new(Arc::new(TcpTransport), config.retry_policy());

    match args.cmd {
        Command::Server => {
            log::init("server");
            run_server(config, caller).await
        }
        Command::Backup => {
            log::init("backup");
            let address = config.backup_address.clone();
            let node = BackupNode::new(
                config.server_address.clone(),
                caller,
                Arc::new(AnswerKeyGrader::default()),
            );
            serve(&address, Arc::new(node)).await
        }
        Command::Student {
            id,
            listen,
            mark,
            answers,
            skew,
        } => {
            log::init(&format!("student-{id}"));
            run_student(config, caller, id, listen, mark, answers, skew).await
        }
        Command::Clock { id, skew } => {
            log::init(&id);
            let id = ParticipantId::from(id);
            let address = config.clock_participants.get(&id).cloned().ok_or_else(|| {
                exam_coordinator::Error::Config(format!("no address configured for clock node {id}"))
            })?;
            let node = ClockNode::new(id, LocalClock::system(skew), config.server_address.clone(), caller);
            serve(&address, Arc::new(node)).await
        }
        Command::Admin { action } => {
            log::init("admin");
            run_admin(config, caller, action).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error(&format!("{e}"));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_parse_as_question_option_pairs() {
        assert_eq!(parse_answer("4=3"), Ok((4, 3)));
        assert!(parse_answer("4").is_err());
        assert!(parse_answer("x=1").is_err());
    }

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
