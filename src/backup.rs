use crate::{
    admission::{FinalizationLedger, Grader},
    log,
    message::{Desk, ParticipantId, Reply, Rpc, Submission},
    transport::{Caller, Handler},
};
use color_print::cformat;
use futures::{future::BoxFuture, FutureExt};
use std::sync::Arc;

/// Secondary submission desk: grades forwarded answers and pushes each grade
/// back to the primary's authoritative table.
#[derive(Debug)]
pub struct BackupNode {
    primary_address: String,
    caller: Caller,
    ledger: FinalizationLedger,
    grader: Arc<dyn Grader>,
}

impl BackupNode {
    pub fn new(primary_address: String, caller: Caller, grader: Arc<dyn Grader>) -> Self {
        Self {
            primary_address,
            caller,
            ledger: FinalizationLedger::new(),
            grader,
        }
    }

    pub fn ledger(&self) -> &FinalizationLedger {
        &self.ledger
    }

    pub async fn finalize(&self, submission: Submission) -> Reply {
        let who = submission.participant.clone();
        log::info(&cformat!("Backup received the submission of <bold>{who}</bold>."));

        let finalization = self
            .ledger
            .finalize_with(&who, Desk::Secondary, || self.grader.grade(&submission));
        let done = finalization.finalized();

        if !finalization.is_duplicate() {
            self.push(&who, done.value).await;
        }

        Reply::Finalized {
            participant: who,
            value: done.value,
            desk: done.desk,
        }
    }

    async fn push(&self, who: &ParticipantId, value: i64) {
        let rpc = Rpc::PushFinalizedResult {
            participant: who.clone(),
            value,
        };
        if self.caller.notify(&self.primary_address, rpc).await {
            log::info(&cformat!("Pushed the grade of <bold>{who}</bold> to the primary."));
        } else {
            log::error(&cformat!(
                "Could not push the grade of <bold>{who}</bold> to the primary."
            ));
        }
    }
}

impl Handler for BackupNode {
    fn handle(&self, rpc: Rpc) -> BoxFuture<'_, Reply> {
        async move {
            match rpc {
                Rpc::SubmitForFinalization { submission } => self.finalize(submission).await,
                other => Reply::unsupported(&other),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admission::AnswerKeyGrader,
        transport::{InProcessTransport, RetryPolicy},
    };
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Primary {
        pushed: Mutex<Vec<(ParticipantId, i64)>>,
    }

    impl Handler for Primary {
        fn handle(&self, rpc: Rpc) -> BoxFuture<'_, Reply> {
            if let Rpc::PushFinalizedResult { participant, value } = rpc {
                self.pushed.lock().push((participant, value));
            }
            futures::future::ready(Reply::Ack).boxed()
        }
    }

    #[tokio::test]
    async fn grades_once_and_pushes_once() {
        let transport = Arc::new(InProcessTransport::new());
        let primary = Arc::new(Primary::default());
        transport.register("primary", primary.clone());

        let backup = BackupNode::new(
            "primary".to_string(),
            Caller::new(transport, RetryPolicy::default()),
            Arc::new(AnswerKeyGrader::default()),
        );
        let submission = Submission {
            participant: "4".into(),
            answers: BTreeMap::from([(1, 2), (2, 2)]),
        };

        let first = backup.finalize(submission.clone()).await;
        let again = backup.finalize(submission).await;
        assert_eq!(first, again);
        assert_eq!(
            first,
            Reply::Finalized {
                participant: "4".into(),
                value: 20,
                desk: Desk::Secondary
            }
        );
        assert_eq!(*primary.pushed.lock(), vec![("4".into(), 20)]);
    }
}
