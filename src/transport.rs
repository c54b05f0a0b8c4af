//! Request/response plumbing shared by every node.
//!
//! Protocol code only sees [`Caller`] and [`Handler`]; whether a call crosses
//! a TCP connection or stays inside the process is the [`Transport`]'s business.

use crate::{
    error::{Error, Result},
    log,
    message::{Reply, Rpc},
};
use color_print::cformat;
use futures::{future::BoxFuture, FutureExt, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

/// Anything that answers calls: a node, or a test double.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, rpc: Rpc) -> BoxFuture<'_, Reply>;

    /// Called when `reply` was produced for `rpc` but could not be written
    /// back to the caller.
    fn reply_lost(&self, _rpc: &Rpc, _reply: &Reply) {}
}

/// What the caller observed about one call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallOutcome {
    Delivered(Reply),
    Timeout,
    PeerError(String),
}

impl CallOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }

    /// The reply, or an [`Error::Call`] naming `peer`. A delivered
    /// [`Reply::Err`] is also turned into an error.
    pub fn into_reply(self, peer: &str) -> Result<Reply> {
        match self {
            Self::Delivered(Reply::Err(reason)) | Self::PeerError(reason) => Err(Error::Call {
                peer: peer.to_string(),
                reason,
            }),
            Self::Delivered(reply) => Ok(reply),
            Self::Timeout => Err(Error::Call {
                peer: peer.to_string(),
                reason: "timed out".to_string(),
            }),
        }
    }
}

pub trait Transport: Send + Sync {
    fn call<'a>(&'a self, address: &'a str, rpc: Rpc) -> BoxFuture<'a, CallOutcome>;
}

/// Routes calls straight to registered handlers, so a whole cluster can run
/// inside one process.
#[derive(Default)]
pub struct InProcessTransport {
    handlers: RwLock<BTreeMap<String, Arc<dyn Handler>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.write().insert(address.into(), handler);
    }

    /// Makes `address` unreachable, as if its node had crashed.
    pub fn detach(&self, address: &str) -> bool {
        self.handlers.write().remove(address).is_some()
    }
}

impl Transport for InProcessTransport {
    fn call<'a>(&'a self, address: &'a str, rpc: Rpc) -> BoxFuture<'a, CallOutcome> {
        let handler = self.handlers.read().get(address).cloned();
        async move {
            match handler {
                Some(handler) => CallOutcome::Delivered(handler.handle(rpc).await),
                None => CallOutcome::PeerError(format!("nothing listens on {address}")),
            }
        }
        .boxed()
    }
}

/// One connection per call: a request line out, a reply line back.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    async fn exchange(address: &str, rpc: &Rpc) -> Result<Reply> {
        let stream = TcpStream::connect(address).await?;
        let mut lines = Framed::new(stream, LinesCodec::new());

        lines
            .send(rpc.to_json_string()?)
            .await
            .map_err(|e| Error::Call {
                peer: address.to_string(),
                reason: e.to_string(),
            })?;

        match lines.next().await {
            Some(Ok(line)) => Reply::from_json_string(&line),
            Some(Err(e)) => Err(Error::Call {
                peer: address.to_string(),
                reason: e.to_string(),
            }),
            None => Err(Error::Call {
                peer: address.to_string(),
                reason: "connection closed before the reply".to_string(),
            }),
        }
    }
}

impl Transport for TcpTransport {
    fn call<'a>(&'a self, address: &'a str, rpc: Rpc) -> BoxFuture<'a, CallOutcome> {
        async move {
            match Self::exchange(address, &rpc).await {
                Ok(reply) => CallOutcome::Delivered(reply),
                Err(e) => CallOutcome::PeerError(e.to_string()),
            }
        }
        .boxed()
    }
}

/// Function that answers every call arriving on one connection.
async fn handle(stream: TcpStream, handler: Arc<dyn Handler>) -> Result<()> {
    let lines = Framed::new(stream, LinesCodec::new());
    let (mut writer, mut reader) = lines.split::<String>();

    while let Some(line) = reader.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn(&format!("Dropping connection: {e}"));
                break;
            }
        };

        let Ok(rpc) = Rpc::from_json_string(&line) else {
            let refusal = Reply::Err("the request had incorrect formatting".to_string());
            writer
                .send(refusal.to_json_string()?)
                .await
                .map_err(|e| Error::Call {
                    peer: "client".to_string(),
                    reason: e.to_string(),
                })?;
            continue;
        };
        log::debug(&cformat!("Serving <bold>{}</bold>.", rpc.method()));

        // a caller that hangs up is no longer waiting for the reply
        let reply = tokio::select! {
            reply = handler.handle(rpc.clone()) => reply,
            _ = hung_up(&mut reader) => {
                log::debug(&cformat!(
                    "Caller hung up during <bold>{}</bold>; abandoning it.",
                    rpc.method()
                ));
                break;
            }
        };

        if let Err(e) = writer.send(reply.to_json_string()?).await {
            handler.reply_lost(&rpc, &reply);
            return Err(Error::Call {
                peer: "client".to_string(),
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}

// Resolves once the caller closed its side of the connection.
async fn hung_up<S, E>(reader: &mut S)
where
    S: Stream<Item = std::result::Result<String, E>> + Unpin,
{
    while let Some(Ok(_)) = reader.next().await {
        log::warn("Dropping a request sent before the previous reply.");
    }
}

/// Function that binds `address` and serves `handler` until the task is dropped.
pub async fn serve(address: &str, handler: Arc<dyn Handler>) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    log::info(&cformat!("Listening on <bold>{address}</bold>."));
    serve_listener(listener, handler).await
}

/// Accept loop over an already bound listener; one task per connection.
pub async fn serve_listener(listener: TcpListener, handler: Arc<dyn Handler>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug(&cformat!("Accepted a <bold>connection</bold> from {peer}."));

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = handle(stream, handler).await {
                log::error(&format!("{e}"));
            }
        });
    }
}

/// Per-attempt timeout plus bounded, jittered exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(1 << attempt.min(16));
        let spread = (self.backoff.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::rng().random_range(0..spread))
    }
}

/// Cheap to clone; every node holds one.
#[derive(Clone)]
pub struct Caller {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller").field("policy", &self.policy).finish()
    }
}

impl Caller {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Same transport, different per-attempt timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            policy: RetryPolicy {
                timeout,
                ..self.policy
            },
        }
    }

    pub async fn call_once(&self, address: &str, rpc: Rpc) -> CallOutcome {
        match tokio::time::timeout(self.policy.timeout, self.transport.call(address, rpc)).await {
            Ok(outcome) => outcome,
            Err(_) => CallOutcome::Timeout,
        }
    }

    /// Retries timeouts and peer errors; a delivered reply is final.
    pub async fn call(&self, address: &str, rpc: Rpc) -> CallOutcome {
        let attempts = self.policy.attempts.max(1);
        let mut outcome = CallOutcome::Timeout;

        for attempt in 0..attempts {
            outcome = self.call_once(address, rpc.clone()).await;
            if outcome.is_delivered() {
                return outcome;
            }
            if attempt + 1 < attempts {
                log::debug(&cformat!(
                    "<bold>{}</bold> to <bold>{address}</bold> failed ({outcome:?}), retrying.",
                    rpc.method()
                ));
                tokio::time::sleep(self.policy.delay(attempt)).await;
            }
        }

        log::warn(&cformat!(
            "<bold>{}</bold> to <bold>{address}</bold> gave up after {attempts} attempt(s): {outcome:?}.",
            rpc.method()
        ));
        outcome
    }

    /// Best-effort call whose failure is logged and otherwise ignored.
    pub async fn notify(&self, address: &str, rpc: Rpc) -> bool {
        match self.call(address, rpc).await {
            CallOutcome::Delivered(Reply::Err(reason)) => {
                log::warn(&cformat!("<bold>{address}</bold> refused: {reason}"));
                false
            }
            outcome => outcome.is_delivered(),
        }
    }
}
