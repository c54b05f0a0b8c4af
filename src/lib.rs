pub mod admission;
pub mod backup;
pub mod berkeley;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod log;
pub mod message;
pub mod mutex;
pub mod peer;
pub mod replication;
pub mod server;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
pub use message::{ParticipantId, Reply, Rpc};
