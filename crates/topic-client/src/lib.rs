//! Streaming topic consumer client for the Courier partitioned-log broker.
//!
//! The entry point is [`StreamReader`], which owns one bidirectional stream
//! to a broker and multiplexes many partition sessions over it. The caller
//! supplies an already-established [`transport::StreamTransport`]; stream
//! establishment, authentication and reconnection are out of scope here.

pub mod config;
pub mod proto;
pub mod trace;
pub mod transport;

mod batcher;
mod committer;
mod flow_control;
mod message;
mod reader;
mod session;

pub use batcher::ReadBatchOptions;
pub use committer::CommitMode;
pub use config::ReaderConfig;
pub use message::{Batch, CommitRange, Message};
pub use reader::StreamReader;
pub use session::{Lifecycle, PartitionSession};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("topic reader is closed")]
    ReaderClosed,
    #[error("commit is disabled for this reader")]
    CommitDisabled,
    #[error("out-of-order commit in sync commit mode")]
    WrongCommitOrderInSyncMode,
    #[error("commit targets an expired partition session")]
    CommitToExpiredSession,
    #[error("duplicate partition session id {0}")]
    DuplicateSessionId(i64),
    #[error("unknown partition session id {0}")]
    UnknownSession(i64),
    #[error("cannot compute free buffer percentage: buffer size is zero")]
    CannotComputeFreeSpacePercentage,
    #[error("unknown message codec {0:?}")]
    UnknownCodec(proto::Codec),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("bad server status: {0:?}")]
    BadServerStatus(proto::Status),
    #[error("{0}")]
    Protocol(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
