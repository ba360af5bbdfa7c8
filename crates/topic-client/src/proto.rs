//! Decoded wire values of the topic read stream.
//!
//! Frame (de)serialisation happens outside the core: the transport hands the
//! reader already-decoded [`ServerMessage`] values and accepts
//! [`ClientMessage`] values. The shapes below mirror the broker protocol
//! one-to-one.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::SystemTime;

/// Broker-assigned identifier of one partition session, unique per stream.
pub type PartitionSessionId = i64;

/// Result status carried by every server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    BadRequest,
    InternalError,
    Unavailable,
    SessionExpired,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// Compression codec of a message batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Raw,
    Gzip,
    /// A codec this client version cannot decode. Decoding fails lazily,
    /// when the affected message body is first read.
    Unsupported(i32),
}

/// A half-open `[start, end)` interval of partition offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetRange {
    pub start: i64,
    pub end: i64,
}

impl OffsetRange {
    pub fn len(self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(self) -> bool {
        self.start >= self.end
    }
}

/// One framed message from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    pub status: Status,
    pub body: ServerMessageBody,
}

impl ServerMessage {
    /// A message with `Status::Success`, as the broker sends in the common case.
    pub fn success(body: ServerMessageBody) -> Self {
        Self {
            status: Status::Success,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessageBody {
    Init(InitResponse),
    StartPartitionSession(StartPartitionSessionRequest),
    StopPartitionSession(StopPartitionSessionRequest),
    Read(ReadResponse),
    CommitOffset(CommitOffsetResponse),
    UpdateToken(UpdateTokenResponse),
    /// A frame kind unknown to this client version.
    Unsupported { kind: String },
}

/// One framed message to the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Init(InitRequest),
    StartPartitionSessionResponse(StartPartitionSessionResponse),
    StopPartitionSessionResponse(StopPartitionSessionResponse),
    Read(ReadRequest),
    CommitOffset(CommitOffsetRequest),
    UpdateToken(UpdateTokenRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitRequest {
    pub consumer: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitResponse {
    /// Server-assigned identifier of this read stream.
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPartitionSessionRequest {
    pub partition_session_id: PartitionSessionId,
    pub topic: String,
    pub partition_id: i64,
    pub committed_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPartitionSessionResponse {
    pub partition_session_id: PartitionSessionId,
    /// Override of the offset the broker should start reading from.
    pub read_offset: Option<i64>,
    /// Override of the broker-side committed offset.
    pub commit_offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPartitionSessionRequest {
    pub partition_session_id: PartitionSessionId,
    /// When true the client may finish commits before confirming the stop.
    pub graceful: bool,
    pub committed_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPartitionSessionResponse {
    pub partition_session_id: PartitionSessionId,
}

/// Grants the broker `bytes_size` further bytes of unsolicited data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub bytes_size: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadResponse {
    /// Size this frame counts against the client buffer window.
    pub bytes_size: i64,
    pub partition_data: Vec<PartitionData>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionData {
    pub partition_session_id: PartitionSessionId,
    pub batches: Vec<RawBatch>,
}

/// A server-side batch: messages of one producer, sharing codec and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub codec: Codec,
    pub producer_id: String,
    pub write_session_meta: HashMap<String, String>,
    pub written_at: SystemTime,
    pub message_data: Vec<MessageData>,
}

impl Default for RawBatch {
    fn default() -> Self {
        Self {
            codec: Codec::Raw,
            producer_id: String::new(),
            write_session_meta: HashMap::new(),
            written_at: SystemTime::UNIX_EPOCH,
            message_data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageData {
    pub offset: i64,
    pub seq_no: i64,
    pub created_at: SystemTime,
    /// Body bytes, compressed per the batch codec.
    pub data: Bytes,
    pub uncompressed_size: i64,
}

impl Default for MessageData {
    fn default() -> Self {
        Self {
            offset: 0,
            seq_no: 0,
            created_at: SystemTime::UNIX_EPOCH,
            data: Bytes::new(),
            uncompressed_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitOffsetRequest {
    pub commit_offsets: Vec<PartitionCommitOffset>,
}

/// Commit ranges of one partition session: coalesced, sorted ascending,
/// non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCommitOffset {
    pub partition_session_id: PartitionSessionId,
    pub offsets: Vec<OffsetRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitOffsetResponse {
    pub partitions: Vec<PartitionCommittedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCommittedOffset {
    pub partition_session_id: PartitionSessionId,
    pub committed_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateTokenResponse {}
