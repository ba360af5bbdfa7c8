use crate::committer::CommitMode;
use crate::trace::Tracer;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BUFFER_SIZE_BYTES: i64 = 1024 * 1024;

/// Configuration of one reader stream.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Consumer name sent in the init handshake.
    pub consumer: String,
    /// Topic paths to subscribe in the init handshake.
    pub topics: Vec<String>,
    /// Size of the flow-control window granted to the broker. Zero disables
    /// flow control entirely: no `ReadRequest` is ever sent.
    pub buffer_size_bytes: i64,
    pub commit_mode: CommitMode,
    /// How long async commits accumulate before a flush. Zero flushes each
    /// submission as soon as the flush loop runs.
    pub commit_batch_time_lag: Duration,
    /// Parent scope of the reader; cancelling it closes the reader.
    pub parent_token: Option<CancellationToken>,
    pub tracer: Tracer,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            consumer: String::new(),
            topics: Vec::new(),
            buffer_size_bytes: DEFAULT_BUFFER_SIZE_BYTES,
            commit_mode: CommitMode::default(),
            commit_batch_time_lag: Duration::ZERO,
            parent_token: None,
            tracer: Tracer::default(),
        }
    }
}
