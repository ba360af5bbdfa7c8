//! Optional observability hooks of the reader engine.
//!
//! Hooks follow a start/done pattern: the start callback runs before the
//! observable side effect and may return a closure that runs after it.
//! Hooks are opaque to the engine; a panicking hook is caught and reported,
//! never unwinding through the reader loops.

use crate::proto;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Closure invoked after the traced side effect completed.
pub type DoneFn<T> = Box<dyn FnOnce(T) + Send>;

type StartFn<S, D> = Arc<dyn Fn(S) -> Option<DoneFn<D>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Tracer {
    pub on_reader_init: Option<StartFn<InitStartInfo, InitDoneInfo>>,
    pub on_reader_close: Option<StartFn<CloseStartInfo, CloseDoneInfo>>,
    pub on_reader_error: Option<Arc<dyn Fn(ErrorInfo) + Send + Sync>>,

    /// Runs before the client confirms a partition start; its decision may
    /// override the broker's read/commit offsets in the confirmation.
    pub on_partition_start_response:
        Option<Arc<dyn Fn(PartitionStartInfo) -> PartitionStartDecision + Send + Sync>>,
    pub on_partition_stop_response: Option<StartFn<PartitionStopInfo, PartitionStopDoneInfo>>,

    pub on_commit: Option<StartFn<CommitStartInfo, CommitDoneInfo>>,
    pub on_send_commit_message:
        Option<StartFn<SendCommitMessageStartInfo, SendCommitMessageDoneInfo>>,
    pub on_committed_notify: Option<Arc<dyn Fn(CommittedNotifyInfo) + Send + Sync>>,

    pub on_sent_data_request: Option<Arc<dyn Fn(SentDataRequestInfo) + Send + Sync>>,
    pub on_receive_data_response:
        Option<StartFn<ReceiveDataResponseStartInfo, ReceiveDataResponseDoneInfo>>,
    pub on_read_messages: Option<StartFn<ReadMessagesStartInfo, ReadMessagesDoneInfo>>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Tracer { .. }")
    }
}

/// The in-flight half of a start/done hook pair.
pub(crate) struct TraceSpan<D> {
    name: &'static str,
    done: Option<DoneFn<D>>,
}

impl<D> TraceSpan<D> {
    pub(crate) fn finish(self, info: D) {
        if let Some(done) = self.done {
            guarded(self.name, move || done(info));
        }
    }
}

fn guarded<T>(name: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(hook = name, "tracer hook panicked");
            None
        }
    }
}

fn span<S, D>(hook: &Option<StartFn<S, D>>, name: &'static str, info: S) -> TraceSpan<D> {
    let done = hook
        .as_ref()
        .and_then(|h| guarded(name, || h(info)))
        .flatten();
    TraceSpan { name, done }
}

impl Tracer {
    pub(crate) fn reader_init(&self, info: InitStartInfo) -> TraceSpan<InitDoneInfo> {
        span(&self.on_reader_init, "on_reader_init", info)
    }

    pub(crate) fn reader_close(&self, info: CloseStartInfo) -> TraceSpan<CloseDoneInfo> {
        span(&self.on_reader_close, "on_reader_close", info)
    }

    pub(crate) fn reader_error(&self, info: ErrorInfo) {
        if let Some(hook) = &self.on_reader_error {
            guarded("on_reader_error", || hook(info));
        }
    }

    pub(crate) fn partition_start(&self, info: PartitionStartInfo) -> PartitionStartDecision {
        match &self.on_partition_start_response {
            Some(hook) => guarded("on_partition_start_response", || hook(info)).unwrap_or_default(),
            None => PartitionStartDecision::default(),
        }
    }

    pub(crate) fn partition_stop(
        &self,
        info: PartitionStopInfo,
    ) -> TraceSpan<PartitionStopDoneInfo> {
        span(&self.on_partition_stop_response, "on_partition_stop_response", info)
    }

    pub(crate) fn commit(&self, info: CommitStartInfo) -> TraceSpan<CommitDoneInfo> {
        span(&self.on_commit, "on_commit", info)
    }

    pub(crate) fn send_commit_message(
        &self,
        info: SendCommitMessageStartInfo,
    ) -> TraceSpan<SendCommitMessageDoneInfo> {
        span(&self.on_send_commit_message, "on_send_commit_message", info)
    }

    pub(crate) fn committed_notify(&self, info: CommittedNotifyInfo) {
        if let Some(hook) = &self.on_committed_notify {
            guarded("on_committed_notify", || hook(info));
        }
    }

    pub(crate) fn sent_data_request(&self, info: SentDataRequestInfo) {
        if let Some(hook) = &self.on_sent_data_request {
            guarded("on_sent_data_request", || hook(info));
        }
    }

    pub(crate) fn receive_data_response(
        &self,
        info: ReceiveDataResponseStartInfo,
    ) -> TraceSpan<ReceiveDataResponseDoneInfo> {
        span(&self.on_receive_data_response, "on_receive_data_response", info)
    }

    pub(crate) fn read_messages(&self, info: ReadMessagesStartInfo) -> TraceSpan<ReadMessagesDoneInfo> {
        span(&self.on_read_messages, "on_read_messages", info)
    }
}

#[derive(Debug, Clone)]
pub struct InitStartInfo {
    pub consumer: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InitDoneInfo {
    pub reader_connection_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CloseStartInfo {
    pub reader_connection_id: String,
    pub close_reason: String,
}

#[derive(Debug, Clone)]
pub struct CloseDoneInfo {}

#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub reader_connection_id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PartitionStartInfo {
    pub reader_connection_id: String,
    pub topic: String,
    pub partition_id: i64,
    pub partition_session_id: proto::PartitionSessionId,
}

/// Offset overrides for the start confirmation; `None` leaves the broker's
/// choice in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionStartDecision {
    pub read_offset: Option<i64>,
    pub commit_offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PartitionStopInfo {
    pub reader_connection_id: String,
    /// Scope of the stopping session: still live for a graceful stop,
    /// already cancelled for an abrupt one.
    pub partition_token: CancellationToken,
    pub topic: String,
    pub partition_id: i64,
    pub partition_session_id: proto::PartitionSessionId,
    pub committed_offset: i64,
    pub graceful: bool,
}

#[derive(Debug, Clone)]
pub struct PartitionStopDoneInfo {
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommitStartInfo {
    pub topic: String,
    pub partition_id: i64,
    pub partition_session_id: proto::PartitionSessionId,
    pub start_offset: i64,
    pub end_offset: i64,
}

#[derive(Debug, Clone)]
pub struct CommitDoneInfo {
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendCommitMessageStartInfo {
    pub frame: proto::CommitOffsetRequest,
}

#[derive(Debug, Clone)]
pub struct SendCommitMessageDoneInfo {
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommittedNotifyInfo {
    pub topic: String,
    pub partition_id: i64,
    pub partition_session_id: proto::PartitionSessionId,
    pub committed_offset: i64,
}

#[derive(Debug, Clone)]
pub struct SentDataRequestInfo {
    pub reader_connection_id: String,
    pub request_bytes: i64,
    pub local_buffer_size_after_sent: i64,
}

#[derive(Debug, Clone)]
pub struct ReceiveDataResponseStartInfo {
    pub reader_connection_id: String,
    pub local_buffer_size_after_receive: i64,
    pub bytes_size: i64,
    pub partitions_count: usize,
    pub messages_count: usize,
}

#[derive(Debug, Clone)]
pub struct ReceiveDataResponseDoneInfo {
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadMessagesStartInfo {
    pub min_count: usize,
    pub max_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ReadMessagesDoneInfo {
    pub messages_count: usize,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn panicking_hook_is_contained() {
        let done_calls = Arc::new(AtomicUsize::new(0));
        let done_calls2 = done_calls.clone();

        let tracer = Tracer {
            on_commit: Some(Arc::new(move |_info| {
                let done_calls = done_calls2.clone();
                Some(Box::new(move |_done: CommitDoneInfo| {
                    done_calls.fetch_add(1, Ordering::SeqCst);
                    panic!("done hook panics too");
                }) as DoneFn<CommitDoneInfo>)
            })),
            on_committed_notify: Some(Arc::new(|_| panic!("boom"))),
            ..Default::default()
        };

        // Neither the fire-once hook nor the done closure may unwind.
        tracer.committed_notify(CommittedNotifyInfo {
            topic: "t".into(),
            partition_id: 1,
            partition_session_id: 2,
            committed_offset: 3,
        });

        let span = tracer.commit(CommitStartInfo {
            topic: "t".into(),
            partition_id: 1,
            partition_session_id: 2,
            start_offset: 0,
            end_offset: 1,
        });
        span.finish(CommitDoneInfo { error: None });
        assert_eq!(done_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_hooks_are_noops() {
        let tracer = Tracer::default();
        let decision = tracer.partition_start(PartitionStartInfo {
            reader_connection_id: "c".into(),
            topic: "t".into(),
            partition_id: 0,
            partition_session_id: 0,
        });
        assert!(decision.read_offset.is_none());
        assert!(decision.commit_offset.is_none());

        tracer
            .read_messages(ReadMessagesStartInfo {
                min_count: 1,
                max_count: None,
            })
            .finish(ReadMessagesDoneInfo {
                messages_count: 0,
                error: None,
            });
    }
}
