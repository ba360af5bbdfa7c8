use crate::proto::{OffsetRange, PartitionSessionId};
use crate::Error;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a partition session within one read stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Announced by the broker, not yet confirmed by the client.
    Created,
    /// Confirmed; messages may arrive.
    Running,
    /// Broker asked for a graceful stop: commits still succeed, staged
    /// messages must be delivered, no new data will arrive.
    StoppingGraceful,
    /// Scope cancelled; every operation on the session fails.
    Stopped,
}

/// A broker-assigned lease over one partition, scoped to one reader stream.
///
/// Sessions are owned by the reader's registry; consumer-visible values
/// (messages, commit ranges) hold only non-owning references back to them.
pub struct PartitionSession {
    pub topic: String,
    pub partition_id: i64,
    pub partition_session_id: PartitionSessionId,
    pub reader_id: i64,
    pub reader_connection_id: String,

    token: CancellationToken,
    committed_tx: watch::Sender<i64>,
    /// Signalled on delivery / commit-flush progress; the graceful-stop task
    /// waits on it.
    progress: Notify,
    state: Mutex<State>,
}

struct State {
    lifecycle: Lifecycle,
    /// Offset of the last message received from the broker.
    last_received_offset: i64,
    /// Broker-acknowledged commit horizon.
    committed_offset: i64,
    /// End (exclusive) of offsets handed out to the consumer.
    delivered_offset: i64,
    /// End (exclusive) of commit ranges flushed to the outbound queue.
    flushed_offset: i64,
    /// Commit ranges submitted but not yet acknowledged. Combined they cover
    /// `(committed_offset, ..]` without gaps or overlaps in sync mode.
    outstanding: VecDeque<OffsetRange>,
}

impl State {
    /// Where the next committed range must begin for commits to stay in order.
    fn expected_commit_start(&self) -> i64 {
        self.outstanding
            .back()
            .map(|r| r.end)
            .unwrap_or(self.committed_offset)
            .max(self.committed_offset)
    }

    fn push_outstanding(&mut self, range: OffsetRange) {
        match self.outstanding.back_mut() {
            Some(back) if back.end == range.start => back.end = range.end,
            _ => self.outstanding.push_back(range),
        }
    }
}

impl PartitionSession {
    pub(crate) fn new(
        topic: String,
        partition_id: i64,
        partition_session_id: PartitionSessionId,
        reader_id: i64,
        reader_connection_id: String,
        committed_offset: i64,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (committed_tx, _) = watch::channel(committed_offset);
        Arc::new(Self {
            topic,
            partition_id,
            partition_session_id,
            reader_id,
            reader_connection_id,
            token,
            committed_tx,
            progress: Notify::new(),
            state: Mutex::new(State {
                lifecycle: Lifecycle::Created,
                last_received_offset: committed_offset - 1,
                committed_offset,
                delivered_offset: committed_offset,
                flushed_offset: committed_offset,
                outstanding: VecDeque::new(),
            }),
        })
    }

    /// Cancellation scope of this session; a child of the reader's root scope.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.token.is_cancelled() {
            return Lifecycle::Stopped;
        }
        self.state.lock().unwrap().lifecycle
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn is_stopping_graceful(&self) -> bool {
        self.lifecycle() == Lifecycle::StoppingGraceful
    }

    pub fn committed_offset(&self) -> i64 {
        self.state.lock().unwrap().committed_offset
    }

    pub fn last_received_offset(&self) -> i64 {
        self.state.lock().unwrap().last_received_offset
    }

    /// Start of the commit range of the next message to decode:
    /// one past the last received offset, so skipped offsets stay covered.
    pub(crate) fn stitch_base(&self) -> i64 {
        self.state.lock().unwrap().last_received_offset + 1
    }

    pub(crate) fn advance_last_received(&self, offset: i64) {
        let mut state = self.state.lock().unwrap();
        state.last_received_offset = state.last_received_offset.max(offset);
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle == Lifecycle::Created {
            state.lifecycle = Lifecycle::Running;
        }
    }

    pub(crate) fn mark_stopping_graceful(&self) {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle != Lifecycle::Stopped {
            state.lifecycle = Lifecycle::StoppingGraceful;
        }
        drop(state);
        self.progress.notify_waiters();
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.lock().unwrap().lifecycle = Lifecycle::Stopped;
        self.token.cancel();
        self.progress.notify_waiters();
    }

    /// Records a range the committer will flush, with no ordering demands
    /// (async commit mode accepts ranges as submitted).
    pub(crate) fn push_outstanding(&self, range: OffsetRange) {
        self.state.lock().unwrap().push_outstanding(range);
    }

    /// Records `range` only if it continues the committed sequence exactly.
    /// Check and push happen under one lock acquisition, so concurrent
    /// commits on the same session cannot interleave between them.
    pub(crate) fn try_push_outstanding(&self, range: OffsetRange) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        if range.start != state.expected_commit_start() {
            return Err(Error::WrongCommitOrderInSyncMode);
        }
        state.push_outstanding(range);
        Ok(())
    }

    /// Applies a broker commit acknowledgement. Monotone: a stale or repeated
    /// ack is a no-op. Returns whether the committed horizon advanced.
    pub(crate) fn apply_committed_ack(&self, committed_offset: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        if committed_offset <= state.committed_offset {
            return false;
        }
        state.committed_offset = committed_offset;
        while let Some(front) = state.outstanding.front_mut() {
            if front.end <= committed_offset {
                state.outstanding.pop_front();
            } else {
                if front.start < committed_offset {
                    front.start = committed_offset;
                }
                break;
            }
        }
        drop(state);
        self.committed_tx.send_replace(committed_offset);
        true
    }

    /// Suspends until the broker-acknowledged horizon reaches `end`.
    pub(crate) async fn wait_committed(&self, end: i64) -> crate::Result<()> {
        let mut rx = self.committed_tx.subscribe();
        rx.wait_for(|committed| *committed >= end)
            .await
            .map(|_| ())
            .map_err(|_| Error::CommitToExpiredSession)
    }

    pub(crate) fn mark_delivered(&self, end: i64) {
        let mut state = self.state.lock().unwrap();
        state.delivered_offset = state.delivered_offset.max(end);
        drop(state);
        self.progress.notify_waiters();
    }

    pub(crate) fn mark_flushed(&self, end: i64) {
        let mut state = self.state.lock().unwrap();
        state.flushed_offset = state.flushed_offset.max(end);
        drop(state);
        self.progress.notify_waiters();
    }

    /// True once every delivered offset has had its commit flushed to the
    /// outbound queue.
    pub(crate) fn flushed_covers_delivered(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.flushed_offset >= state.delivered_offset
    }

    pub(crate) fn progress_notified(&self) -> Notified<'_> {
        self.progress.notified()
    }

    #[cfg(test)]
    pub(crate) fn outstanding_ranges(&self) -> Vec<OffsetRange> {
        self.state.lock().unwrap().outstanding.iter().copied().collect()
    }
}

impl std::fmt::Debug for PartitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSession")
            .field("topic", &self.topic)
            .field("partition_id", &self.partition_id)
            .field("partition_session_id", &self.partition_session_id)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// All live partition sessions of one stream, keyed by session id.
/// A plain mutex; nothing here blocks on I/O.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<PartitionSessionId, Arc<PartitionSession>>>,
}

impl SessionRegistry {
    pub(crate) fn add(&self, session: Arc<PartitionSession>) -> crate::Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let id = session.partition_session_id;
        if sessions.contains_key(&id) {
            return Err(Error::DuplicateSessionId(id));
        }
        sessions.insert(id, session);
        Ok(())
    }

    pub(crate) fn get(&self, id: PartitionSessionId) -> crate::Result<Arc<PartitionSession>> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownSession(id))
    }

    /// Removes and stops the session. Idempotent.
    pub(crate) fn remove(&self, id: PartitionSessionId) -> Option<Arc<PartitionSession>> {
        let removed = self.sessions.lock().unwrap().remove(&id);
        if let Some(session) = &removed {
            session.mark_stopped();
        }
        removed
    }

    /// Stops and drops every session; used on reader close.
    pub(crate) fn clear(&self) {
        let drained: Vec<_> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.mark_stopped();
        }
    }
}
