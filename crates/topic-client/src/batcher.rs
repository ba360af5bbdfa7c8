use crate::flow_control::FlowControl;
use crate::message::{Batch, Message};
use crate::proto::PartitionSessionId;
use crate::session::PartitionSession;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Constraints of one `read_message_batch` call.
///
/// `min_count`/`min_size` suspend the read until satisfied; they are
/// overridden by the force-delivery conditions (spent flow window, graceful
/// partition stop). `max_count`/`max_size` cap the returned batch; `None`
/// means unlimited. Sizes are measured on raw (wire) body lengths.
#[derive(Debug, Clone, Copy)]
pub struct ReadBatchOptions {
    pub min_count: usize,
    pub max_count: Option<usize>,
    pub min_size: usize,
    pub max_size: Option<usize>,
}

impl Default for ReadBatchOptions {
    fn default() -> Self {
        Self {
            min_count: 1,
            max_count: None,
            min_size: 0,
            max_size: None,
        }
    }
}

pub(crate) struct PopResult {
    pub(crate) batch: Batch,
    /// Buffer credit freed by this pop, to hand to the flow accountant.
    pub(crate) released_bytes: i64,
}

struct SessionQueue {
    session: Arc<PartitionSession>,
    messages: VecDeque<Message>,
    staged_size: usize,
}

/// In-memory staging of decoded messages, one FIFO per partition session,
/// in session-arrival order. Batches are assembled from a single session.
pub(crate) struct Batcher {
    queues: Mutex<IndexMap<PartitionSessionId, SessionQueue>>,
    notify: Notify,
}

impl Batcher {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(IndexMap::new()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn push(&self, session: Arc<PartitionSession>, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut queues = self.queues.lock().unwrap();
        let queue = queues
            .entry(session.partition_session_id)
            .or_insert_with(|| SessionQueue {
                session,
                messages: VecDeque::new(),
                staged_size: 0,
            });
        for message in messages {
            queue.staged_size += message.raw_data_len();
            queue.messages.push_back(message);
        }
        drop(queues);
        self.notify.notify_waiters();
    }

    /// Re-evaluates waiting reads; called when a force condition may have
    /// changed (flow window spent, session entered graceful stop).
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn has_staged(&self, id: PartitionSessionId) -> bool {
        self.queues
            .lock()
            .unwrap()
            .get(&id)
            .map(|q| !q.messages.is_empty())
            .unwrap_or(false)
    }

    /// Drops all staged messages of a session (abrupt stop); returns their
    /// buffer credit so the caller can release it.
    pub(crate) fn drop_session(&self, id: PartitionSessionId) -> i64 {
        let removed = self.queues.lock().unwrap().shift_remove(&id);
        removed
            .map(|q| q.messages.iter().map(|m| m.buffer_bytes_account).sum())
            .unwrap_or(0)
    }

    /// Suspends until a batch satisfying `opts` (or a force condition) is
    /// available. Cancel-safe: dropping the future never consumes messages.
    pub(crate) async fn pop(&self, opts: ReadBatchOptions, flow: &FlowControl) -> PopResult {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_pop(&opts, flow.exhausted()) {
                return result;
            }
            notified.await;
        }
    }

    fn try_pop(&self, opts: &ReadBatchOptions, flow_exhausted: bool) -> Option<PopResult> {
        let max_count = opts.max_count.filter(|&c| c > 0);
        let max_size = opts.max_size.filter(|&s| s > 0);

        let mut queues = self.queues.lock().unwrap();

        // Graceful-stopping sessions drain first: their messages must reach
        // the consumer before the stop is confirmed.
        let key = queues
            .iter()
            .find(|(_, q)| !q.messages.is_empty() && q.session.is_stopping_graceful())
            .map(|(k, _)| *k)
            .or_else(|| {
                queues
                    .iter()
                    .find(|(_, q)| !q.messages.is_empty())
                    .map(|(k, _)| *k)
            });

        let Some(key) = key else {
            // Nothing staged anywhere; only a zero minimum returns (empty).
            return (opts.min_count == 0 && opts.min_size == 0)
                .then(|| PopResult {
                    batch: Batch::empty(),
                    released_bytes: 0,
                });
        };

        let queue = queues.get_mut(&key).expect("key was just found");
        let force = flow_exhausted || queue.session.is_stopping_graceful();
        if !force
            && (queue.messages.len() < opts.min_count || queue.staged_size < opts.min_size)
        {
            return None;
        }

        let mut messages = Vec::new();
        let mut size = 0usize;
        let mut released = 0i64;
        while let Some(front) = queue.messages.front() {
            if max_count.is_some_and(|c| messages.len() >= c) {
                break;
            }
            if max_size.is_some_and(|s| !messages.is_empty() && size + front.raw_data_len() > s) {
                break;
            }
            let message = queue.messages.pop_front().expect("front exists");
            queue.staged_size -= message.raw_data_len();
            size += message.raw_data_len();
            released += message.buffer_bytes_account;
            messages.push(message);
        }
        let session = queue.session.clone();
        if queue.messages.is_empty() {
            queues.shift_remove(&key);
        }
        drop(queues);

        let batch = Batch::new(messages);
        if !batch.is_empty() {
            session.mark_delivered(batch.commit_range().end());
        }
        Some(PopResult {
            batch,
            released_bytes: released,
        })
    }
}
