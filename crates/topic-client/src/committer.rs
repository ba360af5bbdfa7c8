use crate::proto::{self, ClientMessage, OffsetRange};
use crate::session::PartitionSession;
use crate::trace::{SendCommitMessageDoneInfo, SendCommitMessageStartInfo, Tracer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// What `commit` means for a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Committing is an error; the broker tracks no progress for this reader.
    None,
    /// `commit` suspends until the broker acknowledges the range and rejects
    /// out-of-order ranges up front.
    Sync,
    /// `commit` returns once the range is enqueued; ranges are coalesced and
    /// flushed in the background.
    #[default]
    Async,
}

/// Buffers submitted commit ranges and flushes them as single
/// `CommitOffsetRequest` frames, one `PartitionCommitOffset` per session
/// with its ranges coalesced.
pub(crate) struct Committer {
    batch_time_lag: Duration,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    tracer: Tracer,
    pending: Mutex<Vec<(Arc<PartitionSession>, OffsetRange)>>,
    wake: Notify,
}

impl Committer {
    pub(crate) fn new(
        batch_time_lag: Duration,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        tracer: Tracer,
    ) -> Self {
        Self {
            batch_time_lag,
            outbound,
            tracer,
            pending: Mutex::new(Vec::new()),
            wake: Notify::new(),
        }
    }

    /// Queues a validated range for the next flush.
    pub(crate) fn submit(&self, session: Arc<PartitionSession>, range: OffsetRange) {
        self.pending.lock().unwrap().push((session, range));
        // notify_one stores a permit, so a submit landing between flushes is
        // never lost.
        self.wake.notify_one();
    }

    fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    /// Background flush loop. With a zero time lag every submit flushes as
    /// soon as the loop runs; otherwise submits accumulate for one lag
    /// interval per frame. Drains outstanding ranges on shutdown.
    pub(crate) async fn run(&self, root: CancellationToken) {
        loop {
            if !self.has_pending() {
                tokio::select! {
                    _ = root.cancelled() => break,
                    _ = self.wake.notified() => {}
                }
            }
            if !self.batch_time_lag.is_zero() {
                tokio::select! {
                    _ = root.cancelled() => {}
                    _ = tokio::time::sleep(self.batch_time_lag) => {}
                }
            }
            self.flush();
            if root.is_cancelled() {
                break;
            }
        }
        self.flush();
    }

    /// Emits one commit frame carrying everything submitted so far.
    pub(crate) fn flush(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.pending.lock().unwrap());
        if drained.is_empty() {
            return;
        }

        // Group per session, preserving first-submission order across sessions.
        let mut per_session: Vec<(Arc<PartitionSession>, Vec<OffsetRange>)> = Vec::new();
        for (session, range) in drained {
            match per_session
                .iter_mut()
                .find(|(s, _)| s.partition_session_id == session.partition_session_id)
            {
                Some((_, ranges)) => ranges.push(range),
                None => per_session.push((session, vec![range])),
            }
        }

        let mut frame = proto::CommitOffsetRequest::default();
        let mut flushed_ends = Vec::with_capacity(per_session.len());
        for (session, ranges) in per_session {
            let offsets = coalesce(ranges);
            let Some(last) = offsets.last() else { continue };
            flushed_ends.push((session.clone(), last.end));
            frame.commit_offsets.push(proto::PartitionCommitOffset {
                partition_session_id: session.partition_session_id,
                offsets,
            });
        }
        if frame.commit_offsets.is_empty() {
            return;
        }

        tracing::trace!(partitions = frame.commit_offsets.len(), "flushing commit frame");
        let span = self.tracer.send_commit_message(SendCommitMessageStartInfo {
            frame: frame.clone(),
        });
        let sent = self.outbound.send(ClientMessage::CommitOffset(frame));
        span.finish(SendCommitMessageDoneInfo {
            error: sent
                .as_ref()
                .err()
                .map(|_| "outbound queue closed".to_string()),
        });

        if sent.is_ok() {
            for (session, end) in flushed_ends {
                session.mark_flushed(end);
            }
        }
    }
}

/// Merges `[a, b)` + `[b, c)` (and overlaps) into the fewest half-open
/// ranges, sorted ascending. Empty ranges vanish.
fn coalesce(mut ranges: Vec<OffsetRange>) -> Vec<OffsetRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| (r.start, r.end));
    let mut out: Vec<OffsetRange> = Vec::new();
    for range in ranges {
        match out.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => out.push(range),
        }
    }
    out
}
