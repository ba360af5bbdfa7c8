use crate::batcher::{Batcher, ReadBatchOptions};
use crate::committer::{CommitMode, Committer};
use crate::config::ReaderConfig;
use crate::flow_control::FlowControl;
use crate::message::{decode_read_response, Batch, CommitRange};
use crate::proto::{self, ClientMessage, ServerMessage, ServerMessageBody};
use crate::session::{PartitionSession, SessionRegistry};
use crate::trace::{
    CloseDoneInfo, CloseStartInfo, CommitDoneInfo, CommitStartInfo, CommittedNotifyInfo,
    ErrorInfo, InitDoneInfo, InitStartInfo, PartitionStartInfo, PartitionStopDoneInfo,
    PartitionStopInfo, ReadMessagesDoneInfo, ReadMessagesStartInfo,
    ReceiveDataResponseDoneInfo, ReceiveDataResponseStartInfo, SentDataRequestInfo, TraceSpan,
    Tracer,
};
use crate::transport::StreamTransport;
use crate::Error;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

static NEXT_READER_ID: AtomicI64 = AtomicI64::new(1);

fn next_reader_id() -> i64 {
    NEXT_READER_ID.fetch_add(1, Ordering::Relaxed)
}

/// One reader stream: a state machine over an established transport, run by
/// three background tasks (ingest, send, commit flush).
///
/// Consumer calls are safe from any task. Once the reader is closing, every
/// public method returns [`Error::ReaderClosed`]; the original close reason
/// stays available through [`StreamReader::close_reason`].
pub struct StreamReader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader").finish_non_exhaustive()
    }
}

struct Inner {
    reader_id: i64,
    connection_id: String,
    commit_mode: CommitMode,
    tracer: Tracer,

    transport: Arc<dyn StreamTransport>,
    registry: SessionRegistry,
    flow: FlowControl,
    batcher: Batcher,
    committer: Committer,

    outbound: mpsc::UnboundedSender<ClientMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,

    root: CancellationToken,
    closed: AtomicBool,
    close_reason: Mutex<Option<Arc<Error>>>,
    loops_started: AtomicBool,
    ingest_done: watch::Sender<bool>,
    update_token_waiter: Mutex<Option<oneshot::Sender<()>>>,
}

impl StreamReader {
    /// Performs the init handshake over `transport` and starts the reader
    /// loops. A non-success init status fails construction and half-closes
    /// the transport.
    pub async fn start<T: StreamTransport>(
        transport: T,
        config: ReaderConfig,
    ) -> crate::Result<Self> {
        Self::start_arc(Arc::new(transport), config).await
    }

    pub async fn start_arc(
        transport: Arc<dyn StreamTransport>,
        config: ReaderConfig,
    ) -> crate::Result<Self> {
        let span = config.tracer.reader_init(InitStartInfo {
            consumer: config.consumer.clone(),
            topics: config.topics.clone(),
        });
        match Self::init_handshake(&transport, &config).await {
            Ok(init) => {
                span.finish(InitDoneInfo {
                    reader_connection_id: init.session_id.clone(),
                    error: None,
                });
                let reader = Self::new_stopped(transport, config, init.session_id);
                Inner::start_loops(&reader.inner);
                Ok(reader)
            }
            Err(err) => {
                span.finish(InitDoneInfo {
                    reader_connection_id: String::new(),
                    error: Some(err.to_string()),
                });
                let _ = transport.close_send().await;
                Err(err)
            }
        }
    }

    async fn init_handshake(
        transport: &Arc<dyn StreamTransport>,
        config: &ReaderConfig,
    ) -> crate::Result<proto::InitResponse> {
        transport
            .send(ClientMessage::Init(proto::InitRequest {
                consumer: config.consumer.clone(),
                topics: config.topics.clone(),
            }))
            .await?;

        let msg = transport.recv().await?;
        if !msg.status.is_success() {
            return Err(Error::BadServerStatus(msg.status));
        }
        match msg.body {
            ServerMessageBody::Init(init) => Ok(init),
            _ => Err(Error::Protocol(
                "expected init response as the first server message",
            )),
        }
    }

    /// Builds a reader around an already-initialised stream without starting
    /// the loops. Used by tests to control startup.
    pub(crate) fn new_stopped(
        transport: Arc<dyn StreamTransport>,
        config: ReaderConfig,
        connection_id: String,
    ) -> Self {
        let root = match &config.parent_token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let committer = Committer::new(
            config.commit_batch_time_lag,
            outbound.clone(),
            config.tracer.clone(),
        );
        let (ingest_done, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                reader_id: next_reader_id(),
                connection_id,
                commit_mode: config.commit_mode,
                tracer: config.tracer,
                transport,
                registry: SessionRegistry::default(),
                flow: FlowControl::new(config.buffer_size_bytes),
                batcher: Batcher::new(),
                committer,
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                root,
                closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                loops_started: AtomicBool::new(false),
                ingest_done,
                update_token_waiter: Mutex::new(None),
            }),
        }
    }

    /// Suspends until a batch is available per `opts` or a force condition
    /// fires. Messages of one batch always belong to one partition session
    /// and are contiguous in offset order.
    pub async fn read_message_batch(&self, opts: ReadBatchOptions) -> crate::Result<Batch> {
        let span = self.inner.tracer.read_messages(ReadMessagesStartInfo {
            min_count: opts.min_count,
            max_count: opts.max_count,
        });
        let result = self.inner.read_message_batch(opts).await;
        span.finish(ReadMessagesDoneInfo {
            messages_count: result.as_ref().map(|b| b.len()).unwrap_or(0),
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Reports `range` as processed, per the reader's commit mode.
    pub async fn commit(&self, range: &CommitRange) -> crate::Result<()> {
        let session = range.session();
        let span = self.inner.tracer.commit(CommitStartInfo {
            topic: session.as_ref().map(|s| s.topic.clone()).unwrap_or_default(),
            partition_id: session.as_ref().map(|s| s.partition_id).unwrap_or(-1),
            partition_session_id: session
                .as_ref()
                .map(|s| s.partition_session_id)
                .unwrap_or(-1),
            start_offset: range.start(),
            end_offset: range.end(),
        });
        let result = self.inner.commit(range, session).await;
        span.finish(CommitDoneInfo {
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Sends a credential refresh and suspends until the broker confirms it.
    pub async fn update_token(&self, token: String) -> crate::Result<()> {
        self.inner.update_token(token).await
    }

    /// Closes the reader: cancels the root scope, drains queued outbound
    /// frames best-effort and half-closes the transport. Idempotent; only
    /// the first call succeeds, later calls get [`Error::ReaderClosed`].
    pub async fn close_with_error(&self, reason: Error) -> crate::Result<()> {
        self.inner.close(reason, true).await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The reason of the first close, once closed.
    pub fn close_reason(&self) -> Option<Arc<Error>> {
        self.inner.close_reason.lock().unwrap().clone()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            self.inner.begin_close(Error::ReaderClosed, true);
        }
    }
}

impl Inner {
    fn start_loops(this: &Arc<Self>) {
        if this.loops_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let outbound_rx = this
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("loops start once");

        tokio::spawn(Self::ingest_loop(this.clone()));
        tokio::spawn(Self::send_loop(this.clone(), outbound_rx));
        let flusher = this.clone();
        tokio::spawn(async move { flusher.committer.run(flusher.root.clone()).await });

        if let Some(bytes) = this.flow.initial_grant() {
            this.send_read_request(bytes);
        }
    }

    async fn ingest_loop(self: Arc<Self>) {
        loop {
            let received = tokio::select! {
                _ = self.root.cancelled() => break,
                received = self.transport.recv() => received,
            };
            let result = match received {
                Ok(msg) => Self::handle_server_message(&self, msg),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                self.begin_close(err, false);
                break;
            }
        }
        let _ = self.ingest_done.send(true);
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ClientMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.root.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(err) = self.transport.send(msg).await {
                self.begin_close(err, false);
                break;
            }
        }
        // Give tasks observing the same cancellation a chance to enqueue
        // their final frames (graceful stop confirmations), then drain.
        tokio::task::yield_now().await;
        while let Ok(msg) = rx.try_recv() {
            if self.transport.send(msg).await.is_err() {
                break;
            }
        }
        let _ = self.transport.close_send().await;
    }

    fn handle_server_message(this: &Arc<Self>, msg: ServerMessage) -> crate::Result<()> {
        if !msg.status.is_success() {
            return Err(Error::BadServerStatus(msg.status));
        }
        match msg.body {
            ServerMessageBody::Read(resp) => this.on_read_response(resp),
            ServerMessageBody::StartPartitionSession(req) => this.on_start_partition(req),
            ServerMessageBody::StopPartitionSession(req) => Self::on_stop_partition(this, req),
            ServerMessageBody::CommitOffset(resp) => this.on_commit_ack(resp),
            ServerMessageBody::UpdateToken(_) => {
                if let Some(waiter) = this.update_token_waiter.lock().unwrap().take() {
                    let _ = waiter.send(());
                }
                Ok(())
            }
            ServerMessageBody::Init(_) => {
                tracing::warn!("ignoring unexpected init response mid-stream");
                Ok(())
            }
            ServerMessageBody::Unsupported { kind } => {
                tracing::warn!(kind, "ignoring unknown server message");
                Ok(())
            }
        }
    }

    fn on_read_response(&self, resp: proto::ReadResponse) -> crate::Result<()> {
        let rest_after = self.flow.debit(resp.bytes_size);
        // The window may now be spent; waiting reads re-check the force rule.
        self.batcher.wake();

        let messages_count: usize = resp
            .partition_data
            .iter()
            .flat_map(|p| p.batches.iter())
            .map(|b| b.message_data.len())
            .sum();
        let span = self.tracer.receive_data_response(ReceiveDataResponseStartInfo {
            reader_connection_id: self.connection_id.clone(),
            local_buffer_size_after_receive: rest_after,
            bytes_size: resp.bytes_size,
            partitions_count: resp.partition_data.len(),
            messages_count,
        });

        match decode_read_response(resp, &self.registry) {
            Ok(decoded) => {
                let unaccounted = decoded.unaccounted_bytes;
                for (session, messages) in decoded.per_session {
                    self.batcher.push(session, messages);
                }
                if unaccounted > 0 {
                    // A frame with no messages would otherwise leak credit.
                    self.release_credit(unaccounted);
                }
                span.finish(ReceiveDataResponseDoneInfo { error: None });
                Ok(())
            }
            Err(err) => {
                span.finish(ReceiveDataResponseDoneInfo {
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    fn on_start_partition(&self, req: proto::StartPartitionSessionRequest) -> crate::Result<()> {
        let session = PartitionSession::new(
            req.topic.clone(),
            req.partition_id,
            req.partition_session_id,
            self.reader_id,
            self.connection_id.clone(),
            req.committed_offset,
            self.root.child_token(),
        );
        self.registry.add(session.clone())?;
        tracing::debug!(
            topic = %req.topic,
            partition_id = req.partition_id,
            partition_session_id = req.partition_session_id,
            "partition session starting"
        );

        let decision = self.tracer.partition_start(PartitionStartInfo {
            reader_connection_id: self.connection_id.clone(),
            topic: req.topic,
            partition_id: req.partition_id,
            partition_session_id: req.partition_session_id,
        });
        session.mark_running();
        let _ = self.outbound.send(ClientMessage::StartPartitionSessionResponse(
            proto::StartPartitionSessionResponse {
                partition_session_id: req.partition_session_id,
                read_offset: decision.read_offset,
                commit_offset: decision.commit_offset,
            },
        ));
        Ok(())
    }

    fn on_stop_partition(
        this: &Arc<Self>,
        req: proto::StopPartitionSessionRequest,
    ) -> crate::Result<()> {
        let session = this.registry.get(req.partition_session_id)?;
        let stop_info = |token: CancellationToken| PartitionStopInfo {
            reader_connection_id: this.connection_id.clone(),
            partition_token: token,
            topic: session.topic.clone(),
            partition_id: session.partition_id,
            partition_session_id: session.partition_session_id,
            committed_offset: req.committed_offset,
            graceful: req.graceful,
        };

        if !req.graceful {
            this.registry.remove(req.partition_session_id);
            let released = this.batcher.drop_session(req.partition_session_id);
            if released > 0 {
                this.release_credit(released);
            }
            // The hook observes an already-cancelled session scope.
            let span = this.tracer.partition_stop(stop_info(session.token().clone()));
            span.finish(PartitionStopDoneInfo { error: None });
            tracing::debug!(
                partition_session_id = req.partition_session_id,
                "partition session stopped"
            );
            return Ok(());
        }

        session.mark_stopping_graceful();
        // Staged messages of the session become deliverable regardless of
        // read minimums.
        this.batcher.wake();
        let span = this.tracer.partition_stop(stop_info(session.token().clone()));
        let inner = this.clone();
        tokio::spawn(inner.graceful_stop(session, span));
        Ok(())
    }

    /// Confirms a graceful stop once the session's staged messages were
    /// delivered and every delivered offset has had its commit flushed, so
    /// the commit frame precedes the confirmation on the wire.
    async fn graceful_stop(
        self: Arc<Self>,
        session: Arc<PartitionSession>,
        span: TraceSpan<PartitionStopDoneInfo>,
    ) {
        let id = session.partition_session_id;
        loop {
            let notified = session.progress_notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let commits_done = matches!(self.commit_mode, CommitMode::None)
                || session.flushed_covers_delivered();
            if commits_done && !self.batcher.has_staged(id) {
                break;
            }
            tokio::select! {
                // On close, confirm best-effort before the stream shuts down.
                _ = self.root.cancelled() => break,
                _ = notified => {}
            }
        }

        let _ = self.outbound.send(ClientMessage::StopPartitionSessionResponse(
            proto::StopPartitionSessionResponse {
                partition_session_id: id,
            },
        ));
        span.finish(PartitionStopDoneInfo { error: None });
        self.registry.remove(id);
        tracing::debug!(partition_session_id = id, "partition session stopped gracefully");
    }

    fn on_commit_ack(&self, resp: proto::CommitOffsetResponse) -> crate::Result<()> {
        for partition in resp.partitions {
            // An ack may trail a session the reader already dropped; that is
            // not a stream fault.
            let Ok(session) = self.registry.get(partition.partition_session_id) else {
                tracing::warn!(
                    partition_session_id = partition.partition_session_id,
                    "commit ack for unknown partition session"
                );
                continue;
            };
            if session.apply_committed_ack(partition.committed_offset) {
                self.tracer.committed_notify(CommittedNotifyInfo {
                    topic: session.topic.clone(),
                    partition_id: session.partition_id,
                    partition_session_id: session.partition_session_id,
                    committed_offset: partition.committed_offset,
                });
            }
        }
        Ok(())
    }

    async fn read_message_batch(&self, opts: ReadBatchOptions) -> crate::Result<Batch> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ReaderClosed);
        }
        tokio::select! {
            _ = self.root.cancelled() => Err(Error::ReaderClosed),
            popped = self.batcher.pop(opts, &self.flow) => {
                self.release_credit(popped.released_bytes);
                Ok(popped.batch)
            }
        }
    }

    async fn commit(
        &self,
        range: &CommitRange,
        session: Option<Arc<PartitionSession>>,
    ) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ReaderClosed);
        }
        if matches!(self.commit_mode, CommitMode::None) {
            return Err(Error::CommitDisabled);
        }
        if range.is_empty() {
            return Ok(());
        }

        // A session is expired when dropped, cancelled, or not the one the
        // registry knows under its id.
        let session = session
            .filter(|s| !s.is_stopped())
            .filter(|s| {
                self.registry
                    .get(s.partition_session_id)
                    .map(|registered| Arc::ptr_eq(&registered, s))
                    .unwrap_or(false)
            });
        let Some(session) = session else {
            return match self.commit_mode {
                CommitMode::Sync => Err(Error::CommitToExpiredSession),
                // Fire-and-forget deliberately swallows expired targets.
                CommitMode::Async => Ok(()),
                CommitMode::None => unreachable!("handled above"),
            };
        };

        match self.commit_mode {
            // Order check and queue update share one lock acquisition, so
            // concurrent commits on a session cannot interleave between them.
            CommitMode::Sync => session.try_push_outstanding(range.as_offset_range())?,
            _ => session.push_outstanding(range.as_offset_range()),
        }
        self.committer.submit(session.clone(), range.as_offset_range());

        match self.commit_mode {
            CommitMode::Sync => {
                tokio::select! {
                    biased;
                    _ = self.root.cancelled() => Err(Error::ReaderClosed),
                    _ = session.token().cancelled() => Err(Error::CommitToExpiredSession),
                    result = session.wait_committed(range.end()) => result,
                }
            }
            _ => Ok(()),
        }
    }

    async fn update_token(&self, token: String) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ReaderClosed);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut waiter = self.update_token_waiter.lock().unwrap();
            if waiter.is_some() {
                return Err(Error::Protocol("token update already in flight"));
            }
            *waiter = Some(tx);
        }
        self.outbound
            .send(ClientMessage::UpdateToken(proto::UpdateTokenRequest { token }))
            .map_err(|_| Error::ReaderClosed)?;

        tokio::select! {
            biased;
            _ = self.root.cancelled() => Err(Error::ReaderClosed),
            confirmed = rx => confirmed.map_err(|_| Error::ReaderClosed),
        }
    }

    fn send_read_request(&self, bytes: i64) {
        if self
            .outbound
            .send(ClientMessage::Read(proto::ReadRequest { bytes_size: bytes }))
            .is_ok()
        {
            self.tracer.sent_data_request(SentDataRequestInfo {
                reader_connection_id: self.connection_id.clone(),
                request_bytes: bytes,
                local_buffer_size_after_sent: self.flow.rest_bytes(),
            });
        }
    }

    /// Credits freed bytes and, when the hysteresis edge is crossed, returns
    /// the accumulated window to the broker.
    fn release_credit(&self, bytes: i64) {
        if let Some(granted) = self.flow.release(bytes) {
            self.send_read_request(granted);
        }
    }

    /// Marks the reader closing and cancels the root scope. Returns whether
    /// this call was the first; at-most-once is enforced by the atomic flag.
    fn begin_close(&self, reason: Error, from_consumer: bool) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let reason_text = reason.to_string();
        tracing::debug!(
            reader_id = self.reader_id,
            connection_id = %self.connection_id,
            reason = %reason_text,
            "closing topic reader"
        );
        if !from_consumer {
            self.tracer.reader_error(ErrorInfo {
                reader_connection_id: self.connection_id.clone(),
                error: reason_text.clone(),
            });
        }
        *self.close_reason.lock().unwrap() = Some(Arc::new(reason));

        let span = self.tracer.reader_close(CloseStartInfo {
            reader_connection_id: self.connection_id.clone(),
            close_reason: reason_text,
        });
        self.root.cancel();
        self.registry.clear();
        self.batcher.wake();
        span.finish(CloseDoneInfo {});
        true
    }

    async fn close(&self, reason: Error, from_consumer: bool) -> crate::Result<()> {
        if !self.begin_close(reason, from_consumer) {
            return Err(Error::ReaderClosed);
        }
        if self.loops_started.load(Ordering::SeqCst) {
            let mut done = self.ingest_done.subscribe();
            let _ = done.wait_for(|finished| *finished).await;
        }
        Ok(())
    }
}
