use crate::proto::{ClientMessage, ServerMessage};

/// An established bidirectional frame stream to the broker.
///
/// The caller is responsible for dialing, authentication and retry; the
/// reader engine only consumes this narrow surface. Implementations need not
/// be internally thread-safe beyond what the signatures require: the engine
/// guarantees at most one in-flight `recv` (the ingest loop) and at most one
/// in-flight `send` (the send loop) at any time.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Blocks until the next server frame is available.
    async fn recv(&self) -> crate::Result<ServerMessage>;

    /// Writes one client frame to the stream.
    async fn send(&self, msg: ClientMessage) -> crate::Result<()>;

    /// Half-closes the client side of the stream. Idempotent.
    async fn close_send(&self) -> crate::Result<()>;
}
