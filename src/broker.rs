use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send to {topic} failed: {reason}")]
    Send { topic: String, reason: String },
    #[error("flush failed: {0}")]
    Flush(String),
    #[error("flush not acknowledged within {0:?}")]
    FlushTimeout(Duration),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("transport closed")]
    Closed,
}

/// A message handed out by a [`MessageSource`]. `ack` is whatever the
/// transport needs to commit past this message.
#[derive(Clone, Debug)]
pub struct InboundMessage<A> {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
    pub ack: A,
}

/// Consuming half of the broker contract. Never commits on its own.
#[async_trait]
pub trait MessageSource: Send {
    type Ack: Send + Sync;

    /// Waits at most `timeout` for the next message; `Ok(None)` on timeout.
    async fn recv(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage<Self::Ack>>, TransportError>;

    /// Advances the committed position to include `message`.
    async fn commit(&mut self, message: &InboundMessage<Self::Ack>) -> Result<(), TransportError>;

    /// Hands back a message that was not committed. It is the next one
    /// `recv` returns, ahead of anything received after it.
    fn redeliver(&mut self, message: InboundMessage<Self::Ack>);
}

/// Producing half: keyed, buffered sends plus a flush that returns once the
/// broker acknowledged everything submitted so far.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn flush(&self) -> Result<(), TransportError>;
}
