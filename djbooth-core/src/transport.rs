use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub type BoxedTransport = Box<dyn Transport>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel went away entirely, retrying is pointless
    #[error("Transport is closed")]
    Closed,
    /// A send failed in a way that may succeed on retry
    #[error("Broadcast failed: {0}")]
    Send(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Send(_))
    }
}

/// Represents the single shared publish/subscribe channel between
/// participants. There is no direct addressing.
///
/// Delivery is at-least-once with no ordering guarantee, and every
/// participant receives its own broadcasts back. Envelopes are JSON values,
/// the wire encoding beyond that is the implementor's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Broadcasts an envelope to every participant on the channel.
    async fn broadcast(&self, envelope: Value) -> Result<(), TransportError>;

    /// Returns a receiver of incoming envelopes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value>;
}
