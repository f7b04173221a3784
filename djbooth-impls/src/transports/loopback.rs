use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use djbooth_core::{Transport, TransportError};

/// An in-process broadcast channel connecting any number of participants.
///
/// Every broadcast is delivered to every registered queue, including the
/// sender's own, which matches the shared-channel semantics participants
/// have to cope with anyway.
#[derive(Default)]
pub struct LoopbackHub {
    queues: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a transport endpoint attached to this hub.
    pub fn endpoint(self: &Arc<Self>) -> LoopbackTransport {
        LoopbackTransport { hub: self.clone() }
    }

    fn fan_out(&self, envelope: Value) {
        let mut queues = self.queues.lock();

        // Dead receivers fall off on the next broadcast
        queues.retain(|q| q.send(envelope.clone()).is_ok());
    }
}

/// One participant's endpoint on a [LoopbackHub].
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn broadcast(&self, envelope: Value) -> Result<(), TransportError> {
        self.hub.fan_out(envelope);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.hub.queues.lock().push(sender);

        receiver
    }
}
