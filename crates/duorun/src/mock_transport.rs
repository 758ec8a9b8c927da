//! In-memory transports.
//!
//! Used by the test suite and by embedders that run two peers in one process.

use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::unbounded_channel;

use crate::transport;
use crate::transport::Transport;

/// One end of an in-process link.
///
/// Frames sent on one end are received, in order, on the other. After
/// `close` the far end drains what was already sent and then sees `None`.
pub struct DuplexChannelTransport {
    outbound: std::sync::Mutex<Option<UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<UnboundedReceiver<Vec<u8>>>,
}

impl DuplexChannelTransport {
    /// Two ends wired to each other.
    pub fn pair() -> (Self, Self) {
        let (to_right, from_left) = unbounded_channel();
        let (to_left, from_right) = unbounded_channel();
        (Self::end(to_right, from_right), Self::end(to_left, from_left))
    }

    fn end(outbound: UnboundedSender<Vec<u8>>, inbound: UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            outbound: std::sync::Mutex::new(Some(outbound)),
            inbound: Mutex::new(inbound),
        }
    }

    fn sender(&self) -> Option<UnboundedSender<Vec<u8>>> {
        self.outbound.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let Some(sender) = self.sender() else {
            return Err(transport::Error::ConnectionLost("local end closed".into()));
        };
        sender
            .send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("remote end dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> transport::Result<()> {
        if let Ok(mut guard) = self.outbound.lock() {
            guard.take();
        }
        Ok(())
    }
}
