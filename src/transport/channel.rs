use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

use super::{AckToken, Delivery, Transport};

/// In-process transport backed by a bounded channel.
///
/// Stands in for the managed broker during file replay and in tests. The
/// bounded channel gives `publish` back-pressure when the subscriber falls
/// behind, which is the same shape the real broker client presents.
pub struct ChannelTransport {
    receiver: Mutex<mpsc::Receiver<Bytes>>,
    acked: Arc<AtomicU64>,
}

/// Sending half. Clone freely; the stream closes once every clone is dropped
/// and the buffered messages have been consumed.
#[derive(Clone)]
pub struct Publisher {
    sender: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    pub fn open(capacity: usize) -> (Publisher, ChannelTransport) {
        let (sender, receiver) = mpsc::channel(capacity);
        let transport = ChannelTransport {
            receiver: Mutex::new(receiver),
            acked: Arc::new(AtomicU64::new(0)),
        };
        (Publisher { sender }, transport)
    }

    /// Number of deliveries settled so far.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }
}

impl Publisher {
    /// # Errors
    ///
    /// Fails when the transport has been dropped and nothing can consume the
    /// message.
    pub async fn publish(&self, payload: Bytes) -> Result<()> {
        self.sender
            .send(payload)
            .await
            .map_err(|_| anyhow!("transport closed, message not published"))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn next_delivery(&self) -> Option<Delivery> {
        let payload = self.receiver.lock().await.recv().await?;
        Some(Delivery {
            payload,
            ack: AckToken {
                acked: Some(self.acked.clone()),
            },
        })
    }
}
