//! Delivery-stream seam between the message broker and the subscriber.
//!
//! The broker itself is external; everything here models the lease protocol:
//! a [`Delivery`] carries one payload plus its [`ack`](Delivery::ack), and the
//! subscriber must settle every delivery exactly once after local handling,
//! whatever the outcome of that handling was.

mod channel;

pub use channel::{ChannelTransport, Publisher};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// One leased message.
pub struct Delivery {
    pub payload: Bytes,
    ack: AckToken,
}

impl Delivery {
    /// Settles the lease. Consumes the delivery, so a message can never be
    /// acknowledged twice.
    pub fn ack(self) {
        self.ack.settle();
    }
}

/// Consume-once settlement handle. Dropping a token without settling it is a
/// bug in the handling path and is logged as such.
struct AckToken {
    acked: Option<Arc<AtomicU64>>,
}

impl AckToken {
    fn settle(mut self) {
        if let Some(counter) = self.acked.take() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if self.acked.is_some() {
            warn!("Delivery dropped without acknowledgement");
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Waits for the next delivery. `None` means the stream is closed and
    /// nothing further will arrive.
    async fn next_delivery(&self) -> Option<Delivery>;
}
