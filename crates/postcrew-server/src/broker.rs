//! Upstream publish/subscribe.
//!
//! The fanout bridge holds at most one `Broker` subscription per channel.
//! `LocalBroker` is the in-process implementation: each subscription is a
//! bounded queue, and publishing never waits on a slow subscriber.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use postcrew_core::ids::Channel;

pub const DEFAULT_UPSTREAM_QUEUE: usize = 1024;

/// Handle identifying one upstream subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UpstreamId(u64);

pub trait Broker: Send + Sync {
    /// Deliver `payload` to every current subscriber of `channel`. Returns
    /// the number of subscriptions that accepted it.
    fn publish(&self, channel: &Channel, payload: String) -> usize;

    fn subscribe(&self, channel: &Channel) -> (UpstreamId, mpsc::Receiver<String>);

    fn unsubscribe(&self, channel: &Channel, id: UpstreamId);
}

pub struct LocalBroker {
    channels: DashMap<Channel, Vec<(UpstreamId, mpsc::Sender<String>)>>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl LocalBroker {
    pub fn new(queue_size: usize) -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_size,
        }
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map_or(0, |subs| subs.len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_QUEUE)
    }
}

impl Broker for LocalBroker {
    fn publish(&self, channel: &Channel, payload: String) -> usize {
        let Some(mut subs) = self.channels.get_mut(channel) else {
            trace!(channel = %channel, "no subscribers");
            return 0;
        };
        let mut delivered = 0;
        subs.retain(|(id, tx)| match tx.try_send(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel = %channel, upstream = id.0, "upstream queue full, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let empty = subs.is_empty();
        drop(subs);
        if empty {
            self.channels.remove_if(channel, |_, subs| subs.is_empty());
        }
        delivered
    }

    fn subscribe(&self, channel: &Channel) -> (UpstreamId, mpsc::Receiver<String>) {
        let id = UpstreamId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.channels.entry(channel.clone()).or_default().push((id, tx));
        (id, rx)
    }

    fn unsubscribe(&self, channel: &Channel, id: UpstreamId) {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.retain(|(sub, _)| *sub != id);
        }
        self.channels.remove_if(channel, |_, subs| subs.is_empty());
    }
}
