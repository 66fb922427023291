//! Channel fanout.
//!
//! The bridge keeps one upstream subscription per channel with at least one
//! interested connection. A forwarder task per channel pushes each upstream
//! message to every member's outbound queue in receipt order. The upstream
//! subscription is released when the last member leaves.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use postcrew_core::ids::{Channel, ConnectionId};

use crate::broker::{Broker, UpstreamId};
use crate::client::ClientRegistry;

struct ChannelEntry {
    members: HashSet<ConnectionId>,
    upstream: UpstreamId,
    forwarder: JoinHandle<()>,
}

pub struct FanoutBridge {
    broker: Arc<dyn Broker>,
    clients: Arc<ClientRegistry>,
    channels: Arc<DashMap<Channel, ChannelEntry>>,
}

impl FanoutBridge {
    pub fn new(broker: Arc<dyn Broker>, clients: Arc<ClientRegistry>) -> Self {
        Self {
            broker,
            clients,
            channels: Arc::new(DashMap::new()),
        }
    }

    /// Add `connection` to `channel`, subscribing upstream if it is the
    /// channel's first member. Returns false if it was already a member.
    pub fn join(&self, connection: &ConnectionId, channel: &Channel) -> bool {
        match self.channels.entry(channel.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().members.insert(connection.clone()),
            Entry::Vacant(entry) => {
                let (upstream, rx) = self.broker.subscribe(channel);
                let forwarder = tokio::spawn(forward(
                    channel.clone(),
                    rx,
                    Arc::clone(&self.channels),
                    Arc::clone(&self.clients),
                ));
                entry.insert(ChannelEntry {
                    members: HashSet::from([connection.clone()]),
                    upstream,
                    forwarder,
                });
                debug!(channel = %channel, "upstream subscribed");
                true
            }
        }
    }

    /// Remove `connection` from `channel`, releasing the upstream
    /// subscription when no members remain.
    pub fn leave(&self, connection: &ConnectionId, channel: &Channel) -> bool {
        let Entry::Occupied(mut entry) = self.channels.entry(channel.clone()) else {
            return false;
        };
        let removed = entry.get_mut().members.remove(connection);
        if entry.get().members.is_empty() {
            let released = entry.remove();
            self.broker.unsubscribe(channel, released.upstream);
            released.forwarder.abort();
            debug!(channel = %channel, "upstream released");
        }
        removed
    }

    pub fn member_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map_or(0, |e| e.members.len())
    }

    /// Channels with a live upstream subscription.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

async fn forward(
    channel: Channel,
    mut rx: mpsc::Receiver<String>,
    channels: Arc<DashMap<Channel, ChannelEntry>>,
    clients: Arc<ClientRegistry>,
) {
    while let Some(message) = rx.recv().await {
        let members: Vec<ConnectionId> = match channels.get(&channel) {
            Some(entry) => entry.members.iter().cloned().collect(),
            None => break,
        };
        for member in &members {
            if !clients.send_to(member, message.clone()) {
                trace!(channel = %channel, connection_id = %member, "delivery skipped");
            }
        }
    }
    trace!(channel = %channel, "forwarder stopped");
}
