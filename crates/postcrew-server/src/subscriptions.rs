use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use postcrew_core::ids::{Channel, ConnectionId};

use crate::bridge::FanoutBridge;

/// Which channels each connection listens on.
///
/// Each mutation holds the connection's entry while it updates the bridge,
/// so a connection's view and the bridge's membership never disagree.
pub struct SubscriptionRegistry {
    bridge: Arc<FanoutBridge>,
    by_connection: DashMap<ConnectionId, HashSet<Channel>>,
}

impl SubscriptionRegistry {
    pub fn new(bridge: Arc<FanoutBridge>) -> Self {
        Self {
            bridge,
            by_connection: DashMap::new(),
        }
    }

    /// Returns false when the connection was already subscribed.
    pub fn subscribe(&self, connection: &ConnectionId, channel: &Channel) -> bool {
        let mut channels = self.by_connection.entry(connection.clone()).or_default();
        if !channels.insert(channel.clone()) {
            return false;
        }
        self.bridge.join(connection, channel);
        true
    }

    pub fn unsubscribe(&self, connection: &ConnectionId, channel: &Channel) -> bool {
        let Some(mut channels) = self.by_connection.get_mut(connection) else {
            return false;
        };
        if !channels.remove(channel) {
            return false;
        }
        self.bridge.leave(connection, channel);
        let empty = channels.is_empty();
        drop(channels);
        if empty {
            self.by_connection.remove_if(connection, |_, c| c.is_empty());
        }
        true
    }

    /// Forget every subscription of a closed connection. Returns how many
    /// channels it was on.
    pub fn drop_connection(&self, connection: &ConnectionId) -> usize {
        let Some((_, channels)) = self.by_connection.remove(connection) else {
            return 0;
        };
        for channel in &channels {
            self.bridge.leave(connection, channel);
        }
        tracing::debug!(connection_id = %connection, channels = channels.len(), "subscriptions dropped");
        channels.len()
    }

    pub fn channels_for(&self, connection: &ConnectionId) -> Vec<Channel> {
        self.by_connection
            .get(connection)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::client::ClientRegistry;
    use postcrew_core::ids::RunId;

    fn channel(run: &str) -> Channel {
        Channel::for_run(&RunId::from_raw(run))
    }

    fn setup() -> (Arc<LocalBroker>, Arc<FanoutBridge>, SubscriptionRegistry) {
        let broker = Arc::new(LocalBroker::default());
        let clients = Arc::new(ClientRegistry::new(32));
        let bridge = Arc::new(FanoutBridge::new(broker.clone(), clients));
        let subs = SubscriptionRegistry::new(bridge.clone());
        (broker, bridge, subs)
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let (broker, bridge, subs) = setup();
        let conn = ConnectionId::new();
        assert!(subs.subscribe(&conn, &channel("run_1")));
        assert!(!subs.subscribe(&conn, &channel("run_1")));
        assert_eq!(bridge.member_count(&channel("run_1")), 1);
        assert_eq!(broker.subscriber_count(&channel("run_1")), 1);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_false() {
        let (_, _, subs) = setup();
        let conn = ConnectionId::new();
        assert!(!subs.unsubscribe(&conn, &channel("run_1")));
        subs.subscribe(&conn, &channel("run_1"));
        assert!(!subs.unsubscribe(&conn, &channel("run_2")));
        assert!(subs.unsubscribe(&conn, &channel("run_1")));
        assert!(subs.channels_for(&conn).is_empty());
    }

    #[tokio::test]
    async fn drop_connection_releases_every_channel() {
        let (broker, bridge, subs) = setup();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        subs.subscribe(&a, &channel("run_1"));
        subs.subscribe(&a, &channel("run_2"));
        subs.subscribe(&b, &channel("run_2"));

        assert_eq!(subs.drop_connection(&a), 2);
        assert_eq!(subs.drop_connection(&a), 0);
        assert_eq!(broker.subscriber_count(&channel("run_1")), 0);
        assert_eq!(broker.subscriber_count(&channel("run_2")), 1);
        assert_eq!(bridge.member_count(&channel("run_2")), 1);
        assert_eq!(subs.channels_for(&b), vec![channel("run_2")]);
    }
}
