use std::collections::HashMap;

use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::endpoint_subscription::{EndpointSubscriptionCache, LocalSubscription};
use crate::messages::PeerSubscription;

/// A known remote bus instance.
#[derive(Clone, Debug)]
pub struct Peer {
    /// The peer's id, generated once per process start.
    pub peer_id: Uuid,
    /// The peer's control address.
    pub uri: Url,
    /// Unix milliseconds at which the peer announced itself.
    pub timestamp_ms: u64,
}

/// A zero-crossing change to the local subscription set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// The first peer became interested in a key.
    Added(LocalSubscription),
    /// The last interested peer went away.
    Removed(LocalSubscription),
}

/// The authoritative table of peers and their subscriptions. All events are
/// idempotent; duplicates and out-of-order arrivals never corrupt state.
/// Owned exclusively by the router task.
#[derive(Debug, Default)]
pub struct PeerCache {
    peers: HashMap<Uuid, Peer>,
    subscriptions: HashMap<Uuid, PeerSubscription>,
    endpoints: EndpointSubscriptionCache,
}

impl PeerCache {
    /// Registers or refreshes a peer. A peer announcing itself on a URI
    /// previously owned by a different peer id supersedes the old peer: the
    /// stale peer and all its subscriptions are removed first.
    pub fn add_peer(&mut self, peer_id: Uuid, uri: &Url, timestamp_ms: u64) -> Vec<SubscriptionChange> {
        let stale: Vec<Uuid> = self
            .peers
            .values()
            .filter(|peer| peer.uri == *uri && peer.peer_id != peer_id)
            .map(|peer| peer.peer_id)
            .collect();

        let mut changes = Vec::new();
        for stale_id in stale {
            debug!(%stale_id, %peer_id, "peer restarted, superseding stale registration");
            changes.extend(self.remove_peer(stale_id));
        }

        self.peers.insert(
            peer_id,
            Peer {
                peer_id,
                uri: uri.clone(),
                timestamp_ms,
            },
        );
        changes
    }

    /// Removes a peer and, transitively, every subscription it owns.
    /// Unknown peers are a no-op.
    pub fn remove_peer(&mut self, peer_id: Uuid) -> Vec<SubscriptionChange> {
        self.peers.remove(&peer_id);

        let owned: Vec<Uuid> = self
            .subscriptions
            .values()
            .filter(|s| s.peer_id == peer_id)
            .map(|s| s.subscription_id)
            .collect();

        owned
            .into_iter()
            .filter_map(|id| self.remove_subscription(id))
            .collect()
    }

    /// Records a peer subscription. Idempotent by subscription id: re-adding
    /// a known id is a no-op. Returns the local change on a 0→1 transition.
    pub fn add_subscription(&mut self, subscription: PeerSubscription) -> Option<SubscriptionChange> {
        if self.subscriptions.contains_key(&subscription.subscription_id) {
            return None;
        }

        let change = self
            .endpoints
            .add(
                &subscription.message_name,
                subscription.correlation_id.as_deref(),
                subscription.subscription_id,
                &subscription.endpoint_uri,
            )
            .map(SubscriptionChange::Added);
        self.subscriptions
            .insert(subscription.subscription_id, subscription);
        change
    }

    /// Removes a peer subscription by id. Idempotent; returns the local
    /// change on a 1→0 transition.
    pub fn remove_subscription(&mut self, subscription_id: Uuid) -> Option<SubscriptionChange> {
        let subscription = self.subscriptions.remove(&subscription_id)?;
        self.endpoints
            .remove(
                &subscription.message_name,
                subscription.correlation_id.as_deref(),
                subscription_id,
            )
            .map(SubscriptionChange::Removed)
    }

    /// The registered peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    /// Number of live peer subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
