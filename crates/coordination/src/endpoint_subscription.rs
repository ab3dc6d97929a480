use std::collections::{HashMap, HashSet};

use url::Url;
use uuid::Uuid;

/// A local subscription handle, created when the first peer shows interest
/// in a key and referenced again when the last peer loses it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalSubscription {
    /// Locally generated id for the dispatcher-facing subscription.
    pub subscription_id: Uuid,
    /// The message type name.
    pub message_name: String,
    /// Optional correlation discriminator.
    pub correlation_id: Option<String>,
    /// Where interested peers want deliveries sent.
    pub endpoint_uri: Url,
}

type SubscriptionKey = (String, Option<String>);

#[derive(Debug)]
struct EndpointSubscription {
    local: LocalSubscription,
    contributors: HashSet<Uuid>,
}

/// Aggregates peer subscriptions per (message type, correlation) key.
///
/// Many peers interested in one key collapse into a single local
/// subscription; the cache reports only the zero-crossing transitions.
#[derive(Debug, Default)]
pub struct EndpointSubscriptionCache {
    entries: HashMap<SubscriptionKey, EndpointSubscription>,
}

impl EndpointSubscriptionCache {
    /// Records a peer subscription's interest in a key. Returns the local
    /// subscription on the 0→1 transition; `None` for every further
    /// contributor or a duplicate id.
    pub fn add(
        &mut self,
        message_name: &str,
        correlation_id: Option<&str>,
        peer_subscription_id: Uuid,
        endpoint_uri: &Url,
    ) -> Option<LocalSubscription> {
        let key = (
            message_name.to_string(),
            correlation_id.map(ToString::to_string),
        );

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.contributors.insert(peer_subscription_id);
            return None;
        }

        let local = LocalSubscription {
            subscription_id: Uuid::new_v4(),
            message_name: message_name.to_string(),
            correlation_id: correlation_id.map(ToString::to_string),
            endpoint_uri: endpoint_uri.clone(),
        };
        self.entries.insert(
            key,
            EndpointSubscription {
                local: local.clone(),
                contributors: HashSet::from([peer_subscription_id]),
            },
        );
        Some(local)
    }

    /// Withdraws a peer subscription's interest. Returns the local
    /// subscription on the 1→0 transition; `None` otherwise, including for
    /// an id that was never a contributor.
    pub fn remove(
        &mut self,
        message_name: &str,
        correlation_id: Option<&str>,
        peer_subscription_id: Uuid,
    ) -> Option<LocalSubscription> {
        let key = (
            message_name.to_string(),
            correlation_id.map(ToString::to_string),
        );

        let entry = self.entries.get_mut(&key)?;
        if !entry.contributors.remove(&peer_subscription_id) {
            return None;
        }
        if entry.contributors.is_empty() {
            return self.entries.remove(&key).map(|e| e.local);
        }
        None
    }

    /// Number of keys with at least one contributor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has contributors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri() -> Url {
        Url::parse("rabbitmq://node-a/orders").unwrap()
    }

    #[test]
    fn first_contributor_creates_the_local_subscription() {
        let mut cache = EndpointSubscriptionCache::default();

        let created = cache.add("OrderPlaced", None, Uuid::new_v4(), &uri());
        let local = created.expect("0->1 transition must notify");
        assert_eq!(local.message_name, "OrderPlaced");
        assert_eq!(local.endpoint_uri, uri());

        // A second peer interested in the same key is silent.
        assert!(cache.add("OrderPlaced", None, Uuid::new_v4(), &uri()).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn last_contributor_removal_reports_the_same_local_subscription() {
        let mut cache = EndpointSubscriptionCache::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let created = cache.add("OrderPlaced", None, first, &uri()).unwrap();
        cache.add("OrderPlaced", None, second, &uri());

        assert!(cache.remove("OrderPlaced", None, first).is_none());
        let removed = cache.remove("OrderPlaced", None, second).unwrap();
        assert_eq!(removed.subscription_id, created.subscription_id);
        assert!(cache.is_empty());
    }

    #[test]
    fn duplicate_adds_and_removes_are_noops() {
        let mut cache = EndpointSubscriptionCache::default();
        let id = Uuid::new_v4();

        assert!(cache.add("OrderPlaced", None, id, &uri()).is_some());
        assert!(cache.add("OrderPlaced", None, id, &uri()).is_none());

        assert!(cache.remove("OrderPlaced", None, id).is_some());
        assert!(cache.remove("OrderPlaced", None, id).is_none());
    }

    #[test]
    fn correlation_ids_are_distinct_keys() {
        let mut cache = EndpointSubscriptionCache::default();

        assert!(cache.add("Audit", Some("eu"), Uuid::new_v4(), &uri()).is_some());
        assert!(cache.add("Audit", Some("us"), Uuid::new_v4(), &uri()).is_some());
        assert!(cache.add("Audit", None, Uuid::new_v4(), &uri()).is_some());
        assert_eq!(cache.len(), 3);
    }
}
