use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::Error;

/// The message type name control envelopes travel under.
pub const CONTROL_MESSAGE_NAME: &str = "SubscriptionEnvelope";

/// A wire-level subscription coordination message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum SubscriptionMessage {
    /// A peer announced itself (startup or refresh).
    AddPeer {
        /// The announcing peer's id.
        peer_id: Uuid,
        /// The peer's control address.
        peer_uri: Url,
        /// Unix milliseconds at which the peer started.
        timestamp_ms: u64,
    },
    /// A peer is leaving the network.
    RemovePeer {
        /// The leaving peer's id.
        peer_id: Uuid,
        /// The peer's control address.
        peer_uri: Url,
        /// Unix milliseconds at which the peer left.
        timestamp_ms: u64,
    },
    /// A peer gained interest in a message type.
    AddPeerSubscription(PeerSubscription),
    /// A peer lost interest in a message type.
    RemovePeerSubscription(PeerSubscription),
}

impl SubscriptionMessage {
    /// The id of the peer this message originates from.
    #[must_use]
    pub const fn peer_id(&self) -> Uuid {
        match self {
            Self::AddPeer { peer_id, .. } | Self::RemovePeer { peer_id, .. } => *peer_id,
            Self::AddPeerSubscription(subscription)
            | Self::RemovePeerSubscription(subscription) => subscription.peer_id,
        }
    }
}

/// One peer's interest in one message type, as carried on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSubscription {
    /// The owning peer's id.
    pub peer_id: Uuid,
    /// The subscription's globally unique id; adds and removes are
    /// idempotent on it.
    pub subscription_id: Uuid,
    /// Per-producer monotonically increasing sequence number.
    pub message_number: u64,
    /// Where messages of this type should be delivered for this peer.
    pub endpoint_uri: Url,
    /// The message type name subscribed to.
    pub message_name: String,
    /// Optional correlation discriminator narrowing the subscription.
    pub correlation_id: Option<String>,
}

/// The envelope every protocol message travels in. `network` partitions a
/// shared control bus into independent subscription domains; `source` is the
/// transport address the message was sent from, used by the loopback guard.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionEnvelope {
    /// The network partition name.
    pub network: String,
    /// The sending instance's control address.
    pub source: Url,
    /// The protocol message.
    pub message: SubscriptionMessage,
}

impl SubscriptionEnvelope {
    /// Serializes the envelope for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when serialization fails.
    pub fn encode(&self) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserializes an envelope received from the control bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the payload is not a valid envelope.
    pub fn decode(payload: &Bytes) -> Result<Self, Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Milliseconds since the unix epoch, for peer timestamps.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let envelope = SubscriptionEnvelope {
            network: "production".to_string(),
            source: Url::parse("rabbitmq://node-a/control").unwrap(),
            message: SubscriptionMessage::AddPeerSubscription(PeerSubscription {
                peer_id: Uuid::new_v4(),
                subscription_id: Uuid::new_v4(),
                message_number: 17,
                endpoint_uri: Url::parse("rabbitmq://node-a/orders").unwrap(),
                message_name: "OrderPlaced".to_string(),
                correlation_id: Some("region-7".to_string()),
            }),
        };

        let decoded = SubscriptionEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn peer_id_is_extracted_from_every_variant() {
        let peer_id = Uuid::new_v4();
        let uri = Url::parse("rabbitmq://node/control").unwrap();

        let add = SubscriptionMessage::AddPeer {
            peer_id,
            peer_uri: uri.clone(),
            timestamp_ms: now_ms(),
        };
        let remove = SubscriptionMessage::RemovePeer {
            peer_id,
            peer_uri: uri,
            timestamp_ms: now_ms(),
        };

        assert_eq!(add.peer_id(), peer_id);
        assert_eq!(remove.peer_id(), peer_id);
    }

    #[test]
    fn malformed_payload_is_a_codec_error() {
        let result = SubscriptionEnvelope::decode(&Bytes::from_static(b"not json"));
        assert!(matches!(result, Err(Error::Codec(_))));
    }
}
