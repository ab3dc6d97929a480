use std::collections::HashSet;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, warn};
use url::Url;

use crate::Error;
use crate::messages::SubscriptionEnvelope;
use crate::router::SubscriptionRouter;

/// Receives wire-level subscription protocol messages from the control bus,
/// applies the discard rules, and forwards the survivors to the router.
///
/// A message is discarded when it is a self-echo (originating peer id equals
/// this router's), when its source address is explicitly ignored (loopback
/// guard), or when its network name does not match this router's partition.
#[derive(Debug)]
pub struct SubscriptionMessageConsumer {
    router: SubscriptionRouter,
    ignored_sources: Mutex<HashSet<Url>>,
}

impl SubscriptionMessageConsumer {
    /// Creates a consumer feeding the given router.
    #[must_use]
    pub fn new(router: SubscriptionRouter) -> Self {
        Self {
            router,
            ignored_sources: Mutex::new(HashSet::new()),
        }
    }

    /// Adds a source address whose messages are always discarded.
    pub fn ignore_source(&self, source: Url) {
        self.ignored_sources.lock().unwrap().insert(source);
    }

    /// Decodes and consumes a raw control-bus payload. Undecodable payloads
    /// surface as errors; decodable ones are filtered and forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] for malformed payloads, or
    /// [`Error::RouterStopped`] when the router has shut down.
    pub async fn consume_payload(&self, payload: &Bytes) -> Result<(), Error> {
        let envelope = SubscriptionEnvelope::decode(payload).inspect_err(|error| {
            warn!(%error, "discarding undecodable control-bus payload");
        })?;
        self.consume(envelope).await
    }

    /// Consumes a decoded envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterStopped`] when the router has shut down.
    pub async fn consume(&self, envelope: SubscriptionEnvelope) -> Result<(), Error> {
        if envelope.message.peer_id() == self.router.peer_id() {
            debug!("discarding self-echoed subscription message");
            return Ok(());
        }
        if self.ignored_sources.lock().unwrap().contains(&envelope.source) {
            debug!(source = %envelope.source, "discarding message from ignored source");
            return Ok(());
        }
        if envelope.network != self.router.network() {
            debug!(
                network = %envelope.network,
                "discarding message from a different network partition"
            );
            return Ok(());
        }

        self.router.send(envelope.message).await
    }
}
