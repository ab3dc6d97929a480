use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hive_bus::address::EndpointAddress;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, warn};

use crate::ConnectivityError;
use crate::connection::{
    Channel, ConfirmEvent, ConfirmOutcome, ConfirmSink, Connection, MessageProperties,
};
use crate::handler::ConnectionBinding;

/// Settings for a producer binding.
#[derive(Clone, Debug)]
pub struct ProducerSettings {
    /// Whether publisher confirmations are enabled for this binding.
    pub confirms: bool,
    /// Number of acks to deliberately treat as nacks, so the confirm-failure
    /// path can be exercised deterministically in tests.
    pub test_nacks: u64,
    /// Bound on how long an unbind waits for still-pending confirms.
    pub pending_confirm_timeout: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            confirms: true,
            test_nacks: 0,
            pending_confirm_timeout: Duration::from_secs(60),
        }
    }
}

/// In-flight publish confirmations: channel sequence number mapped to the
/// client message id carried in the message header.
#[derive(Debug, Default)]
pub struct PendingConfirms {
    entries: StdMutex<BTreeMap<u64, String>>,
}

impl PendingConfirms {
    /// Records a pending confirmation. Must be called before the transmit so
    /// an early ack cannot race the map entry.
    pub fn insert(&self, sequence: u64, message_id: String) {
        self.entries.lock().unwrap().insert(sequence, message_id);
    }

    /// Resolves a confirm event into the client message ids it covers. With
    /// `multiple` set, every pending entry with sequence ≤ `delivery_tag` is
    /// removed; otherwise only the exact tag.
    pub fn resolve(&self, delivery_tag: u64, multiple: bool) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        if multiple {
            let rest = entries.split_off(&(delivery_tag + 1));
            let resolved = std::mem::replace(&mut *entries, rest);
            resolved.into_values().collect()
        } else {
            entries.remove(&delivery_tag).into_iter().collect()
        }
    }

    /// Removes and returns every pending entry.
    pub fn drain(&self) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        std::mem::take(&mut *entries).into_values().collect()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[derive(Debug)]
struct ProducerState<Ch> {
    channel: Option<Arc<Ch>>,
    stop_confirm_task: Option<watch::Sender<()>>,
}

/// A connection-scoped publisher channel. Tracks in-flight
/// publish-confirmation sequence numbers and routes broker ack/nack events
/// back to the confirm sink.
#[derive(Debug)]
pub struct ProducerBinding<C>
where
    C: Connection,
{
    address: EndpointAddress,
    settings: ProducerSettings,
    sink: Arc<dyn ConfirmSink>,
    pending: Arc<PendingConfirms>,
    forced_nacks: Arc<AtomicU64>,
    state: Mutex<ProducerState<C::Channel>>,
}

impl<C> ProducerBinding<C>
where
    C: Connection,
{
    /// Creates an unbound producer binding for the addressed destination.
    #[must_use]
    pub fn new(
        address: EndpointAddress,
        settings: ProducerSettings,
        sink: Arc<dyn ConfirmSink>,
    ) -> Self {
        Self {
            address,
            settings,
            sink,
            pending: Arc::new(PendingConfirms::default()),
            forced_nacks: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(ProducerState {
                channel: None,
                stop_confirm_task: None,
            }),
        }
    }

    /// Publishes a message on the bound channel. When confirms are enabled
    /// the pending entry is recorded before the transmit.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::InvalidConnection`] when unbound, or the
    /// channel's publish failure.
    pub async fn publish(
        &self,
        destination: &str,
        properties: MessageProperties,
        body: Bytes,
    ) -> Result<(), ConnectivityError> {
        let state = self.state.lock().await;
        let channel = state.channel.as_ref().ok_or_else(|| {
            ConnectivityError::invalid_connection(self.address.uri(), "producer channel not bound")
        })?;

        if self.settings.confirms {
            if let Some(message_id) = properties.client_message_id() {
                self.pending
                    .insert(channel.next_publish_sequence(), message_id.to_string());
            }
        }

        channel.publish(destination, properties, body).await
    }

    /// Whether confirms are still awaiting resolution.
    #[must_use]
    pub fn has_pending_confirms(&self) -> bool {
        !self.pending.is_empty()
    }

    fn spawn_confirm_task(&self, channel: &Arc<C::Channel>) -> watch::Sender<()> {
        let (stop_sender, mut stop_receiver) = watch::channel(());
        let mut events = channel.confirm_events();
        let pending = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);
        let forced_nacks = Arc::clone(&self.forced_nacks);
        let test_nacks = self.settings.test_nacks;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_receiver.changed() => break,
                    event = events.recv() => {
                        let Ok(event) = event else { break };
                        handle_confirm(&pending, &sink, &forced_nacks, test_nacks, event).await;
                    }
                }
            }
        });

        stop_sender
    }

    async fn wait_for_pending_confirms(&self) {
        let deadline = tokio::time::Instant::now() + self.settings.pending_confirm_timeout;
        while !self.pending.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    uri = %self.address.uri(),
                    "timeout waiting for all pending confirms"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn fail_pending_confirms(&self) {
        let message_ids = self.pending.drain();
        if !message_ids.is_empty() {
            self.sink.record_failure(message_ids).await;
        }
    }
}

async fn handle_confirm(
    pending: &PendingConfirms,
    sink: &Arc<dyn ConfirmSink>,
    forced_nacks: &AtomicU64,
    test_nacks: u64,
    event: ConfirmEvent,
) {
    let message_ids = pending.resolve(event.delivery_tag, event.multiple);
    if message_ids.is_empty() {
        return;
    }

    match event.outcome {
        ConfirmOutcome::Ack => {
            let forced = forced_nacks.load(Ordering::SeqCst);
            if forced < test_nacks {
                forced_nacks.fetch_add(message_ids.len() as u64, Ordering::SeqCst);
                debug!(count = message_ids.len(), "treating ack as nack for testing");
                sink.record_failure(message_ids).await;
            } else {
                sink.record_success(message_ids).await;
            }
        }
        ConfirmOutcome::Nack => sink.record_failure(message_ids).await,
    }
}

#[async_trait]
impl<C> ConnectionBinding<C> for ProducerBinding<C>
where
    C: Connection,
{
    async fn bind(&self, connection: &C) -> Result<(), ConnectivityError> {
        let mut state = self.state.lock().await;

        let channel = Arc::new(connection.open_channel().await.map_err(|error| {
            error!(%error, uri = %self.address.uri(), "failed to open producer channel");
            ConnectivityError::invalid_connection(self.address.uri(), "invalid connection to host")
        })?);

        if self.settings.confirms {
            channel.enable_confirms().await?;
            state.stop_confirm_task = Some(self.spawn_confirm_task(&channel));
        }

        state.channel = Some(channel);
        Ok(())
    }

    async fn unbind(&self, _connection: &C) -> Result<(), ConnectivityError> {
        if self.settings.confirms {
            self.wait_for_pending_confirms().await;
        }

        let mut state = self.state.lock().await;
        if let Some(stop) = state.stop_confirm_task.take() {
            let _ = stop.send(());
        }
        if let Some(channel) = state.channel.take() {
            if let Err(error) = channel.close().await {
                warn!(%error, "closing producer channel failed");
            }
        }
        drop(state);

        // Anything still pending re-enters the durability pipeline rather
        // than being silently lost.
        self.fail_pending_confirms().await;
        Ok(())
    }
}
