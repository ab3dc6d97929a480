use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use hive_bus::message::ConfirmableMessage;
use hive_transport::connection::ConfirmSink;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::backing_store::UnconfirmedMessageRepository;
use crate::confirmer::Confirmer;
use crate::endpoint::PublishEndpoint;
use crate::settings::PublishSettings;

/// Publishes confirm-tracked messages with a durable backpressure fallback.
///
/// While the broker behaves, messages go straight out and their confirms
/// clear the pending table. After `max_successive_failures` consecutive
/// failures publication flips off: new messages buffer in memory, the
/// background timer persists the buffer to the backing store and probes the
/// broker with one stored message at a time, and the first success re-enables
/// publication and sweeps everything stored back out.
#[derive(Debug)]
pub struct Publisher {
    id: String,
    settings: PublishSettings,
    endpoint: Arc<dyn PublishEndpoint>,
    repository: Arc<dyn UnconfirmedMessageRepository>,
    confirmer: Confirmer,
    publication_enabled: AtomicBool,
    successive_failures: AtomicU32,
    retrying: AtomicBool,
    flushing: AtomicBool,
    buffer: Mutex<VecDeque<ConfirmableMessage>>,
    last_retry: Mutex<Instant>,
    last_flush: Mutex<Instant>,
    stop_timer: Mutex<Option<watch::Sender<()>>>,
}

impl Publisher {
    /// Validates the settings, creates the publisher, and starts its
    /// background timer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] when the settings do not validate.
    pub fn start(
        id: impl Into<String>,
        settings: PublishSettings,
        endpoint: Arc<dyn PublishEndpoint>,
        repository: Arc<dyn UnconfirmedMessageRepository>,
    ) -> Result<Arc<Self>, Error> {
        settings.validate()?;

        let (stop_sender, stop_receiver) = watch::channel(());
        let publisher = Arc::new(Self {
            id: id.into(),
            settings,
            endpoint,
            repository,
            confirmer: Confirmer::default(),
            publication_enabled: AtomicBool::new(true),
            successive_failures: AtomicU32::new(0),
            retrying: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            buffer: Mutex::new(VecDeque::new()),
            last_retry: Mutex::new(Instant::now()),
            last_flush: Mutex::new(Instant::now()),
            stop_timer: Mutex::new(Some(stop_sender)),
        });

        tokio::spawn(run_timer(Arc::clone(&publisher), stop_receiver));
        Ok(publisher)
    }

    /// This publisher's id, the backing-store partition key.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether direct publication is currently enabled.
    #[must_use]
    pub fn publication_enabled(&self) -> bool {
        self.publication_enabled.load(Ordering::SeqCst)
    }

    /// Number of messages waiting in the in-memory buffer.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Number of in-flight messages awaiting confirmation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.confirmer.pending_count()
    }

    /// Publishes a message. Fire and forget from the caller's view: when
    /// direct publication is not currently allowed the message is buffered,
    /// and a synchronous send failure is recorded rather than returned.
    pub async fn publish(&self, message: ConfirmableMessage) {
        if self.publication_enabled() && !self.retrying.load(Ordering::SeqCst) {
            self.transmit(message).await;
        } else {
            self.buffer.lock().unwrap().push_back(message);
        }
    }

    /// Drains the in-memory buffer: to the transport while publication is
    /// enabled, to the backing store while it is disabled (never both).
    /// Deferred while a probe or sweep holds the retry flag. Normally driven
    /// by the background timer.
    pub async fn flush_buffer(&self) {
        if self.retrying.load(Ordering::SeqCst) {
            return;
        }
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<ConfirmableMessage> =
            self.buffer.lock().unwrap().drain(..).collect();
        if !drained.is_empty() {
            if self.publication_enabled() {
                debug!(count = drained.len(), "flushing buffer to transport");
                for message in drained {
                    self.transmit(message).await;
                }
            } else {
                debug!(count = drained.len(), "persisting buffer to the backing store");
                if let Err(store_error) = self
                    .repository
                    .store_messages(drained.clone(), &self.id)
                    .await
                {
                    error!(%store_error, "failed to persist buffered messages");
                    self.buffer.lock().unwrap().extend(drained);
                }
            }
        }

        self.flushing.store(false, Ordering::SeqCst);
    }

    /// Pops one stored message and force-publishes it to probe whether the
    /// broker has recovered. Runs only while publication is disabled.
    /// Normally driven by the background timer.
    pub async fn probe_stored(&self) {
        if self.publication_enabled() {
            return;
        }
        if self.retrying.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.repository.get_and_delete_messages(&self.id, 1).await {
            Ok(page) => {
                for message in page {
                    debug!(message_id = %message.id, "probing broker with stored message");
                    self.transmit(message).await;
                }
            }
            Err(store_error) => error!(%store_error, "failed to read the backing store"),
        }

        self.retrying.store(false, Ordering::SeqCst);
    }

    /// Stops the background timer.
    pub fn shutdown(&self) {
        if let Some(stop) = self.stop_timer.lock().unwrap().take() {
            let _ = stop.send(());
        }
    }

    async fn transmit(&self, message: ConfirmableMessage) {
        let message_id = message.id.clone();
        self.confirmer.record(message.clone());
        if let Err(send_error) = self.endpoint.send(&message).await {
            warn!(%send_error, %message_id, "publish failed");
            self.record_failure(vec![message_id]).await;
        }
    }

    async fn sweep(&self) {
        // The probe may still hold the retry flag when its own ack lands
        // here; the sweep claims it unconditionally so recovery never waits
        // on the probe interval.
        self.retrying.store(true, Ordering::SeqCst);
        info!(publisher_id = %self.id, "republishing the backing store");

        loop {
            if !self.publication_enabled() {
                break;
            }
            let page = match self
                .repository
                .get_and_delete_messages(&self.id, self.settings.sweep_page_size)
                .await
            {
                Ok(page) => page,
                Err(store_error) => {
                    error!(%store_error, "sweep aborted, backing store unreadable");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            for message in page {
                self.transmit(message).await;
            }
        }

        self.retrying.store(false, Ordering::SeqCst);
        self.flush_buffer().await;
    }

    async fn on_timer_tick(&self) {
        let now = Instant::now();

        let retry_due = {
            let mut last = self.last_retry.lock().unwrap();
            if now.duration_since(*last) >= self.settings.publish_retry_interval {
                *last = now;
                true
            } else {
                false
            }
        };
        if retry_due {
            self.probe_stored().await;
        }

        let flush_due = {
            let mut last = self.last_flush.lock().unwrap();
            if now.duration_since(*last) >= self.settings.buffer_flush_interval {
                *last = now;
                true
            } else {
                false
            }
        };
        if flush_due {
            self.flush_buffer().await;
        }
    }
}

#[async_trait]
impl ConfirmSink for Publisher {
    async fn record_success(&self, message_ids: Vec<String>) {
        let confirmed = self.confirmer.take(&message_ids);
        debug!(count = confirmed.len(), "publishes confirmed");
        self.successive_failures.store(0, Ordering::SeqCst);

        if self
            .publication_enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(publisher_id = %self.id, "publication re-enabled");
            self.sweep().await;
        }
    }

    async fn record_failure(&self, message_ids: Vec<String>) {
        let failed = self.confirmer.take(&message_ids);
        // Failed messages are never lost: they re-enter the buffer and wait
        // for the flush/persist cycle.
        self.buffer.lock().unwrap().extend(failed);

        let count = u32::try_from(message_ids.len()).unwrap_or(u32::MAX);
        let failures = self
            .successive_failures
            .fetch_add(count, Ordering::SeqCst)
            .saturating_add(count);

        if failures >= self.settings.max_successive_failures
            && self.publication_enabled.swap(false, Ordering::SeqCst)
        {
            warn!(
                publisher_id = %self.id,
                failures,
                "successive failure threshold crossed, disabling publication"
            );
        }
    }
}

async fn run_timer(publisher: Arc<Publisher>, mut stop: watch::Receiver<()>) {
    let mut interval = tokio::time::interval(publisher.settings.timer_tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => publisher.on_timer_tick().await,
        }
    }
    debug!(publisher_id = %publisher.id, "publisher timer stopped");
}

/// A [`ConfirmSink`] that can be handed to the transport before the
/// publisher exists, breaking the construction cycle between the outbound
/// transport (which needs a sink) and the publisher (which needs the
/// transport as its endpoint).
#[derive(Debug, Default)]
pub struct ConfirmRelay {
    publisher: OnceLock<Arc<Publisher>>,
}

impl ConfirmRelay {
    /// Creates an unbound relay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the relay to its publisher. Later calls are ignored.
    pub fn bind(&self, publisher: Arc<Publisher>) {
        let _ = self.publisher.set(publisher);
    }
}

#[async_trait]
impl ConfirmSink for ConfirmRelay {
    async fn record_success(&self, message_ids: Vec<String>) {
        if let Some(publisher) = self.publisher.get() {
            publisher.record_success(message_ids).await;
        } else {
            warn!("confirm arrived before the publisher was bound");
        }
    }

    async fn record_failure(&self, message_ids: Vec<String>) {
        if let Some(publisher) = self.publisher.get() {
            publisher.record_failure(message_ids).await;
        } else {
            warn!("confirm failure arrived before the publisher was bound");
        }
    }
}
