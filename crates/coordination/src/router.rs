use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::Error;
use crate::endpoint_subscription::LocalSubscription;
use crate::messages::SubscriptionMessage;
use crate::peer_cache::{PeerCache, SubscriptionChange};

const COMMAND_BUFFER: usize = 128;
const SHUTDOWN_BOUND: Duration = Duration::from_secs(30);

/// Receives the router's zero-crossing subscription notifications.
#[async_trait]
pub trait SubscriptionObserver
where
    Self: Send + Sync + 'static,
{
    /// The first peer became interested in a key.
    async fn on_subscription_added(&self, subscription: LocalSubscription);

    /// The last interested peer went away.
    async fn on_subscription_removed(&self, subscription: LocalSubscription);

    /// The router is shutting down; release everything.
    async fn on_complete(&self);
}

enum RouterCommand {
    Apply(SubscriptionMessage),
    AddObserver(Arc<dyn SubscriptionObserver>),
    Stop(oneshot::Sender<()>),
}

/// The per-process subscription router. One task owns the peer table
/// exclusively; every mutation arrives as a command on its channel, so
/// interleaved events from many remote peers can never race on an
/// aggregate.
#[derive(Clone, Debug)]
pub struct SubscriptionRouter {
    peer_id: Uuid,
    peer_uri: Url,
    network: String,
    commands: mpsc::Sender<RouterCommand>,
}

impl SubscriptionRouter {
    /// Starts a router for the named network, spawning its processing task.
    #[must_use]
    pub fn start(network: impl Into<String>, peer_uri: Url) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let peer_id = Uuid::new_v4();
        tokio::spawn(run(receiver));
        info!(%peer_id, "subscription router started");
        Self {
            peer_id,
            peer_uri,
            network: network.into(),
            commands,
        }
    }

    /// This instance's peer id.
    #[must_use]
    pub const fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// This instance's control address.
    #[must_use]
    pub const fn peer_uri(&self) -> &Url {
        &self.peer_uri
    }

    /// The network partition this router participates in.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Posts a protocol message into the router's serialized execution
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterStopped`] after shutdown.
    pub async fn send(&self, message: SubscriptionMessage) -> Result<(), Error> {
        self.commands
            .send(RouterCommand::Apply(message))
            .await
            .map_err(|_| Error::RouterStopped)
    }

    /// Registers an observer for subscription notifications.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterStopped`] after shutdown.
    pub async fn add_observer(
        &self,
        observer: Arc<dyn SubscriptionObserver>,
    ) -> Result<(), Error> {
        self.commands
            .send(RouterCommand::AddObserver(observer))
            .await
            .map_err(|_| Error::RouterStopped)
    }

    /// Stops the router: observers are told to complete, then the task
    /// drains and exits. The wait is bounded; on timeout the router is
    /// abandoned and an error returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterStopped`] when already stopped, or
    /// [`Error::ShutdownTimeout`] when the drain exceeds the bound.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (done, finished) = oneshot::channel();
        self.commands
            .send(RouterCommand::Stop(done))
            .await
            .map_err(|_| Error::RouterStopped)?;

        match tokio::time::timeout(SHUTDOWN_BOUND, finished).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::RouterStopped),
            Err(_) => {
                warn!("router did not drain within the shutdown bound");
                Err(Error::ShutdownTimeout)
            }
        }
    }
}

async fn run(mut commands: mpsc::Receiver<RouterCommand>) {
    let mut cache = PeerCache::default();
    let mut observers: Vec<Arc<dyn SubscriptionObserver>> = Vec::new();

    while let Some(command) = commands.recv().await {
        match command {
            RouterCommand::Apply(message) => {
                let changes = apply(&mut cache, message);
                for change in changes {
                    notify(&observers, change).await;
                }
            }
            RouterCommand::AddObserver(observer) => observers.push(observer),
            RouterCommand::Stop(done) => {
                for observer in &observers {
                    observer.on_complete().await;
                }
                let _ = done.send(());
                break;
            }
        }
    }
    debug!("subscription router stopped");
}

fn apply(cache: &mut PeerCache, message: SubscriptionMessage) -> Vec<SubscriptionChange> {
    match message {
        SubscriptionMessage::AddPeer {
            peer_id,
            peer_uri,
            timestamp_ms,
        } => cache.add_peer(peer_id, &peer_uri, timestamp_ms),
        SubscriptionMessage::RemovePeer { peer_id, .. } => cache.remove_peer(peer_id),
        SubscriptionMessage::AddPeerSubscription(subscription) => {
            cache.add_subscription(subscription).into_iter().collect()
        }
        SubscriptionMessage::RemovePeerSubscription(subscription) => cache
            .remove_subscription(subscription.subscription_id)
            .into_iter()
            .collect(),
    }
}

async fn notify(observers: &[Arc<dyn SubscriptionObserver>], change: SubscriptionChange) {
    for observer in observers {
        match &change {
            SubscriptionChange::Added(subscription) => {
                observer.on_subscription_added(subscription.clone()).await;
            }
            SubscriptionChange::Removed(subscription) => {
                observer.on_subscription_removed(subscription.clone()).await;
            }
        }
    }
}
