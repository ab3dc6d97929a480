use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hive_bus::dispatcher::{Dispatcher, SubscriptionDescriptor, UnsubscribeHandle};
use tracing::{debug, error};
use uuid::Uuid;

use crate::endpoint_subscription::LocalSubscription;
use crate::router::SubscriptionObserver;

/// Drives the local dispatcher from the router's zero-crossing
/// notifications: a net-new subscription connects a consumer, the last
/// removal tears it down, and router completion releases everything.
#[derive(Debug)]
pub struct DispatcherConnector<D>
where
    D: Dispatcher,
{
    dispatcher: Arc<D>,
    handles: Mutex<HashMap<Uuid, UnsubscribeHandle>>,
}

impl<D> DispatcherConnector<D>
where
    D: Dispatcher,
{
    /// Wraps the dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<D>) -> Self {
        Self {
            dispatcher,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live dispatcher-side subscriptions.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

#[async_trait]
impl<D> SubscriptionObserver for DispatcherConnector<D>
where
    D: Dispatcher,
{
    async fn on_subscription_added(&self, subscription: LocalSubscription) {
        let descriptor = SubscriptionDescriptor {
            message_name: subscription.message_name.clone(),
            correlation_id: subscription.correlation_id.clone(),
            endpoint_uri: subscription.endpoint_uri.clone(),
        };

        match self.dispatcher.connect_consumer(descriptor).await {
            Ok(handle) => {
                debug!(
                    message_name = subscription.message_name,
                    "connected dispatcher consumer"
                );
                self.handles
                    .lock()
                    .unwrap()
                    .insert(subscription.subscription_id, handle);
            }
            Err(dispatch_error) => {
                error!(
                    %dispatch_error,
                    message_name = subscription.message_name,
                    "failed to connect dispatcher consumer"
                );
            }
        }
    }

    async fn on_subscription_removed(&self, subscription: LocalSubscription) {
        let handle = self
            .handles
            .lock()
            .unwrap()
            .remove(&subscription.subscription_id);
        if let Some(handle) = handle {
            debug!(
                message_name = subscription.message_name,
                "disconnecting dispatcher consumer"
            );
            handle.unsubscribe();
        }
    }

    async fn on_complete(&self) {
        let handles: Vec<UnsubscribeHandle> =
            self.handles.lock().unwrap().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.unsubscribe();
        }
    }
}
