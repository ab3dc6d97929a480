use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use hive_bus::address::EndpointAddress;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, warn};

use crate::ConnectivityError;
use crate::connection::{Channel, Connection, Delivery};
use crate::handler::ConnectionBinding;

#[derive(Debug)]
struct ConsumerState<Ch> {
    channel: Option<Arc<Ch>>,
    stop_forward_task: Option<watch::Sender<()>>,
}

/// A connection-scoped consumer channel. On bind it declares the addressed
/// queue, starts consuming, and forwards deliveries into the sender handed
/// in at construction.
#[derive(Debug)]
pub struct ConsumerBinding<C>
where
    C: Connection,
{
    address: EndpointAddress,
    deliveries: mpsc::Sender<Delivery>,
    state: Mutex<ConsumerState<C::Channel>>,
}

impl<C> ConsumerBinding<C>
where
    C: Connection,
{
    /// Creates an unbound consumer binding that will forward deliveries from
    /// the addressed queue into `deliveries`.
    #[must_use]
    pub fn new(address: EndpointAddress, deliveries: mpsc::Sender<Delivery>) -> Self {
        Self {
            address,
            deliveries,
            state: Mutex::new(ConsumerState {
                channel: None,
                stop_forward_task: None,
            }),
        }
    }

    /// The address this binding consumes from.
    #[must_use]
    pub const fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Acknowledges a delivery on the bound channel.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::InvalidConnection`] when unbound, or the
    /// channel's ack failure.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), ConnectivityError> {
        let state = self.state.lock().await;
        let channel = state.channel.as_ref().ok_or_else(|| {
            ConnectivityError::invalid_connection(self.address.uri(), "consumer channel not bound")
        })?;
        channel.ack(delivery_tag).await
    }
}

#[async_trait]
impl<C> ConnectionBinding<C> for ConsumerBinding<C>
where
    C: Connection,
{
    async fn bind(&self, connection: &C) -> Result<(), ConnectivityError> {
        let mut state = self.state.lock().await;

        let channel = Arc::new(connection.open_channel().await.map_err(|error| {
            error!(%error, uri = %self.address.uri(), "failed to open consumer channel");
            ConnectivityError::invalid_connection(self.address.uri(), "invalid connection to host")
        })?);

        channel.declare_queue(&self.address).await?;
        let mut incoming = channel.consume(&self.address).await?;
        debug!(queue = self.address.name(), "consumer bound");

        let (stop_sender, mut stop_receiver) = watch::channel(());
        let forward = self.deliveries.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_receiver.changed() => break,
                    delivery = incoming.recv() => {
                        let Some(delivery) = delivery else { break };
                        if forward.send(delivery).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        state.channel = Some(channel);
        state.stop_forward_task = Some(stop_sender);
        Ok(())
    }

    async fn unbind(&self, _connection: &C) -> Result<(), ConnectivityError> {
        let mut state = self.state.lock().await;
        if let Some(stop) = state.stop_forward_task.take() {
            let _ = stop.send(());
        }
        if let Some(channel) = state.channel.take() {
            if let Err(error) = channel.close().await {
                warn!(%error, queue = self.address.name(), "closing consumer channel failed");
            }
        }
        Ok(())
    }
}
