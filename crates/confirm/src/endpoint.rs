use std::fmt::Debug;

use async_trait::async_trait;
use hive_bus::message::ConfirmableMessage;
use hive_transport::connection::Connection;
use hive_transport::factory::OutboundTransport;

use crate::Error;

/// Where the publisher sends messages. The confirm-tracked outbound
/// transport is the production implementation; tests substitute stubs.
#[async_trait]
pub trait PublishEndpoint
where
    Self: Debug + Send + Sync + 'static,
{
    /// Transmits one confirm-tracked message.
    async fn send(&self, message: &ConfirmableMessage) -> Result<(), Error>;
}

#[async_trait]
impl<C> PublishEndpoint for OutboundTransport<C>
where
    C: Connection,
{
    async fn send(&self, message: &ConfirmableMessage) -> Result<(), Error> {
        self.send_confirmable(message)
            .await
            .map_err(|error| Error::Endpoint(error.to_string()))
    }
}
