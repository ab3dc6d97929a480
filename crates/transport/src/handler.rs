use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ConnectivityError;
use crate::connection::Connection;

/// A channel-level resource that must be (re)bound whenever its connection
/// is (re)established and unbound when it goes away.
#[async_trait]
pub trait ConnectionBinding<C>
where
    Self: Debug + Send + Sync + 'static,
    C: Connection,
{
    /// Binds against a live connection.
    async fn bind(&self, connection: &C) -> Result<(), ConnectivityError>;

    /// Releases resources held against the connection.
    async fn unbind(&self, connection: &C) -> Result<(), ConnectivityError>;
}

/// The connection policy applied around every transport action.
#[derive(Clone, Copy, Debug)]
enum ConnectionPolicy {
    /// Connect synchronously on the first use, then pass through.
    ConnectOnFirstUse,
    /// Pass actions straight through.
    Connected,
    /// Defer actions until the reconnect delay elapses, then reconnect.
    Reconnect { not_before: Instant },
    /// Terminal; every action fails.
    Disposed,
}

#[derive(Debug)]
struct HandlerState<C>
where
    C: Connection,
{
    policy: ConnectionPolicy,
    connected: bool,
    bound: bool,
    bindings: Vec<Arc<dyn ConnectionBinding<C>>>,
}

/// Owns a single transport connection, applying the current connection
/// policy around every action and keeping the binding set bound in lockstep
/// with the connection state.
///
/// All state transitions are serialized under one lock; the lock is never
/// held while a caller's action runs.
#[derive(Debug)]
pub struct ConnectionHandler<C>
where
    C: Connection,
{
    connection: Arc<C>,
    state: Mutex<HandlerState<C>>,
}

impl<C> ConnectionHandler<C>
where
    C: Connection,
{
    /// Wraps an unconnected transport connection.
    #[must_use]
    pub fn new(connection: C) -> Self {
        Self {
            connection: Arc::new(connection),
            state: Mutex::new(HandlerState {
                policy: ConnectionPolicy::ConnectOnFirstUse,
                connected: false,
                bound: false,
                bindings: Vec::new(),
            }),
        }
    }

    /// Establishes the connection and binds any deferred bindings.
    ///
    /// # Errors
    ///
    /// Returns the underlying connect or bind failure, or
    /// [`ConnectivityError::Disposed`] after disposal.
    pub async fn connect(&self) -> Result<(), ConnectivityError> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state).await
    }

    /// Disconnects, unbinding all bindings first (best effort).
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        self.unbind_locked(&mut state).await;
        if let Err(error) = self.connection.disconnect().await {
            warn!(%error, "disconnect failed, but ignoring");
        }
    }

    /// Pushes a reconnect policy: subsequent actions wait out the delay,
    /// rebuild the connection, and rebind before running.
    pub async fn force_reconnect(&self, delay: Duration) {
        let mut state = self.state.lock().await;
        if matches!(state.policy, ConnectionPolicy::Disposed) {
            return;
        }
        debug!(delay_ms = delay.as_millis(), "forcing reconnect");
        state.connected = false;
        state.policy = ConnectionPolicy::Reconnect {
            not_before: Instant::now() + delay,
        };
    }

    /// Executes `action` under the current connection policy. The state lock
    /// is released before the action runs, so long-running sends do not
    /// block concurrent binding changes.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::InvalidConnection`] when the connection
    /// is not established after policy application, the policy's own
    /// connect/bind failure, or the action's error.
    pub async fn with_connection<F, Fut, R>(&self, action: F) -> Result<R, ConnectivityError>
    where
        F: FnOnce(Arc<C>) -> Fut + Send,
        Fut: Future<Output = Result<R, ConnectivityError>> + Send,
        R: Send,
    {
        let mut state = self.state.lock().await;

        if let ConnectionPolicy::Reconnect { not_before } = state.policy {
            drop(state);
            tokio::time::sleep_until(not_before).await;
            state = self.state.lock().await;

            // Another caller may have already completed the reconnect.
            if matches!(state.policy, ConnectionPolicy::Reconnect { .. }) {
                state.connected = false;
                self.unbind_locked(&mut state).await;
                if let Err(error) = self.connection.disconnect().await {
                    debug!(%error, "disconnect before reconnect failed");
                }
            }
        }

        match state.policy {
            ConnectionPolicy::Disposed => return Err(ConnectivityError::Disposed),
            ConnectionPolicy::ConnectOnFirstUse | ConnectionPolicy::Reconnect { .. } => {
                self.connect_locked(&mut state).await?;
                state.policy = ConnectionPolicy::Connected;
            }
            ConnectionPolicy::Connected => {}
        }

        if !state.connected {
            return Err(ConnectivityError::InvalidConnection {
                uri: String::new(),
                reason: "action invoked while not connected".to_string(),
            });
        }
        drop(state);

        action(Arc::clone(&self.connection)).await
    }

    /// Adds a binding. Bound immediately when connected, deferred until the
    /// next successful connect otherwise.
    ///
    /// # Errors
    ///
    /// Returns the binding's own bind failure when binding immediately.
    pub async fn add_binding(
        &self,
        binding: Arc<dyn ConnectionBinding<C>>,
    ) -> Result<(), ConnectivityError> {
        let mut state = self.state.lock().await;
        if state.bound {
            binding.bind(&self.connection).await?;
        }
        state.bindings.push(binding);
        Ok(())
    }

    /// Removes a binding, unbinding it first (best effort) when bound.
    pub async fn remove_binding(&self, binding: &Arc<dyn ConnectionBinding<C>>) {
        let mut state = self.state.lock().await;
        if state.bound {
            if let Err(error) = binding.unbind(&self.connection).await {
                warn!(%error, "failed to unbind");
            }
        }
        state.bindings.retain(|b| !Arc::ptr_eq(b, binding));
    }

    /// Unbinds everything, disconnects, and makes every future action fail.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if matches!(state.policy, ConnectionPolicy::Disposed) {
            return;
        }
        state.connected = false;
        self.unbind_locked(&mut state).await;
        if let Err(error) = self.connection.disconnect().await {
            warn!(%error, "disconnect during dispose failed, but ignoring");
        }
        state.policy = ConnectionPolicy::Disposed;
    }

    async fn connect_locked(
        &self,
        state: &mut HandlerState<C>,
    ) -> Result<(), ConnectivityError> {
        if matches!(state.policy, ConnectionPolicy::Disposed) {
            return Err(ConnectivityError::Disposed);
        }
        if !state.connected {
            self.connection.connect().await?;
            state.connected = true;
        }
        if !state.bound {
            for binding in &state.bindings {
                binding.bind(&self.connection).await?;
            }
            state.bound = true;
        }
        Ok(())
    }

    async fn unbind_locked(&self, state: &mut HandlerState<C>) {
        for binding in &state.bindings {
            if let Err(error) = binding.unbind(&self.connection).await {
                warn!(%error, "an error occurred while a binding was being unbound");
            }
        }
        state.bound = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use bytes::Bytes;
    use hive_bus::address::EndpointAddress;
    use tokio::sync::{broadcast, mpsc};

    use crate::connection::{Channel, ConfirmEvent, MessageProperties};

    #[derive(Debug, Default)]
    struct StubConnection {
        connects: AtomicU32,
        disconnects: AtomicU32,
        fail_connect: AtomicBool,
    }

    #[derive(Debug)]
    struct StubChannel;

    #[async_trait]
    impl Channel for StubChannel {
        async fn enable_confirms(&self) -> Result<(), ConnectivityError> {
            Ok(())
        }

        fn next_publish_sequence(&self) -> u64 {
            1
        }

        async fn publish(
            &self,
            _destination: &str,
            _properties: MessageProperties,
            _body: Bytes,
        ) -> Result<(), ConnectivityError> {
            Ok(())
        }

        fn confirm_events(&self) -> broadcast::Receiver<ConfirmEvent> {
            broadcast::channel(1).1
        }

        async fn declare_queue(
            &self,
            _address: &EndpointAddress,
        ) -> Result<(), ConnectivityError> {
            Ok(())
        }

        async fn consume(
            &self,
            _address: &EndpointAddress,
        ) -> Result<mpsc::Receiver<crate::connection::Delivery>, ConnectivityError> {
            Ok(mpsc::channel(1).1)
        }

        async fn ack(&self, _delivery_tag: u64) -> Result<(), ConnectivityError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ConnectivityError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connection for StubConnection {
        type Channel = StubChannel;

        async fn connect(&self) -> Result<(), ConnectivityError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ConnectivityError::Unreachable("stub".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ConnectivityError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn open_channel(&self) -> Result<StubChannel, ConnectivityError> {
            Ok(StubChannel)
        }
    }

    #[derive(Debug, Default)]
    struct RecordingBinding {
        events: StdMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ConnectionBinding<StubConnection> for RecordingBinding {
        async fn bind(&self, _connection: &StubConnection) -> Result<(), ConnectivityError> {
            self.events.lock().unwrap().push("bind");
            Ok(())
        }

        async fn unbind(&self, _connection: &StubConnection) -> Result<(), ConnectivityError> {
            self.events.lock().unwrap().push("unbind");
            Ok(())
        }
    }

    #[tokio::test]
    async fn connects_on_first_use_only() {
        let handler = ConnectionHandler::new(StubConnection::default());

        handler
            .with_connection(|_| async { Ok(()) })
            .await
            .unwrap();
        handler
            .with_connection(|_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(handler.connection.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn binding_added_while_disconnected_is_deferred() {
        let handler = ConnectionHandler::new(StubConnection::default());
        let binding = Arc::new(RecordingBinding::default());

        handler.add_binding(binding.clone()).await.unwrap();
        assert!(binding.events.lock().unwrap().is_empty());

        handler
            .with_connection(|_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(*binding.events.lock().unwrap(), vec!["bind"]);
    }

    #[tokio::test]
    async fn binding_added_while_connected_binds_immediately() {
        let handler = ConnectionHandler::new(StubConnection::default());
        handler.connect().await.unwrap();

        let binding = Arc::new(RecordingBinding::default());
        handler.add_binding(binding.clone()).await.unwrap();

        assert_eq!(*binding.events.lock().unwrap(), vec!["bind"]);
    }

    #[tokio::test]
    async fn force_reconnect_rebinds_bindings() {
        let handler = ConnectionHandler::new(StubConnection::default());
        let binding = Arc::new(RecordingBinding::default());
        handler.add_binding(binding.clone()).await.unwrap();

        handler
            .with_connection(|_| async { Ok(()) })
            .await
            .unwrap();

        handler.force_reconnect(Duration::from_millis(10)).await;
        handler
            .with_connection(|_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(
            *binding.events.lock().unwrap(),
            vec!["bind", "unbind", "bind"]
        );
        assert_eq!(handler.connection.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnect_unbinds_before_closing() {
        let handler = ConnectionHandler::new(StubConnection::default());
        let binding = Arc::new(RecordingBinding::default());
        handler.add_binding(binding.clone()).await.unwrap();
        handler.connect().await.unwrap();

        handler.disconnect().await;

        assert_eq!(*binding.events.lock().unwrap(), vec!["bind", "unbind"]);
        assert_eq!(handler.connection.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disposed_handler_rejects_actions() {
        let handler = ConnectionHandler::new(StubConnection::default());
        handler.dispose().await;

        let result = handler.with_connection(|_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ConnectivityError::Disposed)));
    }

    #[tokio::test]
    async fn connect_failure_surfaces() {
        let connection = StubConnection::default();
        connection.fail_connect.store(true, Ordering::SeqCst);
        let handler = ConnectionHandler::new(connection);

        let result = handler.with_connection(|_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ConnectivityError::Unreachable(_))));
    }

    #[tokio::test]
    async fn remove_binding_unbinds_when_bound() {
        let handler = ConnectionHandler::new(StubConnection::default());
        let binding = Arc::new(RecordingBinding::default());
        let as_binding: Arc<dyn ConnectionBinding<StubConnection>> = binding.clone();
        handler.add_binding(as_binding.clone()).await.unwrap();
        handler.connect().await.unwrap();

        handler.remove_binding(&as_binding).await;

        assert_eq!(*binding.events.lock().unwrap(), vec!["bind", "unbind"]);
        assert!(handler.state.lock().await.bindings.is_empty());
    }
}
