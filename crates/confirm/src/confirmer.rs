use std::collections::HashMap;
use std::sync::Mutex;

use hive_bus::message::ConfirmableMessage;
use tracing::warn;

/// The pending-confirmation table: every in-flight publish, keyed by its
/// client message id, held until the broker resolves it one way or the
/// other.
#[derive(Debug, Default)]
pub struct Confirmer {
    pending: Mutex<HashMap<String, ConfirmableMessage>>,
}

impl Confirmer {
    /// Records a message as in-flight. Must happen before the transmit so a
    /// fast confirm always finds the entry.
    pub fn record(&self, message: ConfirmableMessage) {
        self.pending
            .lock()
            .unwrap()
            .insert(message.id.clone(), message);
    }

    /// Removes and returns the messages behind the given ids. Unknown ids
    /// are logged and skipped; a confirm for an id we never recorded means
    /// the entry was already resolved.
    pub fn take(&self, message_ids: &[String]) -> Vec<ConfirmableMessage> {
        let mut pending = self.pending.lock().unwrap();
        message_ids
            .iter()
            .filter_map(|id| {
                let message = pending.remove(id);
                if message.is_none() {
                    warn!(message_id = %id, "confirm for unknown message id");
                }
                message
            })
            .collect()
    }

    /// Number of in-flight messages.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    #[test]
    fn take_returns_recorded_messages_once() {
        let confirmer = Confirmer::default();
        let message = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
        let id = message.id.clone();
        confirmer.record(message.clone());

        let taken = confirmer.take(std::slice::from_ref(&id));
        assert_eq!(taken, vec![message]);
        assert_eq!(confirmer.pending_count(), 0);

        // A second resolution of the same id yields nothing.
        assert!(confirmer.take(&[id]).is_empty());
    }

    #[test]
    fn unknown_ids_are_skipped() {
        let confirmer = Confirmer::default();
        let known = ConfirmableMessage::new("A", Bytes::new());
        confirmer.record(known.clone());

        let taken = confirmer.take(&["missing".to_string(), known.id.clone()]);
        assert_eq!(taken, vec![known]);
    }
}
