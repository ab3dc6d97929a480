use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hive_bus::message::ConfirmableMessage;
use tracing::{debug, warn};

use crate::Error;

/// Durable storage for messages awaiting confirmation while publication is
/// disabled. Implementations return each stored message at most once, even
/// under concurrent readers.
#[async_trait]
pub trait UnconfirmedMessageRepository
where
    Self: Debug + Send + Sync + 'static,
{
    /// Persists a batch of messages for the publisher.
    async fn store_messages(
        &self,
        messages: Vec<ConfirmableMessage>,
        publisher_id: &str,
    ) -> Result<(), Error>;

    /// Atomically returns and removes up to `page_size` stored messages, in
    /// the store's natural order.
    async fn get_and_delete_messages(
        &self,
        publisher_id: &str,
        page_size: usize,
    ) -> Result<Vec<ConfirmableMessage>, Error>;
}

/// In-memory repository, keyed by publisher id. For tests and setups that
/// accept losing unconfirmed messages on process exit.
#[derive(Debug, Default)]
pub struct MemoryMessageRepository {
    queues: Mutex<HashMap<String, VecDeque<ConfirmableMessage>>>,
}

#[async_trait]
impl UnconfirmedMessageRepository for MemoryMessageRepository {
    async fn store_messages(
        &self,
        messages: Vec<ConfirmableMessage>,
        publisher_id: &str,
    ) -> Result<(), Error> {
        self.queues
            .lock()
            .unwrap()
            .entry(publisher_id.to_string())
            .or_default()
            .extend(messages);
        Ok(())
    }

    async fn get_and_delete_messages(
        &self,
        publisher_id: &str,
        page_size: usize,
    ) -> Result<Vec<ConfirmableMessage>, Error> {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(publisher_id) else {
            return Ok(Vec::new());
        };
        let take = page_size.min(queue.len());
        Ok(queue.drain(..take).collect())
    }
}

/// File-backed repository: one file per message under
/// `{root}/{publisher_id}/`, named `{message_name}_{sequence}.txt` with a
/// zero-padded strictly increasing sequence, so lexicographic filename
/// order is storage order and no two writes ever collide.
#[derive(Debug)]
pub struct FileMessageRepository {
    root: PathBuf,
    sequence: AtomicU64,
}

impl FileMessageRepository {
    /// Creates a repository rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        // Seeding from the clock keeps sequences increasing across process
        // restarts; the atomic increment keeps them unique within one.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        Self {
            root: root.into(),
            sequence: AtomicU64::new(seed),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn publisher_dir(&self, publisher_id: &str) -> PathBuf {
        self.root.join(publisher_id)
    }
}

#[async_trait]
impl UnconfirmedMessageRepository for FileMessageRepository {
    async fn store_messages(
        &self,
        messages: Vec<ConfirmableMessage>,
        publisher_id: &str,
    ) -> Result<(), Error> {
        if messages.is_empty() {
            return Ok(());
        }

        let dir = self.publisher_dir(publisher_id);
        tokio::fs::create_dir_all(&dir).await?;

        for message in messages {
            let file_name = format!("{}_{:020}.txt", message.message_name, self.next_sequence());
            let content = serde_json::to_vec(&message)?;
            tokio::fs::write(dir.join(&file_name), content).await?;
            debug!(publisher_id, file_name, "stored unconfirmed message");
        }
        Ok(())
    }

    async fn get_and_delete_messages(
        &self,
        publisher_id: &str,
        page_size: usize,
    ) -> Result<Vec<ConfirmableMessage>, Error> {
        let dir = self.publisher_dir(publisher_id);
        let mut paths = match list_message_files(&dir).await {
            Ok(paths) => paths,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        paths.sort();

        let mut messages = Vec::new();
        for path in paths {
            if messages.len() == page_size {
                break;
            }

            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                // A concurrent reader already claimed this file.
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };

            match serde_json::from_slice::<ConfirmableMessage>(&content) {
                Ok(message) => messages.push(message),
                Err(error) => {
                    // Left in place for operator inspection.
                    warn!(%error, path = %path.display(), "skipping undeserializable stored message");
                    continue;
                }
            }

            if let Err(error) = tokio::fs::remove_file(&path).await {
                if error.kind() != ErrorKind::NotFound {
                    return Err(error.into());
                }
            }
        }
        Ok(messages)
    }
}

async fn list_message_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "txt") {
            paths.push(path);
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    fn message(name: &str, body: &'static [u8]) -> ConfirmableMessage {
        ConfirmableMessage::new(name, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn memory_repository_pages_in_order() {
        let repository = MemoryMessageRepository::default();
        let messages = vec![message("A", b"1"), message("A", b"2"), message("A", b"3")];
        repository
            .store_messages(messages.clone(), "pub-1")
            .await
            .unwrap();

        let first = repository.get_and_delete_messages("pub-1", 2).await.unwrap();
        assert_eq!(first, messages[..2]);

        let rest = repository.get_and_delete_messages("pub-1", 2).await.unwrap();
        assert_eq!(rest, messages[2..]);

        assert!(repository
            .get_and_delete_messages("pub-1", 2)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn file_repository_round_trips_and_empties() {
        let dir = tempfile::tempdir().unwrap();
        let repository = FileMessageRepository::new(dir.path());

        let stored = vec![message("OrderPlaced", b"{\"n\":1}"), message("OrderPlaced", b"{\"n\":2}")];
        repository
            .store_messages(stored.clone(), "pub-1")
            .await
            .unwrap();

        let read = repository
            .get_and_delete_messages("pub-1", 10)
            .await
            .unwrap();
        assert_eq!(read, stored);

        assert!(repository
            .get_and_delete_messages("pub-1", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn file_repository_respects_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let repository = FileMessageRepository::new(dir.path());

        let stored: Vec<_> = (0..5).map(|_| message("A", b"{}")).collect();
        repository
            .store_messages(stored.clone(), "pub-1")
            .await
            .unwrap();

        let page = repository.get_and_delete_messages("pub-1", 3).await.unwrap();
        assert_eq!(page, stored[..3]);

        let rest = repository.get_and_delete_messages("pub-1", 10).await.unwrap();
        assert_eq!(rest, stored[3..]);
    }

    #[tokio::test]
    async fn publishers_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let repository = FileMessageRepository::new(dir.path());

        repository
            .store_messages(vec![message("A", b"{}")], "pub-1")
            .await
            .unwrap();

        assert!(repository
            .get_and_delete_messages("pub-2", 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            repository
                .get_and_delete_messages("pub-1", 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn undeserializable_files_are_skipped_and_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let repository = FileMessageRepository::new(dir.path());
        repository
            .store_messages(vec![message("A", b"{}")], "pub-1")
            .await
            .unwrap();

        let junk = dir.path().join("pub-1").join("A_00000000000000000000.txt");
        tokio::fs::write(&junk, b"not json").await.unwrap();

        let read = repository
            .get_and_delete_messages("pub-1", 10)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert!(tokio::fs::try_exists(&junk).await.unwrap());
    }
}
