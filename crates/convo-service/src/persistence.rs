//! The storage sequence: a task that runs gateway calls one at a time, in
//! submission order, and hands results back through completion callbacks.

use convo_core::{ConversationArchive, ConversationMetadata, PersistenceGateway, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::store::LoadTicket;

type Job = BoxFuture<'static, ()>;

pub struct StorageSequence {
    gateway: Option<Arc<dyn PersistenceGateway>>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl StorageSequence {
    /// `None` runs without storage: reads come back empty and writes are dropped.
    pub fn new(gateway: Option<Arc<dyn PersistenceGateway>>) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job.await;
            }
            debug!("Storage sequence drained");
        });
        Self { gateway, jobs }
    }

    pub fn is_enabled(&self) -> bool {
        self.gateway.is_some()
    }

    fn enqueue(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("Storage sequence has stopped, dropping job");
        }
    }

    /// Bulk metadata read. Skipped entirely if the ticket is cancelled before it runs.
    pub fn load_all_metadata<D>(&self, ticket: LoadTicket, done: D)
    where
        D: FnOnce(std::result::Result<Vec<ConversationMetadata>, String>) + Send + 'static,
    {
        let gateway = self.gateway.clone();
        self.enqueue(Box::pin(async move {
            if ticket.is_cancelled() {
                debug!("Skipping cancelled metadata load #{}", ticket.id());
                return;
            }
            let result = match gateway {
                Some(gateway) => gateway.load_all_metadata().await.map_err(|e| e.to_string()),
                None => Ok(Vec::new()),
            };
            done(result);
        }));
    }

    pub fn load_archive<D>(&self, uuid: String, done: D)
    where
        D: FnOnce(std::result::Result<Option<ConversationArchive>, String>) + Send + 'static,
    {
        let gateway = self.gateway.clone();
        self.enqueue(Box::pin(async move {
            let result = match gateway {
                Some(gateway) => gateway.load_archive(&uuid).await.map_err(|e| e.to_string()),
                None => Ok(None),
            };
            done(result);
        }));
    }

    /// Resolves once every job submitted before the call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::pin(async move {
            let _ = tx.send(());
        }));
        let _ = rx.await;
    }

    /// Fire-and-forget write. Failures are logged.
    pub fn write<F, Fut>(&self, label: &'static str, op: F)
    where
        F: FnOnce(Arc<dyn PersistenceGateway>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.write_then(label, op, |_| {});
    }

    /// Write whose result is reported to `done`. Without storage it succeeds immediately.
    pub fn write_then<F, Fut, D>(&self, label: &'static str, op: F, done: D)
    where
        F: FnOnce(Arc<dyn PersistenceGateway>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        D: FnOnce(Result<()>) + Send + 'static,
    {
        let Some(gateway) = self.gateway.clone() else {
            done(Ok(()));
            return;
        };
        self.enqueue(Box::pin(async move {
            let result = op(gateway).await;
            if let Err(e) = &result {
                warn!("Storage {} failed: {}", label, e);
            }
            done(result);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_core::ConversationTurn;
    use convo_storage::MemoryGateway;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_submission_order() {
        let gateway = Arc::new(MemoryGateway::new().with_latency(Duration::from_millis(10)));
        let sequence = StorageSequence::new(Some(gateway.clone() as Arc<dyn PersistenceGateway>));

        let meta = ConversationMetadata::new(None).with_title("queued");
        let uuid = meta.uuid.clone();
        sequence.write("save_metadata", move |g| async move { g.save_metadata(&meta).await });
        let entry_uuid = uuid.clone();
        sequence.write("append_entry", move |g| async move {
            g.append_entry(&entry_uuid, &ConversationTurn::human("hi")).await
        });

        let (tx, rx) = oneshot::channel();
        let ticket = LoadTicket::new(1);
        sequence.load_all_metadata(ticket, move |result| {
            let _ = tx.send(result);
        });

        let loaded = rx.await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title, "queued");
        assert_eq!(gateway.stored_entries(&uuid).len(), 1);
    }

    #[tokio::test]
    async fn cancelled_load_never_reaches_storage() {
        let gateway = Arc::new(MemoryGateway::new());
        let sequence = StorageSequence::new(Some(gateway.clone() as Arc<dyn PersistenceGateway>));

        let ticket = LoadTicket::new(1);
        ticket.cancel();
        sequence.load_all_metadata(ticket, |_| panic!("cancelled load completed"));

        let (tx, rx) = oneshot::channel();
        sequence.write_then("flush", |_| async { Ok(()) }, move |r| {
            let _ = tx.send(r.is_ok());
        });
        assert!(rx.await.unwrap());
        assert_eq!(gateway.metadata_load_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_queued_writes() {
        let gateway = Arc::new(MemoryGateway::new().with_latency(Duration::from_millis(25)));
        let sequence = StorageSequence::new(Some(gateway.clone() as Arc<dyn PersistenceGateway>));
        for title in ["one", "two"] {
            let meta = ConversationMetadata::new(None).with_title(title);
            sequence.write("save_metadata", move |g| async move { g.save_metadata(&meta).await });
        }

        sequence.flush().await;
        assert_eq!(gateway.len(), 2);
    }

    #[tokio::test]
    async fn disabled_storage_reads_empty() {
        let sequence = StorageSequence::new(None);
        assert!(!sequence.is_enabled());

        let (tx, rx) = oneshot::channel();
        sequence.load_archive("A".into(), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Ok(None));
    }
}
