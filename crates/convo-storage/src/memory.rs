use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convo_core::{
    in_range, ConversationArchive, ConversationMetadata, ConversationTurn, ConvoError,
    PersistenceGateway, Result,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Records {
    metadata: BTreeMap<String, ConversationMetadata>,
    entries: HashMap<String, Vec<ConversationTurn>>,
}

/// Volatile gateway for tests and storage-less runs.
///
/// Every call waits `latency` first, which lets tests hold a load in flight.
#[derive(Default)]
pub struct MemoryGateway {
    records: Mutex<Records>,
    latency: Mutex<Duration>,
    fail_loads: AtomicBool,
    metadata_loads: AtomicUsize,
    archive_loads: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Seed a persisted conversation.
    pub fn insert(&self, mut metadata: ConversationMetadata, entries: Vec<ConversationTurn>) {
        metadata.has_content = true;
        let mut records = self.records.lock();
        records.entries.insert(metadata.uuid.clone(), entries);
        records.metadata.insert(metadata.uuid.clone(), metadata);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes every subsequent read fail as if storage were unreachable.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn metadata_load_count(&self) -> usize {
        self.metadata_loads.load(Ordering::SeqCst)
    }

    pub fn archive_load_count(&self) -> usize {
        self.archive_loads.load(Ordering::SeqCst)
    }

    pub fn stored_metadata(&self, uuid: &str) -> Option<ConversationMetadata> {
        self.records.lock().metadata.get(uuid).cloned()
    }

    pub fn stored_entries(&self, uuid: &str) -> Vec<ConversationTurn> {
        self.records.lock().entries.get(uuid).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn pause(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_readable(&self) -> Result<()> {
        if self.fail_loads.load(Ordering::SeqCst) {
            Err(ConvoError::Storage("storage unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load_all_metadata(&self) -> Result<Vec<ConversationMetadata>> {
        self.metadata_loads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_readable()?;
        Ok(self.records.lock().metadata.values().cloned().collect())
    }

    async fn load_archive(&self, uuid: &str) -> Result<Option<ConversationArchive>> {
        self.archive_loads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_readable()?;
        let records = self.records.lock();
        Ok(records.metadata.contains_key(uuid).then(|| ConversationArchive {
            entries: records.entries.get(uuid).cloned().unwrap_or_default(),
        }))
    }

    async fn save_metadata(&self, metadata: &ConversationMetadata) -> Result<()> {
        self.pause().await;
        self.records
            .lock()
            .metadata
            .insert(metadata.uuid.clone(), metadata.clone());
        Ok(())
    }

    async fn append_entry(&self, uuid: &str, entry: &ConversationTurn) -> Result<()> {
        self.pause().await;
        self.records
            .lock()
            .entries
            .entry(uuid.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn delete_entry(&self, uuid: &str, entry_uuid: &str) -> Result<()> {
        self.pause().await;
        if let Some(entries) = self.records.lock().entries.get_mut(uuid) {
            entries.retain(|e| e.uuid != entry_uuid);
        }
        Ok(())
    }

    async fn delete_conversation(&self, uuid: &str) -> Result<()> {
        self.pause().await;
        let mut records = self.records.lock();
        records.metadata.remove(uuid);
        records.entries.remove(uuid);
        Ok(())
    }

    async fn delete_range(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.pause().await;
        let mut records = self.records.lock();
        let doomed: Vec<String> = records
            .metadata
            .values()
            .filter(|meta| meta.updated_within(begin, end))
            .map(|meta| meta.uuid.clone())
            .collect();
        for uuid in doomed {
            records.metadata.remove(&uuid);
            records.entries.remove(&uuid);
        }
        Ok(())
    }

    async fn delete_associated_content(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.pause().await;
        for entry in self.records.lock().entries.values_mut().flatten() {
            if in_range(entry.created_at, begin, end) {
                entry.page_context = None;
            }
        }
        Ok(())
    }
}
