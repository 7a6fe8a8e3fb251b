//! Lazily hydrated map of conversation metadata.
//!
//! The whole metadata set is loaded from storage in one request the first time
//! anyone asks for it. Requests that arrive while that load is outstanding are
//! queued on the same [`PendingLoad`] and resolved together, in arrival order.

use convo_core::ConversationMetadata;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata record shared between the store and a live handler.
pub type SharedMetadata = Arc<RwLock<ConversationMetadata>>;

/// How a bulk load ended, as seen by queued callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed(String),
    Cancelled,
}

/// Identity and cancellation token of one bulk load.
#[derive(Debug, Clone)]
pub struct LoadTicket {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl LoadTicket {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct PendingLoad<C> {
    ticket: LoadTicket,
    callbacks: Vec<C>,
}

enum Hydration<C> {
    Unloaded,
    Loading(PendingLoad<C>),
    Loaded,
    Failed(String),
}

/// What the caller of [`ConversationStore::request`] has to do next.
pub enum LoadRequest<C> {
    /// Nothing outstanding, run the callback now.
    Ready(C, LoadOutcome),
    /// Joined the load already in flight.
    Queued,
    /// First request: issue the storage read for this ticket.
    Start(LoadTicket),
}

pub struct ConversationStore<C> {
    conversations: BTreeMap<String, SharedMetadata>,
    hydration: Hydration<C>,
    next_ticket: u64,
}

impl<C> Default for ConversationStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ConversationStore<C> {
    pub fn new() -> Self {
        Self {
            conversations: BTreeMap::new(),
            hydration: Hydration::Unloaded,
            next_ticket: 0,
        }
    }

    fn issue_ticket(&mut self) -> LoadTicket {
        self.next_ticket += 1;
        LoadTicket::new(self.next_ticket)
    }

    /// Ask for the hydrated map. Never starts a second load while one is outstanding.
    pub fn request(&mut self, callback: C) -> LoadRequest<C> {
        match &mut self.hydration {
            Hydration::Loaded => return LoadRequest::Ready(callback, LoadOutcome::Loaded),
            Hydration::Failed(reason) => {
                return LoadRequest::Ready(callback, LoadOutcome::Failed(reason.clone()));
            }
            Hydration::Loading(pending) => {
                pending.callbacks.push(callback);
                debug!(
                    "Queued on in-flight metadata load #{} ({} waiting)",
                    pending.ticket.id,
                    pending.callbacks.len()
                );
                return LoadRequest::Queued;
            }
            Hydration::Unloaded => {}
        }

        let ticket = self.issue_ticket();
        info!("Starting metadata load #{}", ticket.id);
        self.hydration = Hydration::Loading(PendingLoad {
            ticket: ticket.clone(),
            callbacks: vec![callback],
        });
        LoadRequest::Start(ticket)
    }

    /// Apply the result of a storage read.
    ///
    /// Returns the queued callbacks in arrival order, or `None` if the ticket is
    /// no longer the current load (it was cancelled or superseded).
    pub fn complete(
        &mut self,
        ticket_id: u64,
        result: std::result::Result<Vec<ConversationMetadata>, String>,
    ) -> Option<(Vec<C>, LoadOutcome)> {
        let current = matches!(&self.hydration, Hydration::Loading(p) if p.ticket.id == ticket_id);
        if !current {
            debug!("Ignoring result of superseded metadata load #{}", ticket_id);
            return None;
        }

        let (outcome, next) = match result {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    // In-memory entries are newer than anything storage returned
                    self.conversations
                        .entry(record.uuid.clone())
                        .or_insert_with(|| Arc::new(RwLock::new(record)));
                }
                info!("Metadata load #{} finished with {} conversations", ticket_id, count);
                (LoadOutcome::Loaded, Hydration::Loaded)
            }
            Err(reason) => {
                warn!("Metadata load #{} failed: {}", ticket_id, reason);
                (LoadOutcome::Failed(reason.clone()), Hydration::Failed(reason))
            }
        };

        match std::mem::replace(&mut self.hydration, next) {
            Hydration::Loading(pending) => Some((pending.callbacks, outcome)),
            _ => None,
        }
    }

    /// Drop hydration and start over.
    ///
    /// An in-flight load is cancelled and its callers are handed back so they
    /// can be resolved with [`LoadOutcome::Cancelled`]. Records for which `keep`
    /// is false are evicted and will be re-read from storage.
    pub fn reload(&mut self, keep: impl Fn(&ConversationMetadata) -> bool) -> (Vec<C>, LoadTicket) {
        let cancelled = match std::mem::replace(&mut self.hydration, Hydration::Unloaded) {
            Hydration::Loading(pending) => {
                pending.ticket.cancel();
                info!(
                    "Cancelled metadata load #{} with {} waiting",
                    pending.ticket.id,
                    pending.callbacks.len()
                );
                pending.callbacks
            }
            _ => Vec::new(),
        };

        self.conversations.retain(|_, meta| keep(&meta.read()));

        let ticket = self.issue_ticket();
        info!("Reloading conversation metadata as load #{}", ticket.id);
        self.hydration = Hydration::Loading(PendingLoad {
            ticket: ticket.clone(),
            callbacks: Vec::new(),
        });
        (cancelled, ticket)
    }

    /// Re-issue an in-flight load under a fresh ticket, keeping its callers.
    pub fn restart(&mut self) -> Option<LoadTicket> {
        if !self.is_loading() {
            return None;
        }
        let fresh = self.issue_ticket();
        if let Hydration::Loading(pending) = &mut self.hydration {
            pending.ticket.cancel();
            debug!("Restarting metadata load #{} as #{}", pending.ticket.id, fresh.id);
            pending.ticket = fresh.clone();
        }
        Some(fresh)
    }

    /// Cancel any load and drop its callbacks without running them.
    pub fn shutdown(&mut self) -> usize {
        match std::mem::replace(&mut self.hydration, Hydration::Unloaded) {
            Hydration::Loading(pending) => {
                pending.ticket.cancel();
                pending.callbacks.len()
            }
            _ => 0,
        }
    }

    #[cfg(test)]
    fn is_loaded(&self) -> bool {
        matches!(self.hydration, Hydration::Loaded)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.hydration, Hydration::Loading(_))
    }

    pub fn get(&self, uuid: &str) -> Option<SharedMetadata> {
        self.conversations.get(uuid).cloned()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.conversations.contains_key(uuid)
    }

    pub fn insert(&mut self, metadata: ConversationMetadata) -> SharedMetadata {
        let shared = Arc::new(RwLock::new(metadata));
        let uuid = shared.read().uuid.clone();
        self.conversations.insert(uuid, shared.clone());
        shared
    }

    pub fn remove(&mut self, uuid: &str) -> Option<SharedMetadata> {
        self.conversations.remove(uuid)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ConversationMetadata> {
        self.conversations
            .iter()
            .map(|(uuid, meta)| (uuid.clone(), meta.read().clone()))
            .collect()
    }

    pub fn snapshot_one(&self, uuid: &str) -> Option<ConversationMetadata> {
        self.conversations.get(uuid).map(|meta| meta.read().clone())
    }

    /// Persisted conversations, most recently updated first.
    pub fn listing(&self) -> Vec<ConversationMetadata> {
        let mut list: Vec<ConversationMetadata> = self
            .conversations
            .values()
            .map(|meta| meta.read().clone())
            .filter(|meta| meta.has_content)
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(uuid: &str, title: &str) -> ConversationMetadata {
        let mut meta = ConversationMetadata::new(None).with_title(title);
        meta.uuid = uuid.to_string();
        meta.has_content = true;
        meta
    }

    fn start_ticket(store: &mut ConversationStore<u32>, callback: u32) -> LoadTicket {
        match store.request(callback) {
            LoadRequest::Start(ticket) => ticket,
            _ => panic!("expected a new load"),
        }
    }

    #[test]
    fn concurrent_requests_share_one_load() {
        let mut store = ConversationStore::new();
        let ticket = start_ticket(&mut store, 1);
        assert!(matches!(store.request(2), LoadRequest::Queued));
        assert!(matches!(store.request(3), LoadRequest::Queued));
        assert!(store.is_loading());

        let (callbacks, outcome) = store
            .complete(ticket.id(), Ok(vec![record("A", "Chat 1")]))
            .unwrap();
        assert_eq!(callbacks, vec![1, 2, 3]);
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(store.snapshot_one("A").unwrap().title, "Chat 1");
        assert!(store.snapshot_one("B").is_none());

        match store.request(4) {
            LoadRequest::Ready(cb, LoadOutcome::Loaded) => assert_eq!(cb, 4),
            _ => panic!("loaded store should answer immediately"),
        }
    }

    #[test]
    fn failure_is_reported_and_not_retried() {
        let mut store = ConversationStore::new();
        let ticket = start_ticket(&mut store, 1);
        let (callbacks, outcome) = store.complete(ticket.id(), Err("disk gone".into())).unwrap();
        assert_eq!(callbacks, vec![1]);
        assert_eq!(outcome, LoadOutcome::Failed("disk gone".into()));

        assert!(matches!(
            store.request(2),
            LoadRequest::Ready(2, LoadOutcome::Failed(_))
        ));
        assert!(!store.is_loaded());
    }

    #[test]
    fn reload_cancels_in_flight_load() {
        let mut store = ConversationStore::new();
        let first = start_ticket(&mut store, 1);
        assert!(matches!(store.request(2), LoadRequest::Queued));

        let (cancelled, second) = store.reload(|_| false);
        assert_eq!(cancelled, vec![1, 2]);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // Late answer for the cancelled load is ignored
        assert!(store.complete(first.id(), Ok(vec![record("A", "stale")])).is_none());
        assert!(store.is_empty());

        assert!(matches!(store.request(3), LoadRequest::Queued));
        let (callbacks, _) = store.complete(second.id(), Ok(vec![record("A", "fresh")])).unwrap();
        assert_eq!(callbacks, vec![3]);
        assert_eq!(store.snapshot_one("A").unwrap().title, "fresh");
    }

    #[test]
    fn restart_keeps_waiting_callers() {
        let mut store = ConversationStore::new();
        let first = start_ticket(&mut store, 1);
        let second = store.restart().unwrap();
        assert!(first.is_cancelled());
        assert!(store.complete(first.id(), Ok(vec![])).is_none());

        let (callbacks, outcome) = store.complete(second.id(), Ok(vec![])).unwrap();
        assert_eq!(callbacks, vec![1]);
        assert_eq!(outcome, LoadOutcome::Loaded);

        assert!(store.restart().is_none());
    }

    #[test]
    fn load_never_overwrites_in_memory_records() {
        let mut store = ConversationStore::new();
        store.insert(record("A", "edited locally"));
        let ticket = start_ticket(&mut store, 1);
        store
            .complete(ticket.id(), Ok(vec![record("A", "from disk"), record("B", "other")]))
            .unwrap();

        assert_eq!(store.snapshot_one("A").unwrap().title, "edited locally");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn reload_keeps_selected_records() {
        let mut store: ConversationStore<u32> = ConversationStore::new();
        store.insert(record("pinned", "live"));
        store.insert(record("other", "evictable"));

        let (_, _) = store.reload(|meta| meta.uuid == "pinned");
        assert!(store.contains("pinned"));
        assert!(!store.contains("other"));
    }

    #[test]
    fn shared_metadata_is_not_a_copy() {
        let mut store: ConversationStore<u32> = ConversationStore::new();
        let shared = store.insert(record("A", "before"));
        shared.write().title = "after".into();
        assert_eq!(store.snapshot_one("A").unwrap().title, "after");
    }

    #[test]
    fn listing_hides_unpersisted_and_sorts_by_recency() {
        let mut store: ConversationStore<u32> = ConversationStore::new();
        let mut older = record("old", "old");
        older.updated_at = Utc::now() - Duration::hours(1);
        store.insert(older);
        store.insert(record("new", "new"));
        let mut draft = record("draft", "draft");
        draft.has_content = false;
        store.insert(draft);

        let titles: Vec<String> = store.listing().into_iter().map(|m| m.title).collect();
        assert_eq!(titles, vec!["new", "old"]);

        assert!(store.remove("old").is_some());
        assert_eq!(store.listing().len(), 1);
    }

    #[test]
    fn shutdown_drops_waiters() {
        let mut store = ConversationStore::new();
        let ticket = start_ticket(&mut store, 1);
        assert!(matches!(store.request(2), LoadRequest::Queued));
        assert_eq!(store.shutdown(), 2);
        assert!(ticket.is_cancelled());
        assert!(store.complete(ticket.id(), Ok(vec![])).is_none());
    }
}
