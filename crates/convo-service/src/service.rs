//! The conversation service: a single owner task that holds the store, the
//! handler registry, the content index, unload timers and the entitlement
//! cache, driven by messages from callers, handlers, timers and storage.

use chrono::{DateTime, Utc};
use convo_config::ServiceConfig;
use convo_core::{
    AssociatedContent, ConversationArchive, ConversationMetadata, ConversationTurn, ConvoError,
    EntitlementProvider, PersistenceGateway, PremiumInfo, PremiumStatus, Result, TokenUsage,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};

use crate::content_index::ContentAssociationIndex;
use crate::entitlement::{EntitlementCache, StatusRequest};
use crate::handler::{ConversationHandle, ConversationHandler, ConversationObserver};
use crate::lifecycle::LifecycleCoordinator;
use crate::persistence::StorageSequence;
use crate::registry::{HandlerRegistry, Lookup};
use crate::store::{ConversationStore, LoadOutcome, LoadRequest, LoadTicket, SharedMetadata};

const EVENT_CAPACITY: usize = 64;

/// Notifications for UI layers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// Persisted conversations, most recently updated first.
    ConversationListChanged(Vec<ConversationMetadata>),
    PremiumStatusChanged(PremiumStatus),
}

type Reply<T> = oneshot::Sender<Result<T>>;
type MetadataCallback = Box<dyn FnOnce(&mut ServiceCore, LoadOutcome) + Send>;
type Built = Option<Arc<ConversationHandler>>;
type HandlerCallback = Box<dyn FnOnce(&mut ServiceCore, Built) + Send>;

enum HandlerEvent {
    ActivityChanged,
    EntryAdded(ConversationTurn),
    EntryRemoved(String),
    TitleChanged,
    TokenInfoChanged,
    AssociatedContentUpdated,
}

enum Command {
    CreateConversation {
        model_key: Option<String>,
        reply: Reply<ConversationHandle>,
    },
    GetConversation {
        uuid: String,
        reply: Reply<Option<ConversationHandle>>,
    },
    GetOrCreateForContent {
        content_id: i32,
        content: Weak<dyn AssociatedContent>,
        reply: Reply<ConversationHandle>,
    },
    AssociateContent {
        uuid: String,
        content_id: i32,
        content: Weak<dyn AssociatedContent>,
        reply: Reply<()>,
    },
    DisassociateContent {
        content_id: i32,
        uuid: String,
        reply: Reply<bool>,
    },
    AllMetadata {
        reply: Reply<BTreeMap<String, ConversationMetadata>>,
    },
    Metadata {
        uuid: String,
        reply: Reply<Option<ConversationMetadata>>,
    },
    ListConversations {
        reply: Reply<Vec<ConversationMetadata>>,
    },
    ConversationExists {
        uuid: String,
        reply: Reply<bool>,
    },
    RenameConversation {
        uuid: String,
        title: String,
        reply: Reply<()>,
    },
    DeleteConversation {
        uuid: String,
        reply: Reply<()>,
    },
    DeleteConversations {
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        reply: Reply<usize>,
    },
    DeleteAssociatedContent {
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        reply: Reply<bool>,
    },
    Reload {
        reply: Reply<()>,
    },
    PremiumStatus {
        force: bool,
        reply: Reply<PremiumStatus>,
    },
    CachedPremiumStatus {
        reply: Reply<(PremiumStatus, Option<PremiumInfo>)>,
    },
    InMemoryCount {
        reply: Reply<usize>,
    },
    Shutdown {
        reply: Reply<()>,
    },

    MetadataLoaded {
        ticket: u64,
        result: std::result::Result<Vec<ConversationMetadata>, String>,
    },
    ArchiveLoaded {
        uuid: String,
        construction: u64,
        result: std::result::Result<Option<ConversationArchive>, String>,
    },
    PremiumFetched {
        result: std::result::Result<(PremiumStatus, Option<PremiumInfo>), String>,
    },
    UnloadTimerFired {
        uuid: String,
        generation: u64,
    },
    SweepAssociations,
    Handler {
        uuid: String,
        event: HandlerEvent,
    },
}

/// Handler-side end of the observer capability. Holds only a weak sender, so
/// handlers that outlive the service cannot keep it running.
struct ObserverLink {
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl ObserverLink {
    fn post(&self, uuid: &str, event: HandlerEvent) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(Command::Handler {
                uuid: uuid.to_string(),
                event,
            });
        }
    }
}

impl ConversationObserver for ObserverLink {
    fn on_activity_changed(&self, uuid: &str) {
        self.post(uuid, HandlerEvent::ActivityChanged);
    }

    fn on_entry_added(&self, uuid: &str, entry: &ConversationTurn) {
        self.post(uuid, HandlerEvent::EntryAdded(entry.clone()));
    }

    fn on_entry_removed(&self, uuid: &str, entry_uuid: &str) {
        self.post(uuid, HandlerEvent::EntryRemoved(entry_uuid.to_string()));
    }

    fn on_title_changed(&self, uuid: &str, _title: &str) {
        self.post(uuid, HandlerEvent::TitleChanged);
    }

    fn on_token_info_changed(&self, uuid: &str, _usage: TokenUsage) {
        self.post(uuid, HandlerEvent::TokenInfoChanged);
    }

    fn on_associated_content_updated(&self, uuid: &str) {
        self.post(uuid, HandlerEvent::AssociatedContentUpdated);
    }
}

struct ServiceCore {
    tx: mpsc::WeakUnboundedSender<Command>,
    store: ConversationStore<MetadataCallback>,
    registry: HandlerRegistry<HandlerCallback>,
    index: ContentAssociationIndex,
    lifecycle: LifecycleCoordinator,
    entitlement: EntitlementCache<Reply<PremiumStatus>>,
    provider: Arc<dyn EntitlementProvider>,
    storage: StorageSequence,
    events: broadcast::Sender<ServiceEvent>,
    sweeper: Option<JoinHandle<()>>,
}

impl ServiceCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(
            "Conversation service started: storage {}, unload delay {:?}",
            if self.storage.is_enabled() { "enabled" } else { "disabled" },
            self.lifecycle.delay()
        );
        while let Some(command) = rx.recv().await {
            if let Command::Shutdown { reply } = command {
                self.teardown();
                self.storage.flush().await;
                let _ = reply.send(Ok(()));
                return;
            }
            self.handle(command);
        }
        self.teardown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::CreateConversation { model_key, reply } => {
                let handler = self.create_handler(model_key);
                let _ = reply.send(Ok(ConversationHandle::new(handler)));
            }
            Command::GetConversation { uuid, reply } => {
                self.with_handler(
                    uuid,
                    Box::new(move |_: &mut ServiceCore, handler: Built| {
                        let _ = reply.send(Ok(handler.map(ConversationHandle::new)));
                    }),
                );
            }
            Command::GetOrCreateForContent {
                content_id,
                content,
                reply,
            } => self.get_or_create_for_content(content_id, content, reply),
            Command::AssociateContent {
                uuid,
                content_id,
                content,
                reply,
            } => {
                let target = uuid.clone();
                self.with_handler(
                    uuid,
                    Box::new(move |core: &mut ServiceCore, handler: Built| match handler {
                        Some(handler) => {
                            core.bind_content(&handler, content_id, content);
                            let _ = reply.send(Ok(()));
                        }
                        None => {
                            let _ = reply.send(Err(ConvoError::NotFound(target)));
                        }
                    }),
                );
            }
            Command::DisassociateContent {
                content_id,
                uuid,
                reply,
            } => {
                let removed = self.index.disassociate_if(content_id, &uuid);
                if let Some(handler) = self.registry.get(&uuid) {
                    if handler.associated_content_id() == Some(content_id) {
                        handler.clear_content();
                    }
                }
                let _ = reply.send(Ok(removed));
            }
            Command::AllMetadata { reply } => {
                self.with_metadata(Box::new(move |core: &mut ServiceCore, outcome: LoadOutcome| {
                    let _ = reply.send(outcome_result(outcome).map(|_| core.store.snapshot()));
                }));
            }
            Command::Metadata { uuid, reply } => {
                self.with_metadata(Box::new(move |core: &mut ServiceCore, outcome: LoadOutcome| {
                    let _ = reply.send(outcome_result(outcome).map(|_| core.store.snapshot_one(&uuid)));
                }));
            }
            Command::ListConversations { reply } => {
                self.with_metadata(Box::new(move |core: &mut ServiceCore, outcome: LoadOutcome| {
                    let list = match outcome {
                        LoadOutcome::Loaded => core.store.listing(),
                        _ => Vec::new(),
                    };
                    let _ = reply.send(Ok(list));
                }));
            }
            Command::ConversationExists { uuid, reply } => {
                self.with_metadata(Box::new(move |core: &mut ServiceCore, outcome: LoadOutcome| {
                    let exists = outcome == LoadOutcome::Loaded && core.store.contains(&uuid);
                    let _ = reply.send(Ok(exists));
                }));
            }
            Command::RenameConversation { uuid, title, reply } => {
                self.rename_conversation(uuid, title, reply)
            }
            Command::DeleteConversation { uuid, reply } => self.delete_conversation(uuid, reply),
            Command::DeleteConversations { begin, end, reply } => {
                self.with_metadata(Box::new(move |core: &mut ServiceCore, _: LoadOutcome| {
                    core.delete_conversations(begin, end, reply)
                }));
            }
            Command::DeleteAssociatedContent { begin, end, reply } => {
                for handler in self.registry.handlers() {
                    handler.strip_page_context(begin, end);
                }
                self.storage.write_then(
                    "delete_associated_content",
                    move |gateway| async move { gateway.delete_associated_content(begin, end).await },
                    move |result| {
                        let _ = reply.send(Ok(result.is_ok()));
                    },
                );
            }
            Command::Reload { reply } => {
                self.reload();
                let _ = reply.send(Ok(()));
            }
            Command::PremiumStatus { force, reply } => self.premium_status(force, reply),
            Command::CachedPremiumStatus { reply } => {
                let info = self.entitlement.info().cloned();
                let _ = reply.send(Ok((self.entitlement.cached(), info)));
            }
            Command::InMemoryCount { reply } => {
                let _ = reply.send(Ok(self.registry.len()));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
            Command::MetadataLoaded { ticket, result } => {
                if let Some((callbacks, outcome)) = self.store.complete(ticket, result) {
                    for callback in callbacks {
                        callback(self, outcome.clone());
                    }
                    if outcome == LoadOutcome::Loaded {
                        self.emit_list_changed();
                    }
                }
            }
            Command::ArchiveLoaded {
                uuid,
                construction,
                result,
            } => self.on_archive_loaded(uuid, construction, result),
            Command::PremiumFetched { result } => {
                let update = self.entitlement.complete(result);
                for waiter in update.waiters {
                    let _ = waiter.send(update.result.clone().map_err(ConvoError::Entitlement));
                }
                if update.changed {
                    let _ = self
                        .events
                        .send(ServiceEvent::PremiumStatusChanged(self.entitlement.cached()));
                }
            }
            Command::UnloadTimerFired { uuid, generation } => {
                if self.lifecycle.take_fired(&uuid, generation) && self.registry.can_unload(&uuid) {
                    self.unload(&uuid);
                }
            }
            Command::SweepAssociations => self.reclaim_associations(),
            Command::Handler { uuid, event } => self.on_handler_event(uuid, event),
        }
    }

    /// Run `callback` once the metadata set is hydrated (or has failed to be).
    fn with_metadata(&mut self, callback: MetadataCallback) {
        match self.store.request(callback) {
            LoadRequest::Ready(callback, outcome) => callback(self, outcome),
            LoadRequest::Queued => {}
            LoadRequest::Start(ticket) => self.start_load(ticket),
        }
    }

    fn start_load(&self, ticket: LoadTicket) {
        let tx = self.tx.clone();
        let id = ticket.id();
        self.storage.load_all_metadata(ticket, move |result| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::MetadataLoaded { ticket: id, result });
            }
        });
    }

    fn reload(&mut self) {
        let registry = &self.registry;
        let (cancelled, ticket) = self
            .store
            .reload(|meta| {
                !meta.has_content
                    || registry.contains(&meta.uuid)
                    || registry.is_constructing(&meta.uuid)
            });
        for callback in cancelled {
            callback(self, LoadOutcome::Cancelled);
        }
        self.start_load(ticket);
    }

    /// Resolve `callback` with the live handler for `uuid`, building it if needed.
    fn with_handler(&mut self, uuid: String, callback: HandlerCallback) {
        match self.registry.get_or_begin(&uuid, callback) {
            Lookup::Loaded(handler, callback) => {
                self.lifecycle.cancel(&uuid);
                callback(self, Some(handler));
            }
            Lookup::Joined => {}
            Lookup::Construct(construction) => {
                self.with_metadata(Box::new(move |core: &mut ServiceCore, outcome: LoadOutcome| {
                    core.construct_handler(uuid, construction, outcome)
                }));
            }
        }
    }

    fn construct_handler(&mut self, uuid: String, construction: u64, outcome: LoadOutcome) {
        let metadata = match (&outcome, self.store.get(&uuid)) {
            (LoadOutcome::Loaded, Some(metadata)) => metadata,
            _ => {
                debug!("No conversation {} to construct ({:?})", uuid, outcome);
                self.finish_construction(&uuid, construction, |_| None);
                return;
            }
        };

        if !metadata.read().has_content {
            self.finish_construction(&uuid, construction, |core| {
                Some(core.install_handler(metadata, Vec::new()))
            });
            return;
        }

        let tx = self.tx.clone();
        self.storage.load_archive(uuid.clone(), move |result| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::ArchiveLoaded {
                    uuid,
                    construction,
                    result,
                });
            }
        });
    }

    fn on_archive_loaded(
        &mut self,
        uuid: String,
        construction: u64,
        result: std::result::Result<Option<ConversationArchive>, String>,
    ) {
        self.finish_construction(&uuid, construction, |core| {
            let Some(metadata) = core.store.get(&uuid) else {
                info!("Conversation {} was deleted while loading", uuid);
                return None;
            };
            let history = match result {
                Ok(Some(archive)) => archive.entries,
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!("Failed to load history for {}: {}", uuid, e);
                    Vec::new()
                }
            };
            Some(core.install_handler(metadata, history))
        });
    }

    /// Claim construction `construction` and hand its result to every waiter.
    /// Does nothing if the construction was aborted in the meantime.
    fn finish_construction<B>(&mut self, uuid: &str, construction: u64, build: B)
    where
        B: FnOnce(&mut Self) -> Built,
    {
        let Some(callbacks) = self.registry.finish(uuid, construction) else {
            debug!("Discarding construction #{} for {}: aborted", construction, uuid);
            return;
        };
        let handler = build(self);
        for callback in callbacks {
            callback(self, handler.clone());
        }
        if handler.is_some() {
            self.maybe_queue_unload(uuid);
        }
    }

    fn install_handler(
        &mut self,
        metadata: SharedMetadata,
        history: Vec<ConversationTurn>,
    ) -> Arc<ConversationHandler> {
        let observer = Arc::new(ObserverLink {
            tx: self.tx.clone(),
        });
        let handler = ConversationHandler::new(metadata, history, observer);
        info!(
            "Loaded conversation handler {} ({} in memory)",
            handler.uuid(),
            self.registry.len() + 1
        );
        self.registry.insert(handler.clone());
        handler
    }

    fn create_handler(&mut self, model_key: Option<String>) -> Arc<ConversationHandler> {
        let metadata = self.store.insert(ConversationMetadata::new(model_key));
        self.install_handler(metadata, Vec::new())
    }

    fn get_or_create_for_content(
        &mut self,
        content_id: i32,
        content: Weak<dyn AssociatedContent>,
        reply: Reply<ConversationHandle>,
    ) {
        if let Some(uuid) = self.index.resolve(content_id).map(str::to_owned) {
            if !self.index.is_same_content(content_id, &content) {
                debug!("Content id {} was reused, dropping stale association", content_id);
                self.release_content(content_id, &uuid);
            } else if let Some(handler) = self.registry.get(&uuid).cloned() {
                self.lifecycle.cancel(&uuid);
                self.bind_content(&handler, content_id, content);
                let _ = reply.send(Ok(ConversationHandle::new(handler)));
                return;
            } else if self.store.contains(&uuid) {
                self.with_handler(
                    uuid.clone(),
                    Box::new(move |core: &mut ServiceCore, handler: Built| {
                        let handler = handler.unwrap_or_else(|| {
                            core.index.disassociate_if(content_id, &uuid);
                            core.create_handler(None)
                        });
                        core.bind_content(&handler, content_id, content);
                        let _ = reply.send(Ok(ConversationHandle::new(handler)));
                    }),
                );
                return;
            } else {
                self.index.disassociate(content_id);
            }
        }

        let handler = self.create_handler(None);
        self.bind_content(&handler, content_id, content);
        let _ = reply.send(Ok(ConversationHandle::new(handler)));
    }

    fn bind_content(
        &mut self,
        handler: &Arc<ConversationHandler>,
        content_id: i32,
        content: Weak<dyn AssociatedContent>,
    ) {
        let uuid = handler.uuid();
        if let Some(previous) = self.index.resolve(content_id).filter(|owner| *owner != uuid) {
            if let Some(owner) = self.registry.get(previous) {
                if owner.associated_content_id() == Some(content_id) {
                    owner.clear_content();
                }
            }
        }
        if let Some(previous) = handler.associate_content(content_id, content.clone()) {
            self.index.disassociate_if(previous, uuid);
        }
        self.index.associate(content_id, uuid, content);
    }

    /// Forget `content_id`, and detach it from its loaded owner if the
    /// content that owner was bound to is gone.
    fn release_content(&mut self, content_id: i32, uuid: &str) {
        self.index.disassociate(content_id);
        if let Some(owner) = self.registry.get(uuid) {
            if owner.associated_content_id() == Some(content_id) && !owner.has_live_content() {
                owner.clear_content();
            }
        }
    }

    fn reclaim_associations(&mut self) {
        let registry = &self.registry;
        let store = &self.store;
        self.index.reclaim(|content_id, uuid| match registry.get(uuid) {
            Some(handler) => handler.is_bound_to(content_id),
            None => store.contains(uuid),
        });
    }

    fn on_handler_event(&mut self, uuid: String, event: HandlerEvent) {
        if let HandlerEvent::ActivityChanged = event {
            self.maybe_queue_unload(&uuid);
            return;
        }
        let Some(metadata) = self.store.get(&uuid) else {
            debug!("Dropping update for removed conversation {}", uuid);
            return;
        };

        match event {
            HandlerEvent::EntryAdded(entry) => {
                let first = {
                    let mut meta = metadata.write();
                    let first = !meta.has_content;
                    meta.has_content = true;
                    first
                };
                if first {
                    info!("Persisting new conversation {}", uuid);
                }
                self.save_metadata(&metadata);
                self.storage.write("append_entry", move |gateway| async move {
                    gateway.append_entry(&uuid, &entry).await
                });
                self.emit_list_changed();
            }
            HandlerEvent::EntryRemoved(entry_uuid) => {
                if metadata.read().has_content {
                    self.storage.write("delete_entry", move |gateway| async move {
                        gateway.delete_entry(&uuid, &entry_uuid).await
                    });
                }
            }
            HandlerEvent::TitleChanged => {
                if metadata.read().has_content {
                    self.save_metadata(&metadata);
                    self.emit_list_changed();
                }
            }
            HandlerEvent::TokenInfoChanged => {
                if metadata.read().has_content {
                    self.save_metadata(&metadata);
                }
            }
            HandlerEvent::AssociatedContentUpdated => {
                let registry = &self.registry;
                self.index.reclaim(|content_id, owner| {
                    owner != uuid
                        || registry
                            .get(owner)
                            .map_or(true, |handler| handler.is_bound_to(content_id))
                });
            }
            HandlerEvent::ActivityChanged => {}
        }
    }

    fn save_metadata(&self, metadata: &SharedMetadata) {
        let snapshot = metadata.read().clone();
        self.storage.write("save_metadata", move |gateway| async move {
            gateway.save_metadata(&snapshot).await
        });
    }

    fn maybe_queue_unload(&mut self, uuid: &str) {
        if !self.registry.can_unload(uuid) {
            self.lifecycle.cancel(uuid);
            return;
        }
        let tx = self.tx.clone();
        let target = uuid.to_string();
        self.lifecycle.schedule(uuid, move |generation| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::UnloadTimerFired {
                    uuid: target,
                    generation,
                });
            }
        });
    }

    fn unload(&mut self, uuid: &str) {
        let Some(handler) = self.registry.remove(uuid) else {
            return;
        };
        let persisted = self
            .store
            .get(uuid)
            .map_or(false, |meta| meta.read().has_content);
        if !persisted || !handler.has_live_content() {
            self.index.disassociate_all(uuid);
        }
        if !persisted {
            self.store.remove(uuid);
        }
        info!(
            "Unloaded conversation handler {} ({} in memory)",
            uuid,
            self.registry.len()
        );
    }

    /// Drop everything held in memory for `uuid` right away.
    fn purge(&mut self, uuid: &str) {
        self.lifecycle.cancel(uuid);
        if self.registry.remove(uuid).is_some() {
            debug!("Closed handler for deleted conversation {}", uuid);
        }
        for callback in self.registry.abort(uuid) {
            callback(self, None);
        }
        self.index.disassociate_all(uuid);
        self.store.remove(uuid);
    }

    /// A load still in flight would read storage from before the delete, so
    /// queue it again behind the delete.
    fn restart_load(&mut self) {
        if let Some(ticket) = self.store.restart() {
            self.start_load(ticket);
        }
    }

    #[instrument(skip(self, reply))]
    fn delete_conversation(&mut self, uuid: String, reply: Reply<()>) {
        info!("Deleting conversation {}", uuid);
        self.purge(&uuid);
        self.storage.write_then(
            "delete_conversation",
            move |gateway| async move { gateway.delete_conversation(&uuid).await },
            move |result| {
                let _ = reply.send(result);
            },
        );
        self.restart_load();
        self.emit_list_changed();
    }

    fn delete_conversations(
        &mut self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        reply: Reply<usize>,
    ) {
        let doomed: Vec<String> = self
            .store
            .snapshot()
            .into_values()
            .filter(|meta| meta.updated_within(begin, end))
            .map(|meta| meta.uuid)
            .collect();
        info!("Deleting {} conversations in range {:?}..{:?}", doomed.len(), begin, end);
        for uuid in &doomed {
            self.purge(uuid);
        }

        let count = doomed.len();
        self.storage.write_then(
            "delete_range",
            move |gateway| async move { gateway.delete_range(begin, end).await },
            move |result| {
                let _ = reply.send(result.map(|_| count));
            },
        );
        self.restart_load();
        self.emit_list_changed();
    }

    fn rename_conversation(&mut self, uuid: String, title: String, reply: Reply<()>) {
        if let Some(handler) = self.registry.get(&uuid) {
            let _ = reply.send(handler.set_title(title));
            return;
        }
        self.with_metadata(Box::new(move |core: &mut ServiceCore, outcome: LoadOutcome| {
            if let Err(e) = outcome_result(outcome) {
                let _ = reply.send(Err(e));
                return;
            }
            let Some(metadata) = core.store.get(&uuid) else {
                let _ = reply.send(Err(ConvoError::NotFound(uuid)));
                return;
            };
            metadata.write().title = title;
            if metadata.read().has_content {
                core.save_metadata(&metadata);
                core.emit_list_changed();
            }
            let _ = reply.send(Ok(()));
        }));
    }

    fn premium_status(&mut self, force: bool, reply: Reply<PremiumStatus>) {
        match self.entitlement.request(reply, force) {
            StatusRequest::Fresh(reply, status) => {
                let _ = reply.send(Ok(status));
            }
            StatusRequest::Queued => {}
            StatusRequest::Fetch => {
                let provider = self.provider.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = provider
                        .fetch_premium_status()
                        .await
                        .map_err(|e| e.to_string());
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(Command::PremiumFetched { result });
                    }
                });
            }
        }
    }

    fn emit_list_changed(&self) {
        if self.events.receiver_count() > 0 {
            let _ = self
                .events
                .send(ServiceEvent::ConversationListChanged(self.store.listing()));
        }
    }

    fn teardown(&mut self) {
        let timers = self.lifecycle.cancel_all();
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        let waiting = self.store.shutdown();
        let handlers = self.registry.drain();
        let premium_waiting = self.entitlement.shutdown();
        self.index.clear();
        info!(
            "Conversation service stopped: {} handlers closed, {} timers cancelled, {} callbacks dropped",
            handlers,
            timers,
            waiting + premium_waiting
        );
    }
}

fn outcome_result(outcome: LoadOutcome) -> Result<()> {
    match outcome {
        LoadOutcome::Loaded => Ok(()),
        LoadOutcome::Failed(reason) => Err(ConvoError::LoadFailed(reason)),
        LoadOutcome::Cancelled => Err(ConvoError::LoadCancelled),
    }
}

fn spawn_sweeper(tx: mpsc::WeakUnboundedSender<Command>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            let Some(tx) = tx.upgrade() else {
                break;
            };
            if tx.send(Command::SweepAssociations).is_err() {
                break;
            }
        }
    })
}

/// Cloneable front end of the conversation service.
///
/// Every operation is a message to the owner task. Once every clone is
/// dropped, or [`ConversationService::shutdown`] is called, the task tears
/// down and outstanding calls fail with [`ConvoError::Shutdown`].
#[derive(Clone)]
pub struct ConversationService {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ServiceEvent>,
}

impl ConversationService {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &ServiceConfig,
        gateway: Option<Arc<dyn PersistenceGateway>>,
        provider: Arc<dyn EntitlementProvider>,
    ) -> Self {
        let gateway = if config.storage.enabled {
            gateway
        } else {
            info!("Conversation history storage is disabled");
            None
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let weak = tx.downgrade();

        let sweeper = config
            .lifecycle
            .association_sweep()
            .map(|period| spawn_sweeper(weak.clone(), period));

        let core = ServiceCore {
            tx: weak,
            store: ConversationStore::new(),
            registry: HandlerRegistry::new(),
            index: ContentAssociationIndex::new(),
            lifecycle: LifecycleCoordinator::new(config.lifecycle.unload_delay()),
            entitlement: EntitlementCache::new(config.entitlement.max_age()),
            provider,
            storage: StorageSequence::new(gateway),
            events: events.clone(),
            sweeper,
        };
        tokio::spawn(core.run(rx));

        Self { tx, events }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| ConvoError::Shutdown)?;
        rx.await.map_err(|_| ConvoError::Shutdown)?
    }

    /// New, unpersisted conversation. It is written to storage with its first entry.
    pub async fn create_conversation(&self, model_key: Option<String>) -> Result<ConversationHandle> {
        self.call(|reply| Command::CreateConversation { model_key, reply })
            .await
    }

    /// `Ok(None)` when the conversation does not exist or metadata could not be loaded.
    #[instrument(skip(self))]
    pub async fn get_conversation(&self, uuid: &str) -> Result<Option<ConversationHandle>> {
        let uuid = uuid.to_string();
        self.call(|reply| Command::GetConversation { uuid, reply })
            .await
    }

    /// The conversation bound to `content_id`, or a new one bound to it.
    pub async fn get_or_create_for_content(
        &self,
        content_id: i32,
        content: Weak<dyn AssociatedContent>,
    ) -> Result<ConversationHandle> {
        self.call(|reply| Command::GetOrCreateForContent {
            content_id,
            content,
            reply,
        })
        .await
    }

    pub async fn associate_content(
        &self,
        uuid: &str,
        content_id: i32,
        content: Weak<dyn AssociatedContent>,
    ) -> Result<()> {
        let uuid = uuid.to_string();
        self.call(|reply| Command::AssociateContent {
            uuid,
            content_id,
            content,
            reply,
        })
        .await
    }

    /// Returns whether `content_id` was bound to `uuid`.
    pub async fn disassociate_content(&self, content_id: i32, uuid: &str) -> Result<bool> {
        let uuid = uuid.to_string();
        self.call(|reply| Command::DisassociateContent {
            content_id,
            uuid,
            reply,
        })
        .await
    }

    pub async fn all_metadata(&self) -> Result<BTreeMap<String, ConversationMetadata>> {
        self.call(|reply| Command::AllMetadata { reply }).await
    }

    pub async fn metadata(&self, uuid: &str) -> Result<Option<ConversationMetadata>> {
        let uuid = uuid.to_string();
        self.call(|reply| Command::Metadata { uuid, reply }).await
    }

    /// Persisted conversations, most recently updated first. Empty if loading failed.
    pub async fn get_conversations(&self) -> Result<Vec<ConversationMetadata>> {
        self.call(|reply| Command::ListConversations { reply }).await
    }

    pub async fn conversation_exists(&self, uuid: &str) -> Result<bool> {
        let uuid = uuid.to_string();
        self.call(|reply| Command::ConversationExists { uuid, reply })
            .await
    }

    pub async fn rename_conversation(&self, uuid: &str, title: impl Into<String>) -> Result<()> {
        let uuid = uuid.to_string();
        let title = title.into();
        self.call(|reply| Command::RenameConversation { uuid, title, reply })
            .await
    }

    /// Removes the conversation from memory immediately, then from storage.
    pub async fn delete_conversation(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.call(|reply| Command::DeleteConversation { uuid, reply })
            .await
    }

    /// Deletes conversations last updated in `[begin, end]`; open bounds match everything.
    /// Returns how many were removed from memory.
    pub async fn delete_conversations(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.call(|reply| Command::DeleteConversations { begin, end, reply })
            .await
    }

    /// Strips captured page context from entries created in `[begin, end]`.
    /// Returns whether storage accepted the change.
    pub async fn delete_associated_content(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.call(|reply| Command::DeleteAssociatedContent { begin, end, reply })
            .await
    }

    /// Re-read metadata from storage. Callers waiting on an in-flight load get
    /// [`ConvoError::LoadCancelled`].
    pub async fn reload_conversations(&self) -> Result<()> {
        self.call(|reply| Command::Reload { reply }).await
    }

    pub async fn premium_status(&self) -> Result<PremiumStatus> {
        self.call(|reply| Command::PremiumStatus {
            force: false,
            reply,
        })
        .await
    }

    /// Fetch regardless of age, e.g. when a UI regains focus.
    pub async fn refresh_premium_status(&self) -> Result<PremiumStatus> {
        self.call(|reply| Command::PremiumStatus { force: true, reply })
            .await
    }

    /// Last known status. Never fetches.
    pub async fn cached_premium_status(&self) -> Result<(PremiumStatus, Option<PremiumInfo>)> {
        self.call(|reply| Command::CachedPremiumStatus { reply })
            .await
    }

    /// Number of live handlers.
    pub async fn in_memory_count(&self) -> Result<usize> {
        self.call(|reply| Command::InMemoryCount { reply }).await
    }

    pub fn subscribe(&self) -> BroadcastStream<ServiceEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Stop the owner task. Pending timers, loads and callbacks are discarded;
    /// writes already queued are allowed to finish first.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}
