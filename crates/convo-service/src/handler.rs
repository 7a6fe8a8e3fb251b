//! The in-memory runtime object for one conversation.

use chrono::{DateTime, Utc};
use convo_core::{
    in_range, AssociatedContent, ContentSnapshot, ConversationMetadata, ConversationTurn,
    ConvoError, Result, TokenUsage, TurnRole,
};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::store::SharedMetadata;

/// Capability a handler reports through. Registered at construction and
/// dropped when the handler is closed.
pub trait ConversationObserver: Send + Sync {
    /// The handler moved between having and not having active users.
    fn on_activity_changed(&self, uuid: &str);
    fn on_entry_added(&self, uuid: &str, entry: &ConversationTurn);
    fn on_entry_removed(&self, uuid: &str, entry_uuid: &str);
    fn on_title_changed(&self, uuid: &str, title: &str);
    fn on_token_info_changed(&self, uuid: &str, usage: TokenUsage);
    fn on_associated_content_updated(&self, uuid: &str);
}

struct ContentRef {
    content_id: i32,
    content: Weak<dyn AssociatedContent>,
}

#[derive(Default)]
struct HandlerState {
    history: Vec<ConversationTurn>,
    content: Option<ContentRef>,
    clients: usize,
    requests: usize,
    handles: usize,
    observer: Option<Arc<dyn ConversationObserver>>,
    closed: bool,
}

impl HandlerState {
    fn is_active(&self) -> bool {
        self.clients > 0 || self.requests > 0 || self.handles > 0
    }
}

pub struct ConversationHandler {
    uuid: String,
    metadata: SharedMetadata,
    state: Mutex<HandlerState>,
}

impl ConversationHandler {
    pub(crate) fn new(
        metadata: SharedMetadata,
        history: Vec<ConversationTurn>,
        observer: Arc<dyn ConversationObserver>,
    ) -> Arc<Self> {
        let uuid = metadata.read().uuid.clone();
        Arc::new(Self {
            uuid,
            metadata,
            state: Mutex::new(HandlerState {
                history,
                observer: Some(observer),
                ..Default::default()
            }),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn metadata(&self) -> ConversationMetadata {
        self.metadata.read().clone()
    }

    pub fn title(&self) -> String {
        self.metadata.read().title.clone()
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.state.lock().history.clone()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients
    }

    pub fn is_request_in_progress(&self) -> bool {
        self.state.lock().requests > 0
    }

    /// Any attached client, running request or outstanding handle.
    pub fn is_active(&self) -> bool {
        self.state.lock().is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn observer(&self) -> Result<Arc<dyn ConversationObserver>> {
        let state = self.state.lock();
        match (&state.observer, state.closed) {
            (Some(observer), false) => Ok(observer.clone()),
            _ => Err(ConvoError::HandlerClosed(self.uuid.clone())),
        }
    }

    /// Append a turn. Human turns capture the associated page, if it is still alive.
    pub fn add_entry(&self, mut entry: ConversationTurn) -> Result<ConversationTurn> {
        let observer = self.observer()?;
        {
            let mut state = self.state.lock();
            if entry.role == TurnRole::Human && entry.page_context.is_none() {
                entry.page_context = state
                    .content
                    .as_ref()
                    .and_then(|c| c.content.upgrade())
                    .map(|content| ContentSnapshot {
                        url: content.url(),
                        title: content.title(),
                    });
            }
            state.history.push(entry.clone());
        }
        self.metadata.write().updated_at = Utc::now();

        observer.on_entry_added(&self.uuid, &entry);
        Ok(entry)
    }

    pub fn remove_entry(&self, entry_uuid: &str) -> Result<bool> {
        let observer = self.observer()?;
        let removed = {
            let mut state = self.state.lock();
            let before = state.history.len();
            state.history.retain(|e| e.uuid != entry_uuid);
            state.history.len() != before
        };
        if removed {
            observer.on_entry_removed(&self.uuid, entry_uuid);
        }
        Ok(removed)
    }

    pub fn set_title(&self, title: impl Into<String>) -> Result<()> {
        let observer = self.observer()?;
        let title = title.into();
        {
            let mut meta = self.metadata.write();
            if meta.title == title {
                return Ok(());
            }
            meta.title = title.clone();
        }
        observer.on_title_changed(&self.uuid, &title);
        Ok(())
    }

    pub fn update_token_usage(&self, total: u64, trimmed: u64) -> Result<()> {
        let observer = self.observer()?;
        let usage = {
            let mut meta = self.metadata.write();
            if !meta.token_usage.record(total, trimmed) {
                return Ok(());
            }
            meta.token_usage
        };
        observer.on_token_info_changed(&self.uuid, usage);
        Ok(())
    }

    /// Live associated content, if any. Never use this to extend its lifetime.
    pub fn associated_content(&self) -> Option<Arc<dyn AssociatedContent>> {
        self.state
            .lock()
            .content
            .as_ref()
            .and_then(|c| c.content.upgrade())
    }

    /// The content id recorded at association time, whether or not it is still alive.
    pub fn associated_content_id(&self) -> Option<i32> {
        self.state.lock().content.as_ref().map(|c| c.content_id)
    }

    pub fn has_live_content(&self) -> bool {
        self.associated_content().is_some()
    }

    /// True only if `content_id` is still backed by the instance originally associated.
    pub fn is_bound_to(&self, content_id: i32) -> bool {
        let state = self.state.lock();
        match &state.content {
            Some(c) if c.content_id == content_id => c
                .content
                .upgrade()
                .map_or(false, |live| live.content_id() == content_id),
            _ => false,
        }
    }

    /// Returns the previously bound content id when it differs from the new one.
    pub(crate) fn associate_content(
        &self,
        content_id: i32,
        content: Weak<dyn AssociatedContent>,
    ) -> Option<i32> {
        let (previous, observer) = {
            let mut state = self.state.lock();
            let same = state
                .content
                .as_ref()
                .map_or(false, |c| Weak::ptr_eq(&c.content, &content));
            if same {
                return None;
            }
            let previous = state
                .content
                .replace(ContentRef { content_id, content })
                .map(|c| c.content_id)
                .filter(|id| *id != content_id);
            (previous, state.observer.clone())
        };
        if let Some(observer) = observer {
            observer.on_associated_content_updated(&self.uuid);
        }
        previous
    }

    pub(crate) fn clear_content(&self) -> Option<i32> {
        let previous = self.state.lock().content.take().map(|c| c.content_id);
        if previous.is_some() {
            if let Ok(observer) = self.observer() {
                observer.on_associated_content_updated(&self.uuid);
            }
        }
        previous
    }

    pub(crate) fn strip_page_context(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) {
        for entry in self.state.lock().history.iter_mut() {
            if in_range(entry.created_at, begin, end) {
                entry.page_context = None;
            }
        }
    }

    /// Detach from the service. Nothing the handler does afterwards reaches storage.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.observer = None;
    }

    fn adjust(&self, change: impl FnOnce(&mut HandlerState)) {
        let observer = {
            let mut state = self.state.lock();
            let was_active = state.is_active();
            change(&mut state);
            if was_active == state.is_active() {
                return;
            }
            state.observer.clone()
        };
        if let Some(observer) = observer {
            observer.on_activity_changed(&self.uuid);
        }
    }
}

impl fmt::Debug for ConversationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConversationHandler")
            .field("uuid", &self.uuid)
            .field("entries", &state.history.len())
            .field("clients", &state.clients)
            .field("requests", &state.requests)
            .field("handles", &state.handles)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Caller-side reference to a live handler.
///
/// While any handle exists the handler cannot be unloaded, which covers the
/// window between creating a conversation and using it.
pub struct ConversationHandle {
    handler: Arc<ConversationHandler>,
}

impl ConversationHandle {
    pub(crate) fn new(handler: Arc<ConversationHandler>) -> Self {
        handler.adjust(|s| s.handles += 1);
        Self { handler }
    }

    /// Register a remote consumer (e.g. a UI connection) for as long as the guard lives.
    pub fn attach_client(&self) -> ClientGuard {
        self.handler.adjust(|s| s.clients += 1);
        ClientGuard {
            handler: self.handler.clone(),
        }
    }

    /// Mark a request as in flight for as long as the guard lives.
    pub fn begin_request(&self) -> RequestGuard {
        self.handler.adjust(|s| s.requests += 1);
        RequestGuard {
            handler: self.handler.clone(),
        }
    }

    pub fn same_handler(&self, other: &ConversationHandle) -> bool {
        Arc::ptr_eq(&self.handler, &other.handler)
    }
}

impl Clone for ConversationHandle {
    fn clone(&self) -> Self {
        Self::new(self.handler.clone())
    }
}

impl Drop for ConversationHandle {
    fn drop(&mut self) {
        self.handler.adjust(|s| s.handles = s.handles.saturating_sub(1));
    }
}

impl Deref for ConversationHandle {
    type Target = ConversationHandler;

    fn deref(&self) -> &Self::Target {
        &self.handler
    }
}

impl fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConversationHandle").field(&self.handler.uuid).finish()
    }
}

#[must_use = "the client detaches when the guard is dropped"]
pub struct ClientGuard {
    handler: Arc<ConversationHandler>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.handler.adjust(|s| s.clients = s.clients.saturating_sub(1));
    }
}

#[must_use = "the request ends when the guard is dropped"]
pub struct RequestGuard {
    handler: Arc<ConversationHandler>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.handler.adjust(|s| s.requests = s.requests.saturating_sub(1));
    }
}
