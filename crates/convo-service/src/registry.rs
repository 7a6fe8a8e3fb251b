//! Live handlers by conversation id, plus constructions still waiting on storage.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::handler::ConversationHandler;

/// Result of [`HandlerRegistry::get_or_begin`].
pub enum Lookup<C> {
    /// A handler is already live; the callback is handed back to run now.
    Loaded(Arc<ConversationHandler>, C),
    /// Queued behind a construction already in flight.
    Joined,
    /// First request: build the handler and report back with this id.
    Construct(u64),
}

struct PendingConstruction<C> {
    id: u64,
    callbacks: Vec<C>,
}

pub struct HandlerRegistry<C> {
    handlers: HashMap<String, Arc<ConversationHandler>>,
    pending: HashMap<String, PendingConstruction<C>>,
    next_construction: u64,
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            pending: HashMap::new(),
            next_construction: 0,
        }
    }

    /// Never starts a second construction for the same id.
    pub fn get_or_begin(&mut self, uuid: &str, callback: C) -> Lookup<C> {
        if let Some(handler) = self.handlers.get(uuid) {
            return Lookup::Loaded(handler.clone(), callback);
        }
        if let Some(pending) = self.pending.get_mut(uuid) {
            pending.callbacks.push(callback);
            debug!(
                "Joined construction #{} for {} ({} waiting)",
                pending.id,
                uuid,
                pending.callbacks.len()
            );
            return Lookup::Joined;
        }

        self.next_construction += 1;
        let id = self.next_construction;
        self.pending.insert(
            uuid.to_string(),
            PendingConstruction {
                id,
                callbacks: vec![callback],
            },
        );
        Lookup::Construct(id)
    }

    /// Claim the waiters of construction `id`. `None` if it was aborted meanwhile.
    pub fn finish(&mut self, uuid: &str, id: u64) -> Option<Vec<C>> {
        match self.pending.get(uuid) {
            Some(pending) if pending.id == id => self.pending.remove(uuid).map(|p| p.callbacks),
            _ => None,
        }
    }

    /// Drop any construction in flight for `uuid`, returning its waiters.
    pub fn abort(&mut self, uuid: &str) -> Vec<C> {
        self.pending
            .remove(uuid)
            .map(|p| p.callbacks)
            .unwrap_or_default()
    }

    pub fn is_constructing(&self, uuid: &str) -> bool {
        self.pending.contains_key(uuid)
    }

    pub fn insert(&mut self, handler: Arc<ConversationHandler>) {
        let uuid = handler.uuid().to_string();
        if let Some(previous) = self.handlers.insert(uuid, handler) {
            previous.close();
        }
    }

    pub fn get(&self, uuid: &str) -> Option<&Arc<ConversationHandler>> {
        self.handlers.get(uuid)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.handlers.contains_key(uuid)
    }

    /// Remove and close. The handler stops reporting to the service.
    pub fn remove(&mut self, uuid: &str) -> Option<Arc<ConversationHandler>> {
        let handler = self.handlers.remove(uuid)?;
        handler.close();
        Some(handler)
    }

    /// Live, not closed, and nobody is using it.
    pub fn can_unload(&self, uuid: &str) -> bool {
        self.handlers
            .get(uuid)
            .map_or(false, |h| !h.is_closed() && !h.is_active())
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<ConversationHandler>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Close every handler and forget pending constructions without running them.
    pub fn drain(&mut self) -> usize {
        self.pending.clear();
        let count = self.handlers.len();
        for (_, handler) in self.handlers.drain() {
            handler.close();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ConversationHandle, ConversationObserver};
    use convo_core::{ConversationMetadata, ConversationTurn, TokenUsage};
    use parking_lot::RwLock;

    struct Quiet;

    impl ConversationObserver for Quiet {
        fn on_activity_changed(&self, _: &str) {}
        fn on_entry_added(&self, _: &str, _: &ConversationTurn) {}
        fn on_entry_removed(&self, _: &str, _: &str) {}
        fn on_title_changed(&self, _: &str, _: &str) {}
        fn on_token_info_changed(&self, _: &str, _: TokenUsage) {}
        fn on_associated_content_updated(&self, _: &str) {}
    }

    fn handler(uuid: &str) -> Arc<ConversationHandler> {
        let mut meta = ConversationMetadata::new(None);
        meta.uuid = uuid.to_string();
        ConversationHandler::new(Arc::new(RwLock::new(meta)), vec![], Arc::new(Quiet))
    }

    #[test]
    fn overlapping_lookups_share_one_construction() {
        let mut registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let id = match registry.get_or_begin("A", 1) {
            Lookup::Construct(id) => id,
            _ => panic!("first lookup should construct"),
        };
        assert!(matches!(registry.get_or_begin("A", 2), Lookup::Joined));
        assert!(registry.is_constructing("A"));

        assert_eq!(registry.finish("A", id), Some(vec![1, 2]));
        registry.insert(handler("A"));

        match registry.get_or_begin("A", 3) {
            Lookup::Loaded(h, cb) => {
                assert_eq!(h.uuid(), "A");
                assert_eq!(cb, 3);
            }
            _ => panic!("handler should be live"),
        }
    }

    #[test]
    fn aborted_construction_is_not_finished() {
        let mut registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let id = match registry.get_or_begin("A", 1) {
            Lookup::Construct(id) => id,
            _ => panic!("first lookup should construct"),
        };
        assert_eq!(registry.abort("A"), vec![1]);
        assert_eq!(registry.finish("A", id), None);

        // A fresh construction gets a new id, so the old result cannot claim it
        let fresh = match registry.get_or_begin("A", 2) {
            Lookup::Construct(fresh) => fresh,
            _ => panic!("expected a new construction"),
        };
        assert_ne!(fresh, id);
        assert_eq!(registry.finish("A", id), None);
        assert_eq!(registry.finish("A", fresh), Some(vec![2]));
    }

    #[test]
    fn can_unload_respects_handles_and_closing() {
        let mut registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let live = handler("A");
        registry.insert(live.clone());
        assert!(registry.can_unload("A"));

        let handle = ConversationHandle::new(live.clone());
        assert!(!registry.can_unload("A"));
        drop(handle);
        assert!(registry.can_unload("A"));

        let removed = registry.remove("A").unwrap();
        assert!(removed.is_closed());
        assert!(!registry.can_unload("A"));
    }

    #[test]
    fn drain_closes_everything() {
        let mut registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let a = handler("A");
        registry.insert(a.clone());
        registry.insert(handler("B"));
        let _ = registry.get_or_begin("C", 1);

        assert_eq!(registry.drain(), 2);
        assert!(a.is_closed());
        assert!(registry.is_empty());
        assert!(!registry.is_constructing("C"));
    }
}
