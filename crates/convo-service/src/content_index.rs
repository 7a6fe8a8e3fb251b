//! Back-references from ephemeral content ids to conversations.
//!
//! This is a lookup cache only. Each entry keeps a weak reference to the
//! content instance it was made for, so a reused id can be told apart from
//! the original content. It never keeps content alive.

use convo_core::AssociatedContent;
use std::collections::HashMap;
use std::sync::Weak;
use tracing::debug;

struct Association {
    conversation_uuid: String,
    content: Weak<dyn AssociatedContent>,
}

impl Association {
    fn is_alive(&self) -> bool {
        self.content.strong_count() > 0
    }
}

#[derive(Default)]
pub struct ContentAssociationIndex {
    entries: HashMap<i32, Association>,
}

impl ContentAssociationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. Reassigning content to another conversation is legal.
    pub fn associate(
        &mut self,
        content_id: i32,
        conversation_uuid: &str,
        content: Weak<dyn AssociatedContent>,
    ) {
        let association = Association {
            conversation_uuid: conversation_uuid.to_string(),
            content,
        };
        if let Some(previous) = self.entries.insert(content_id, association) {
            if previous.conversation_uuid != conversation_uuid {
                debug!(
                    "Content {} moved from conversation {} to {}",
                    content_id, previous.conversation_uuid, conversation_uuid
                );
            }
        }
    }

    pub fn resolve(&self, content_id: i32) -> Option<&str> {
        self.entries
            .get(&content_id)
            .map(|a| a.conversation_uuid.as_str())
    }

    /// True if `content_id` was associated with this very instance and it is
    /// still alive.
    pub fn is_same_content(&self, content_id: i32, content: &Weak<dyn AssociatedContent>) -> bool {
        self.entries
            .get(&content_id)
            .map_or(false, |a| a.is_alive() && Weak::ptr_eq(&a.content, content))
    }

    pub fn disassociate(&mut self, content_id: i32) -> Option<String> {
        self.entries
            .remove(&content_id)
            .map(|a| a.conversation_uuid)
    }

    /// Remove `content_id` only if it still points at `conversation_uuid`.
    pub fn disassociate_if(&mut self, content_id: i32, conversation_uuid: &str) -> bool {
        if self.resolve(content_id) == Some(conversation_uuid) {
            self.entries.remove(&content_id);
            true
        } else {
            false
        }
    }

    /// Drop every content id pointing at `conversation_uuid`.
    pub fn disassociate_all(&mut self, conversation_uuid: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, a| a.conversation_uuid != conversation_uuid);
        before - self.entries.len()
    }

    /// Drop entries whose content is gone, then those failing `keep`.
    /// Returns how many were reclaimed.
    pub fn reclaim(&mut self, mut keep: impl FnMut(i32, &str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|content_id, a| a.is_alive() && keep(*content_id, &a.conversation_uuid));
        let reclaimed = before - self.entries.len();
        if reclaimed > 0 {
            debug!("Reclaimed {} stale content associations", reclaimed);
        }
        reclaimed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
