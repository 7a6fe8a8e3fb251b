//! Conversation cache and lifecycle manager.
//!
//! [`ConversationService`] owns a lazily loaded metadata map, the live
//! conversation handlers, an index from ephemeral content ids to
//! conversations, and a cached premium status. All state transitions happen
//! on one owner task; storage runs behind it on its own sequence.

pub mod content_index;
pub mod entitlement;
pub mod handler;
pub mod lifecycle;
pub mod persistence;
pub mod registry;
pub mod service;
pub mod store;

pub use content_index::ContentAssociationIndex;
pub use entitlement::{EntitlementCache, FixedEntitlementProvider};
pub use handler::{ClientGuard, ConversationHandle, ConversationHandler, ConversationObserver, RequestGuard};
pub use lifecycle::LifecycleCoordinator;
pub use registry::HandlerRegistry;
pub use service::{ConversationService, ServiceEvent};
pub use store::{ConversationStore, LoadOutcome};
