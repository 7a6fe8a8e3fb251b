use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Cumulative token accounting for a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub trimmed: u64,
}

impl TokenUsage {
    /// Folds a newer report into this one. Counters never move backwards.
    pub fn record(&mut self, total: u64, trimmed: u64) -> bool {
        let next = TokenUsage {
            total: self.total.max(total),
            trimmed: self.trimmed.max(trimmed),
        };
        let changed = next != *self;
        *self = next;
        changed
    }
}

/// Lightweight, always-in-memory record describing one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub uuid: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
    /// False until the first entry has been persisted.
    #[serde(default)]
    pub has_content: bool,
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationMetadata {
    pub fn new(model_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4().to_string(),
            title: String::new(),
            model_key,
            has_content: false,
            token_usage: TokenUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Whether the last activity falls inside `[begin, end]`. Open bounds match everything.
    pub fn updated_within(&self, begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        in_range(self.updated_at, begin, end)
    }
}

pub fn in_range(at: DateTime<Utc>, begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    begin.map_or(true, |b| at >= b) && end.map_or(true, |e| at <= e)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Human,
    Assistant,
}

/// Page context captured from the associated content when a turn was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub url: String,
    pub title: String,
}

/// A single entry in a conversation's history (JSONL line on disk)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub uuid: String,
    pub role: TurnRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_context: Option<ContentSnapshot>,
}

impl ConversationTurn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            created_at: Utc::now(),
            page_context: None,
        }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Human, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, text)
    }
}

/// Full persisted detail of a conversation, loaded only when a handler is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationArchive {
    pub entries: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PremiumStatus {
    #[default]
    Unknown,
    Inactive,
    Active,
    ActiveDisconnected,
}

impl PremiumStatus {
    pub fn is_premium(self) -> bool {
        matches!(self, PremiumStatus::Active | PremiumStatus::ActiveDisconnected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumInfo {
    pub remaining_credential_count: u32,
    pub next_active_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug)]
pub enum ConvoError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to load conversations: {0}")]
    LoadFailed(String),

    #[error("Conversation load was cancelled by a reload")]
    LoadCancelled,

    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Conversation handler for '{0}' has been closed")]
    HandlerClosed(String),

    #[error("Conversation service has shut down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Entitlement check failed: {0}")]
    Entitlement(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConvoError>;

/// Durable storage of conversation metadata and detail.
///
/// Calls are single-shot and independently failable. The service drives all of
/// them from one sequence, so implementations need not order concurrent calls.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn load_all_metadata(&self) -> Result<Vec<ConversationMetadata>>;

    /// `Ok(None)` when nothing is stored for `uuid`.
    async fn load_archive(&self, uuid: &str) -> Result<Option<ConversationArchive>>;

    async fn save_metadata(&self, metadata: &ConversationMetadata) -> Result<()>;

    async fn append_entry(&self, uuid: &str, entry: &ConversationTurn) -> Result<()>;

    async fn delete_entry(&self, uuid: &str, entry_uuid: &str) -> Result<()>;

    async fn delete_conversation(&self, uuid: &str) -> Result<()>;

    /// Deletes conversations last updated inside the range. `None`/`None` wipes everything.
    async fn delete_range(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Removes captured page context from entries created inside the range.
    async fn delete_associated_content(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Ephemeral browsing context (e.g. a tab) that can be attached to a conversation.
///
/// The service only ever holds a `Weak` to this; liveness is the upgrade succeeding
/// and identity is pointer equality with the originally associated instance.
pub trait AssociatedContent: Send + Sync {
    /// Ephemeral identifier, reusable by unrelated content once this one is gone.
    fn content_id(&self) -> i32;
    fn url(&self) -> String;
    fn title(&self) -> String;
}

/// Source of subscription state. There is no push channel, callers poll.
#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    async fn fetch_premium_status(&self) -> Result<(PremiumStatus, Option<PremiumInfo>)>;
}
