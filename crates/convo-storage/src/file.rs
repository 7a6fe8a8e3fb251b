use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convo_core::{
    in_range, ConversationArchive, ConversationMetadata, ConversationTurn, ConvoError,
    PersistenceGateway, Result,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const META_SUFFIX: &str = ".meta.json";
const ENTRIES_SUFFIX: &str = ".jsonl";

/// File-based conversation storage.
///
/// Each conversation is a `<uuid>.meta.json` document plus a `<uuid>.jsonl`
/// log holding one [`ConversationTurn`] per line.
pub struct FileGateway {
    base_dir: PathBuf,
}

impl FileGateway {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        debug!("FileGateway initialized: base_dir={:?}", base_dir);
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn meta_path(&self, uuid: &str) -> Result<PathBuf> {
        Ok(self.base_dir.join(format!("{}{}", checked_id(uuid)?, META_SUFFIX)))
    }

    fn entries_path(&self, uuid: &str) -> Result<PathBuf> {
        Ok(self.base_dir.join(format!("{}{}", checked_id(uuid)?, ENTRIES_SUFFIX)))
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    async fn read_metadata(path: &Path) -> Result<Option<ConversationMetadata>> {
        match fs::read_to_string(path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_entries(&self, uuid: &str) -> Result<Vec<ConversationTurn>> {
        let path = self.entries_path(uuid)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ConvoError::from))
            .collect()
    }

    async fn write_entries(&self, uuid: &str, entries: &[ConversationTurn]) -> Result<()> {
        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(entry)?);
            body.push('\n');
        }
        write_atomic(&self.entries_path(uuid)?, body.as_bytes()).await
    }

    async fn stored_ids(&self) -> Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl PersistenceGateway for FileGateway {
    async fn load_all_metadata(&self) -> Result<Vec<ConversationMetadata>> {
        let mut conversations = Vec::new();
        for id in self.stored_ids().await? {
            let path = self.meta_path(&id)?;
            match Self::read_metadata(&path).await {
                Ok(Some(meta)) => conversations.push(meta),
                Ok(None) => {}
                // One unreadable record should not hide the rest of the history
                Err(e) => warn!("Skipping unreadable conversation metadata {:?}: {}", path, e),
            }
        }

        debug!("Loaded metadata for {} conversations", conversations.len());
        Ok(conversations)
    }

    async fn load_archive(&self, uuid: &str) -> Result<Option<ConversationArchive>> {
        if Self::read_metadata(&self.meta_path(uuid)?).await?.is_none() {
            return Ok(None);
        }
        let entries = self.read_entries(uuid).await?;
        Ok(Some(ConversationArchive { entries }))
    }

    async fn save_metadata(&self, metadata: &ConversationMetadata) -> Result<()> {
        self.ensure_dir().await?;
        let json = serde_json::to_string_pretty(metadata)?;
        write_atomic(&self.meta_path(&metadata.uuid)?, json.as_bytes()).await?;

        debug!("Saved metadata for conversation {}", metadata.uuid);
        Ok(())
    }

    async fn append_entry(&self, uuid: &str, entry: &ConversationTurn) -> Result<()> {
        self.ensure_dir().await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.entries_path(uuid)?)
            .await?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!("Appended entry {} to conversation {}", entry.uuid, uuid);
        Ok(())
    }

    async fn delete_entry(&self, uuid: &str, entry_uuid: &str) -> Result<()> {
        let mut entries = self.read_entries(uuid).await?;
        let before = entries.len();
        entries.retain(|e| e.uuid != entry_uuid);
        if entries.len() != before {
            self.write_entries(uuid, &entries).await?;
        }
        Ok(())
    }

    async fn delete_conversation(&self, uuid: &str) -> Result<()> {
        for path in [self.entries_path(uuid)?, self.meta_path(uuid)?] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("Deleted conversation {}", uuid);
        Ok(())
    }

    async fn delete_range(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let doomed: Vec<String> = self
            .load_all_metadata()
            .await?
            .into_iter()
            .filter(|meta| meta.updated_within(begin, end))
            .map(|meta| meta.uuid)
            .collect();

        for uuid in &doomed {
            self.delete_conversation(uuid).await?;
        }

        info!("Deleted {} conversations in range", doomed.len());
        Ok(())
    }

    async fn delete_associated_content(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        for uuid in self.stored_ids().await? {
            let mut entries = self.read_entries(&uuid).await?;
            let mut touched = false;
            for entry in entries.iter_mut() {
                if entry.page_context.is_some() && in_range(entry.created_at, begin, end) {
                    entry.page_context = None;
                    touched = true;
                }
            }
            if touched {
                self.write_entries(&uuid, &entries).await?;
                debug!("Stripped page context from conversation {}", uuid);
            }
        }
        Ok(())
    }
}

/// Rejects identifiers that could escape the storage directory.
fn checked_id(uuid: &str) -> Result<&str> {
    let valid = !uuid.is_empty()
        && uuid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(uuid)
    } else {
        Err(ConvoError::Storage(format!("invalid conversation id '{}'", uuid)))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use convo_core::ContentSnapshot;
    use tempfile::TempDir;

    fn persisted(title: &str) -> ConversationMetadata {
        let mut meta = ConversationMetadata::new(Some("test-model".into())).with_title(title);
        meta.has_content = true;
        meta
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = FileGateway::new(temp_dir.path().join("conversations"));

        // Missing directory reads as empty history
        assert!(gateway.load_all_metadata().await.unwrap().is_empty());

        let meta = persisted("Chat 1");
        gateway.save_metadata(&meta).await.unwrap();
        gateway
            .append_entry(&meta.uuid, &ConversationTurn::human("hello"))
            .await
            .unwrap();
        gateway
            .append_entry(&meta.uuid, &ConversationTurn::assistant("hi"))
            .await
            .unwrap();

        let all = gateway.load_all_metadata().await.unwrap();
        assert_eq!(all, vec![meta.clone()]);

        let archive = gateway.load_archive(&meta.uuid).await.unwrap().unwrap();
        assert_eq!(archive.entries.len(), 2);
        assert_eq!(archive.entries[0].text, "hello");

        assert!(gateway.load_archive("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_entry_and_conversation() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = FileGateway::new(temp_dir.path());

        let meta = persisted("Chat");
        let first = ConversationTurn::human("one");
        let second = ConversationTurn::human("two");
        gateway.save_metadata(&meta).await.unwrap();
        gateway.append_entry(&meta.uuid, &first).await.unwrap();
        gateway.append_entry(&meta.uuid, &second).await.unwrap();

        gateway.delete_entry(&meta.uuid, &first.uuid).await.unwrap();
        let archive = gateway.load_archive(&meta.uuid).await.unwrap().unwrap();
        assert_eq!(archive.entries, vec![second]);

        gateway.delete_conversation(&meta.uuid).await.unwrap();
        assert!(gateway.load_archive(&meta.uuid).await.unwrap().is_none());
        assert!(!temp_dir.path().join(format!("{}.jsonl", meta.uuid)).exists());

        // Deleting twice is harmless
        gateway.delete_conversation(&meta.uuid).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_range_only_touches_matching_conversations() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = FileGateway::new(temp_dir.path());

        let mut old = persisted("old");
        old.updated_at = Utc::now() - Duration::days(10);
        let recent = persisted("recent");
        gateway.save_metadata(&old).await.unwrap();
        gateway.save_metadata(&recent).await.unwrap();

        gateway
            .delete_range(None, Some(Utc::now() - Duration::days(1)))
            .await
            .unwrap();

        let remaining = gateway.load_all_metadata().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].uuid, recent.uuid);
    }

    #[tokio::test]
    async fn test_delete_associated_content_strips_page_context() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = FileGateway::new(temp_dir.path());

        let meta = persisted("with page");
        let mut turn = ConversationTurn::human("summarize this");
        turn.page_context = Some(ContentSnapshot {
            url: "https://example.com".into(),
            title: "Example".into(),
        });
        gateway.save_metadata(&meta).await.unwrap();
        gateway.append_entry(&meta.uuid, &turn).await.unwrap();

        gateway.delete_associated_content(None, None).await.unwrap();

        let archive = gateway.load_archive(&meta.uuid).await.unwrap().unwrap();
        assert_eq!(archive.entries[0].text, "summarize this");
        assert!(archive.entries[0].page_context.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = FileGateway::new(temp_dir.path());

        let meta = persisted("fine");
        gateway.save_metadata(&meta).await.unwrap();
        std::fs::write(temp_dir.path().join("broken.meta.json"), "{not json").unwrap();

        let all = gateway.load_all_metadata().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        assert!(checked_id("../etc/passwd").is_err());
        assert!(checked_id("").is_err());
        assert!(checked_id("4f1c-aa_b").is_ok());
    }
}
