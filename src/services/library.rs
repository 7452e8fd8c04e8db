use crate::core::io::Storage;
use crate::core::state::{GenerationState, StoryState};
use crate::core::story::{ImageData, StoryForm, StoryPage};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SavedStory {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub request: StoryForm,
    pub pages: Vec<StoryPage>,
    pub cover_image: Option<ImageData>,
}

impl SavedStory {
    pub fn from_state(state: &GenerationState, request: &StoryForm) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: state.title.clone(),
            created_at: Utc::now(),
            request: request.clone(),
            pages: state.pages.clone(),
            cover_image: state.cover_image.clone(),
        }
    }

    /// Puts this story back into the state container, e.g. to edit or export it.
    pub fn open_in(&self, state: &mut StoryState) {
        state.load(&self.title, self.cover_image.clone(), self.pages.clone());
    }
}

/// Listing entry without the heavy page and image payloads.
#[derive(Clone, Debug, PartialEq)]
pub struct StorySummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A user's saved stories, one JSON record per story.
pub struct StoryLibrary {
    storage: Arc<dyn Storage>,
    folder: String,
}

impl StoryLibrary {
    pub fn new(storage: Arc<dyn Storage>, folder: impl Into<String>) -> Self {
        Self {
            storage,
            folder: folder.into(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}/{}.json", self.folder, id)
    }

    pub async fn save(&self, story: &SavedStory) -> Result<()> {
        let content = serde_json::to_string_pretty(story)?;
        self.storage
            .write(&self.key(&story.id), content.as_bytes())
            .await
            .with_context(|| format!("Failed to save story {}", story.id))?;
        info!("Saved story \"{}\" ({})", story.title, story.id);
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<SavedStory> {
        let bytes = self
            .storage
            .read(&self.key(id))
            .await
            .with_context(|| format!("Story {} not found", id))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Story {} is corrupted", id))
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.storage.delete(&self.key(id)).await?;
        info!("Deleted story {}", id);
        Ok(())
    }

    /// All readable stories, newest first. Unreadable records are skipped.
    pub async fn list(&self) -> Result<Vec<StorySummary>> {
        let mut summaries = Vec::new();
        for key in self.storage.list(&self.folder).await? {
            if !key.ends_with(".json") {
                continue;
            }
            let bytes = self.storage.read(&key).await?;
            match serde_json::from_slice::<SavedStory>(&bytes) {
                Ok(story) => summaries.push(StorySummary {
                    id: story.id,
                    title: story.title,
                    created_at: story.created_at,
                }),
                Err(e) => warn!("Skipping unreadable story record {}: {}", key, e),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::SharedStory;
    use chrono::Duration;

    fn story(title: &str, minutes_ago: i64) -> SavedStory {
        SavedStory {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: Utc::now() - Duration::minutes(minutes_ago),
            request: StoryForm {
                child_name: "Noah".to_string(),
                ..Default::default()
            },
            pages: vec![StoryPage {
                page_text: "Noah waits.".to_string(),
                action_and_emotion: "standing calmly".to_string(),
                image_prompt: Some("prompt".to_string()),
                image: Some(ImageData::new("image/jpeg", vec![1, 2])),
            }],
            cover_image: None,
        }
    }

    #[tokio::test]
    async fn test_save_list_load_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let library = StoryLibrary::new(Arc::new(NativeStorage::new(dir.path())), "library");

        let older = story("Older", 30);
        let newer = story("Newer", 1);
        library.save(&older).await?;
        library.save(&newer).await?;

        let listed = library.list().await?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "Newer");
        assert_eq!(listed[1].title, "Older");

        let loaded = library.load(&older.id).await?;
        assert_eq!(loaded, older);

        library.delete(&older.id).await?;
        let listed = library.list().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, newer.id);
        assert!(library.load(&older.id).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_records_are_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(NativeStorage::new(dir.path()));
        storage.write("library/broken.json", b"not json").await?;

        let library = StoryLibrary::new(storage, "library");
        library.save(&story("Fine", 0)).await?;

        let listed = library.list().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Fine");
        Ok(())
    }

    #[test]
    fn test_round_trip_through_state() {
        let saved = story("Reopened", 0);
        let mut state = StoryState::new();
        saved.open_in(&mut state);

        let snap = state.snapshot();
        assert_eq!(snap.title, "Reopened");
        assert_eq!(snap.pages, saved.pages);

        let again = SavedStory::from_state(&snap, &saved.request);
        assert_ne!(again.id, saved.id);
        assert_eq!(again.pages, saved.pages);
        assert_eq!(again.request.child_name, "Noah");
    }

    #[test]
    fn test_reopening_and_editing_queues_no_updates() {
        let saved = story("Reopened", 0);
        let (state, mut rx) = StoryState::with_updates();
        let shared = SharedStory::new(state);

        for _ in 0..10 {
            shared.start_over();
            shared.edit(|s| saved.open_in(s));
            shared.edit(|s| s.edit_page_text(0, "Noah waits patiently."));
        }

        assert_eq!(shared.snapshot().pages[0].page_text, "Noah waits patiently.");
        assert!(rx.try_recv().is_err());
    }
}
