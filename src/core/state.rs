use crate::core::story::{ImageData, StoryOutline, StoryPage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Serialize, Deserialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
}

/// Everything the presentation layer needs to draw the current story.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct GenerationState {
    pub status: RunStatus,
    pub progress: String,
    pub error: Option<String>,
    pub title: String,
    pub cover_image: Option<ImageData>,
    pub pages: Vec<StoryPage>,
}

impl GenerationState {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// Partial update for one page. `None` fields leave the page untouched.
#[derive(Default, Clone, Debug)]
pub struct PagePatch {
    pub page_text: Option<String>,
    pub image: Option<ImageData>,
    pub image_prompt: Option<String>,
}

/// State container with a small set of total transitions.
///
/// Every transition during a run publishes a snapshot to the optional update
/// channel, so an observer sees the whole run as a stream of states.
#[derive(Debug, Default)]
pub struct StoryState {
    current: GenerationState,
    updates: Option<mpsc::UnboundedSender<GenerationState>>,
}

impl StoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_updates() -> (Self, mpsc::UnboundedReceiver<GenerationState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                current: GenerationState::default(),
                updates: Some(tx),
            },
            rx,
        )
    }

    pub fn snapshot(&self) -> GenerationState {
        self.current.clone()
    }

    pub fn reset(&mut self) {
        self.transition(|current| *current = GenerationState::default());
    }

    /// Clears any previous story and marks a run as in progress.
    pub fn begin(&mut self) {
        self.transition(|current| {
            *current = GenerationState {
                status: RunStatus::Running,
                ..GenerationState::default()
            }
        });
    }

    pub fn apply_outline(&mut self, outline: &StoryOutline) {
        self.transition(|current| {
            current.title = outline.title.clone();
            current.pages = outline.pages.iter().cloned().map(StoryPage::from).collect();
        });
    }

    pub fn apply_cover_image(&mut self, image: ImageData) {
        self.transition(|current| current.cover_image = Some(image));
    }

    /// Replaces fields of the page at `index`. Indices past the end are ignored.
    pub fn apply_page_update(&mut self, index: usize, patch: PagePatch) {
        if index >= self.current.pages.len() {
            warn!(
                "Ignoring update for page {} (story has {} pages)",
                index,
                self.current.pages.len()
            );
            return;
        }
        self.transition(|current| {
            let page = &mut current.pages[index];
            if let Some(text) = patch.page_text {
                page.page_text = text;
            }
            if let Some(image) = patch.image {
                page.image = Some(image);
            }
            if let Some(prompt) = patch.image_prompt {
                page.image_prompt = Some(prompt);
            }
        });
    }

    pub fn edit_page_text(&mut self, index: usize, text: impl Into<String>) {
        self.apply_page_update(
            index,
            PagePatch {
                page_text: Some(text.into()),
                ..Default::default()
            },
        );
    }

    pub fn set_progress(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.transition(|current| current.progress = message);
    }

    /// Terminal failure: stops the run and clears the progress line.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.transition(|current| {
            current.error = Some(message);
            current.status = RunStatus::Idle;
            current.progress.clear();
        });
    }

    pub fn finish(&mut self) {
        self.transition(|current| {
            current.status = RunStatus::Idle;
            current.progress.clear();
        });
    }

    /// Replaces the whole story with a previously saved one.
    pub fn load(&mut self, title: &str, cover_image: Option<ImageData>, pages: Vec<StoryPage>) {
        self.transition(|current| {
            *current = GenerationState {
                title: title.to_string(),
                cover_image,
                pages,
                ..GenerationState::default()
            }
        });
    }

    /// Applies `f` and publishes the result if a run was active before or after it.
    /// Changes made while idle (reopening, editing) are not streamed.
    fn transition(&mut self, f: impl FnOnce(&mut GenerationState)) {
        let was_running = self.current.is_running();
        f(&mut self.current);
        if !(was_running || self.current.is_running()) {
            return;
        }
        if let Some(tx) = &self.updates {
            // A dropped receiver just means nobody is watching any more.
            let _ = tx.send(self.current.clone());
        }
    }
}

/// Identifies one run. Updates carrying a stale token are discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunToken(u64);

#[derive(Debug)]
struct Shared {
    generation: u64,
    state: StoryState,
}

/// Cloneable handle to the single story container shared between the
/// workflow and the presentation layer.
#[derive(Clone, Debug)]
pub struct SharedStory {
    inner: Arc<Mutex<Shared>>,
}

impl SharedStory {
    pub fn new(state: StoryState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Shared {
                generation: 0,
                state,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // Transitions never panic mid-update, so a poisoned lock still holds a consistent state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts a new run, superseding any run still in flight.
    pub fn start_run(&self) -> RunToken {
        let mut shared = self.lock();
        shared.generation += 1;
        shared.state.begin();
        RunToken(shared.generation)
    }

    /// Discards the current story. Late results from the previous run are dropped.
    pub fn start_over(&self) {
        let mut shared = self.lock();
        shared.generation += 1;
        shared.state.reset();
    }

    /// Applies `f` if `token` still names the current run. Returns whether it was applied.
    pub fn update(&self, token: RunToken, f: impl FnOnce(&mut StoryState)) -> bool {
        let mut shared = self.lock();
        if shared.generation != token.0 {
            debug!(
                "Dropping update from superseded run {} (current {})",
                token.0, shared.generation
            );
            return false;
        }
        f(&mut shared.state);
        true
    }

    /// Applies `f` regardless of which run is active, e.g. user edits.
    pub fn edit(&self, f: impl FnOnce(&mut StoryState)) {
        f(&mut self.lock().state);
    }

    pub fn snapshot(&self) -> GenerationState {
        self.lock().state.snapshot()
    }
}

impl Default for SharedStory {
    fn default() -> Self {
        Self::new(StoryState::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::story::PageDraft;

    fn outline(pages: usize) -> StoryOutline {
        StoryOutline {
            title: "Sam Waits".to_string(),
            cover_page_description: "Sam at the slide".to_string(),
            setting_description: "A sunny park".to_string(),
            key_objects: vec!["a red slide".to_string()],
            pages: (0..pages)
                .map(|i| PageDraft {
                    page_text: format!("Page {}", i),
                    action_and_emotion: format!("pose {}", i),
                })
                .collect(),
        }
    }

    #[test]
    fn test_outline_then_page_updates_replace_in_place() {
        let mut state = StoryState::new();
        state.begin();
        state.apply_outline(&outline(3));

        state.apply_page_update(
            2,
            PagePatch {
                image: Some(ImageData::new("image/jpeg", vec![2])),
                image_prompt: Some("prompt 2".to_string()),
                ..Default::default()
            },
        );
        state.apply_page_update(
            0,
            PagePatch {
                image: Some(ImageData::new("image/jpeg", vec![0])),
                ..Default::default()
            },
        );

        let snap = state.snapshot();
        assert_eq!(snap.title, "Sam Waits");
        assert_eq!(snap.pages.len(), 3);
        assert_eq!(snap.pages[0].image.as_ref().unwrap().bytes, vec![0]);
        assert!(snap.pages[1].image.is_none());
        assert_eq!(snap.pages[2].image_prompt.as_deref(), Some("prompt 2"));
        assert_eq!(snap.pages[2].page_text, "Page 2");
    }

    #[test]
    fn test_out_of_range_update_is_ignored() {
        let mut state = StoryState::new();
        state.apply_outline(&outline(1));
        state.edit_page_text(5, "nope");
        assert_eq!(state.snapshot().pages.len(), 1);
        assert_eq!(state.snapshot().pages[0].page_text, "Page 0");
    }

    #[test]
    fn test_error_clears_progress_and_stops() {
        let mut state = StoryState::new();
        state.begin();
        state.set_progress("Analyzing character photo...");
        assert!(state.snapshot().is_running());

        state.set_error("The AI failed to analyze the image.");
        let snap = state.snapshot();
        assert!(!snap.is_running());
        assert!(snap.progress.is_empty());
        assert_eq!(snap.error.as_deref(), Some("The AI failed to analyze the image."));

        state.reset();
        assert_eq!(state.snapshot(), GenerationState::default());
    }

    #[test]
    fn test_updates_are_published() {
        let (mut state, mut rx) = StoryState::with_updates();
        state.begin();
        state.set_progress("one");
        state.finish();

        let mut seen = Vec::new();
        while let Ok(snap) = rx.try_recv() {
            seen.push(snap);
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[0].is_running());
        assert_eq!(seen[1].progress, "one");
        assert!(!seen[2].is_running());
    }

    #[test]
    fn test_idle_changes_are_not_published() {
        let (mut state, mut rx) = StoryState::with_updates();
        state.load("Sam Waits", None, Vec::new());
        state.apply_outline(&outline(2));
        state.edit_page_text(0, "Sam waits his turn.");
        state.reset();
        assert!(rx.try_recv().is_err());

        // The snapshot that ends a run is still delivered.
        state.begin();
        state.finish();
        assert!(rx.try_recv().unwrap().is_running());
        assert!(!rx.try_recv().unwrap().is_running());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_run_updates_are_dropped() {
        let story = SharedStory::default();
        let first = story.start_run();
        assert!(story.update(first, |s| s.apply_outline(&outline(2))));

        story.start_over();
        assert!(!story.update(first, |s| s.set_progress("late")));
        assert_eq!(story.snapshot(), GenerationState::default());

        let second = story.start_run();
        assert!(story.update(second, |s| s.set_progress("fresh")));
        assert_eq!(story.snapshot().progress, "fresh");
    }
}
