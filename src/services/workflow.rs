use crate::core::error::StoryError;
use crate::core::state::{PagePatch, RunToken, SharedStory};
use crate::core::story::{CharacterDescription, ImageData, StoryForm, StoryOutline, StoryRequest};
use crate::services::llm::GenerativeService;
use crate::services::prompt;
use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Turns a validated request into an illustrated story, step by step,
/// publishing every intermediate state into a [`SharedStory`].
pub struct StoryWorkflow {
    service: Arc<dyn GenerativeService>,
}

impl StoryWorkflow {
    pub fn new(service: Arc<dyn GenerativeService>) -> Self {
        Self { service }
    }

    /// Validates `form` and runs it. A validation failure is stored in the
    /// state like any other failure and no service is called.
    pub async fn submit(&self, form: &StoryForm, story: &SharedStory) -> Result<(), StoryError> {
        match StoryRequest::try_from(form) {
            Ok(request) => self.run(&request, story).await,
            Err(e) => {
                warn!("Rejected story request: {}", e);
                story.start_over();
                story.edit(|s| s.set_error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Runs one generation. Any previous run on `story` is superseded.
    ///
    /// On a fatal failure the error's user-facing message is also stored in
    /// the state; page image failures are not fatal.
    pub async fn run(&self, request: &StoryRequest, story: &SharedStory) -> Result<(), StoryError> {
        let token = story.start_run();
        let result = self.generate(request, story, token).await;

        story.update(token, |s| match &result {
            Ok(()) => s.finish(),
            Err(e) => s.set_error(e.to_string()),
        });
        result
    }

    async fn generate(&self, request: &StoryRequest, story: &SharedStory, token: RunToken) -> Result<(), StoryError> {
        story.update(token, |s| s.set_progress("Analyzing character photo..."));
        let character = self.describe(&request.photo).await?;

        story.update(token, |s| {
            s.set_progress(format!("Crafting story for {}...", request.child_name))
        });
        let outline = self.outline(request).await?;
        story.update(token, |s| s.apply_outline(&outline));

        story.update(token, |s| s.set_progress("Creating a beautiful cover page..."));
        let cover_prompt = prompt::cover_prompt(&outline, &character);
        let cover = self.service.generate_image(&cover_prompt).await.map_err(|e| {
            error!("Cover image generation failed: {:#}", e);
            StoryError::Image
        })?;
        story.update(token, |s| s.apply_cover_image(cover));

        story.update(token, |s| s.set_progress("Bringing the story to life..."));
        self.illustrate_pages(&outline, &character, story, token).await;

        info!("Story \"{}\" generated with {} pages", outline.title, outline.pages.len());
        Ok(())
    }

    async fn describe(&self, photo: &ImageData) -> Result<CharacterDescription, StoryError> {
        let text = self
            .service
            .describe_image(photo, prompt::DESCRIPTION_INSTRUCTIONS)
            .await
            .map_err(|e| {
                error!("Character description failed: {:#}", e);
                StoryError::Description
            })?;
        Ok(CharacterDescription(text.trim().to_string()))
    }

    async fn outline(&self, request: &StoryRequest) -> Result<StoryOutline, StoryError> {
        let system = prompt::system_instruction(request);
        let user = prompt::story_prompt(request);
        let schema = prompt::outline_schema(request);

        let outline: Result<StoryOutline> = async {
            let value = self.service.generate_structured(&system, &user, &schema).await?;
            prompt::parse_outline(value, request.age_band())
        }
        .await;
        outline.map_err(|e| {
            error!("Story outline generation failed: {:#}", e);
            StoryError::Outline
        })
    }

    /// Submits every page image at once, then applies the results in page
    /// order so the "image i of N" counter only moves forward.
    async fn illustrate_pages(
        &self,
        outline: &StoryOutline,
        character: &CharacterDescription,
        story: &SharedStory,
        token: RunToken,
    ) {
        let total = outline.pages.len();

        let pending: Vec<(String, JoinHandle<Result<ImageData>>)> = outline
            .pages
            .iter()
            .map(|page| {
                let image_prompt = prompt::page_prompt(page, outline, character);
                let service = Arc::clone(&self.service);
                let task_prompt = image_prompt.clone();
                let handle = tokio::spawn(async move { service.generate_image(&task_prompt).await });
                (image_prompt, handle)
            })
            .collect();

        for (index, (image_prompt, handle)) in pending.into_iter().enumerate() {
            story.update(token, |s| {
                s.set_progress(format!("Generating image {} of {}...", index + 1, total))
            });

            let image = match handle.await {
                Ok(Ok(image)) => Some(image),
                Ok(Err(e)) => {
                    warn!("Failed to generate image for page {}: {:#}", index + 1, e);
                    None
                }
                Err(e) => {
                    warn!("Image task for page {} did not complete: {}", index + 1, e);
                    None
                }
            };

            story.update(token, |s| {
                s.apply_page_update(
                    index,
                    PagePatch {
                        image,
                        image_prompt: Some(image_prompt),
                        ..Default::default()
                    },
                )
            });
        }
    }
}
