//! Terminal front end: collects the form, shows progress, and lets the user
//! review, edit, save and export stories.

use crate::core::config::Config;
use crate::core::error::StoryError;
use crate::core::io::Storage;
use crate::core::state::{GenerationState, SharedStory};
use crate::core::story::{Gender, ImageData, StoryForm};
use crate::services::export::{export_file_name, export_pages, DocumentRenderer, FolderRenderer};
use crate::services::library::{SavedStory, StoryLibrary};
use crate::services::workflow::StoryWorkflow;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select, Text};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Clone, Copy)]
enum MenuItem {
    NewStory,
    OpenStory,
    DeleteStory,
    Quit,
}

impl fmt::Display for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MenuItem::NewStory => "New story",
            MenuItem::OpenStory => "Open a saved story",
            MenuItem::DeleteStory => "Delete a saved story",
            MenuItem::Quit => "Quit",
        };
        f.write_str(s)
    }
}

pub struct App {
    config: Config,
    workflow: StoryWorkflow,
    story: SharedStory,
    updates: UnboundedReceiver<GenerationState>,
    library: StoryLibrary,
    renderer: Box<dyn DocumentRenderer>,
}

impl App {
    pub fn new(
        config: Config,
        workflow: StoryWorkflow,
        story: SharedStory,
        updates: UnboundedReceiver<GenerationState>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let library = StoryLibrary::new(storage.clone(), config.library_folder.clone());
        let renderer = Box::new(FolderRenderer::new(storage, config.output_folder.clone()));
        Self {
            config,
            workflow,
            story,
            updates,
            library,
            renderer,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            let items = vec![
                MenuItem::NewStory,
                MenuItem::OpenStory,
                MenuItem::DeleteStory,
                MenuItem::Quit,
            ];
            match Select::new("What would you like to do?", items).prompt()? {
                MenuItem::NewStory => self.new_story().await?,
                MenuItem::OpenStory => self.open_story().await?,
                MenuItem::DeleteStory => self.delete_story().await?,
                MenuItem::Quit => break,
            }
        }
        Ok(())
    }

    async fn new_story(&mut self) -> Result<()> {
        self.story.start_over();
        let form = collect_form()?;
        if self.generate(&form).await.is_err() {
            print_error(&self.story.snapshot());
            return Ok(());
        }

        self.review().await?;
        let saved = SavedStory::from_state(&self.story.snapshot(), &form);
        if self.confirm("Save this story to your library?")? {
            self.library.save(&saved).await?;
        }
        self.offer_export(&form.child_name).await
    }

    /// Runs the workflow while mirroring its progress on a spinner.
    async fn generate(&mut self, form: &StoryForm) -> Result<(), StoryError> {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));

        let run = self.workflow.submit(form, &self.story);
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(snapshot) = self.updates.recv() => {
                    if !snapshot.progress.is_empty() {
                        pb.set_message(snapshot.progress);
                    }
                }
            }
        };
        while self.updates.try_recv().is_ok() {}

        pb.finish_and_clear();
        result
    }

    async fn review(&mut self) -> Result<()> {
        loop {
            let state = self.story.snapshot();
            print_story(&state);
            if state.pages.is_empty() || !self.confirm_default("Edit the text of a page?", false)? {
                return Ok(());
            }

            let choices: Vec<String> = state
                .pages
                .iter()
                .enumerate()
                .map(|(i, p)| format!("{}. {}", i + 1, p.page_text))
                .collect();
            let picked = Select::new("Which page?", choices.clone()).prompt()?;
            let index = choices.iter().position(|c| *c == picked).unwrap_or_default();
            let text = Text::new("New text:")
                .with_initial_value(&state.pages[index].page_text)
                .prompt()?;
            self.story.edit(|s| s.edit_page_text(index, text));
        }
    }

    async fn offer_export(&mut self, child_name: &str) -> Result<()> {
        if !self.confirm("Export this story?")? {
            return Ok(());
        }
        let state = self.story.snapshot();
        let file_name = export_file_name(&state.title, child_name);
        let location = self.renderer.render(&export_pages(&state, child_name), &file_name).await?;
        println!("Story exported to {}", location);
        Ok(())
    }

    async fn open_story(&mut self) -> Result<()> {
        let Some(saved) = self.pick_saved("Open which story?").await? else {
            return Ok(());
        };
        self.story.start_over();
        self.story.edit(|s| saved.open_in(s));

        self.review().await?;
        let mut updated = SavedStory::from_state(&self.story.snapshot(), &saved.request);
        updated.id = saved.id.clone();
        updated.created_at = saved.created_at;
        if updated != saved && self.confirm("Save your changes?")? {
            self.library.save(&updated).await?;
        }
        self.offer_export(&saved.request.child_name).await
    }

    async fn delete_story(&mut self) -> Result<()> {
        let Some(saved) = self.pick_saved("Delete which story?").await? else {
            return Ok(());
        };
        if Confirm::new(&format!("Delete \"{}\"?", saved.title))
            .with_default(false)
            .prompt()?
        {
            self.library.delete(&saved.id).await?;
        }
        Ok(())
    }

    async fn pick_saved(&self, message: &str) -> Result<Option<SavedStory>> {
        let summaries = self.library.list().await?;
        if summaries.is_empty() {
            println!("You haven't created any stories yet.");
            return Ok(None);
        }
        let labels: Vec<String> = summaries
            .iter()
            .map(|s| format!("{} (created {})", s.title, s.created_at.format("%Y-%m-%d")))
            .collect();
        let picked = Select::new(message, labels.clone()).prompt()?;
        let index = labels.iter().position(|l| *l == picked).unwrap_or_default();
        Ok(Some(self.library.load(&summaries[index].id).await?))
    }

    fn confirm(&self, message: &str) -> Result<bool> {
        self.confirm_default(message, true)
    }

    fn confirm_default(&self, message: &str, default: bool) -> Result<bool> {
        if self.config.unattended {
            return Ok(default);
        }
        Ok(Confirm::new(message).with_default(default).prompt()?)
    }
}

fn collect_form() -> Result<StoryForm> {
    let child_name = Text::new("Child's name:").prompt()?;
    let child_age = Text::new("Child's age:").prompt()?;
    let child_gender = Select::new("Gender:", Gender::ALL.to_vec()).prompt()?.to_string();

    let photo_path = Text::new("Path to a photo of the child:").prompt()?;
    let uploaded_image = if photo_path.trim().is_empty() {
        None
    } else {
        match ImageData::from_path(Path::new(photo_path.trim())) {
            Ok(image) => Some(image.to_data_url()),
            Err(e) => {
                println!("Could not load photo: {:#}", e);
                None
            }
        }
    };

    let social_concept = Text::new("Concept to learn (e.g. sharing, waiting):").prompt()?;
    let situation = Text::new("Describe the challenging situation:").prompt()?;

    Ok(StoryForm {
        child_name,
        child_age,
        child_gender,
        uploaded_image,
        social_concept,
        situation,
    })
}

fn print_error(state: &GenerationState) {
    if let Some(error) = &state.error {
        println!("Error: {}", error);
    }
}

fn print_story(state: &GenerationState) {
    println!();
    println!("=== {} ===", state.title);
    let cover = if state.cover_image.is_some() { "ready" } else { "missing" };
    println!("Cover image: {}", cover);
    for (i, page) in state.pages.iter().enumerate() {
        let image = if page.image.is_some() { "" } else { " [no image]" };
        println!("{:>2}. {}{}", i + 1, page.page_text, image);
    }
    println!();
}
