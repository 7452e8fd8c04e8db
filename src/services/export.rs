use crate::core::io::Storage;
use crate::core::state::GenerationState;
use crate::core::story::ImageData;
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::Serialize;
use std::sync::Arc;

/// One page of the exported document.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportPage {
    pub image: Option<ImageData>,
    pub text: String,
    pub prompt: Option<String>,
    /// "By <name>" line, only set on the cover.
    pub byline: Option<String>,
}

impl ExportPage {
    pub fn is_cover(&self) -> bool {
        self.byline.is_some()
    }
}

/// Every story page in order, preceded by a cover page when the story has
/// both a title and a cover image.
pub fn export_pages(state: &GenerationState, child_name: &str) -> Vec<ExportPage> {
    let cover = match (&state.cover_image, state.title.trim()) {
        (Some(image), title) if !title.is_empty() => Some(ExportPage {
            image: Some(image.clone()),
            text: title.to_string(),
            prompt: None,
            byline: Some(format!("By {}", child_name.trim())),
        }),
        _ => None,
    };
    cover
        .into_iter()
        .chain(state.pages.iter().map(|page| ExportPage {
            image: page.image.clone(),
            text: page.page_text.clone(),
            prompt: page.image_prompt.clone(),
            byline: None,
        }))
        .collect()
}

/// Document name without extension: the title, else `<Name>_Story`, else `Social_Story`.
pub fn export_file_name(title: &str, child_name: &str) -> String {
    let title = title.trim();
    let child_name = child_name.trim();
    if !title.is_empty() {
        sanitize(title)
    } else if !child_name.is_empty() {
        format!("{}_Story", sanitize(child_name))
    } else {
        "Social_Story".to_string()
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Turns the exported page sequence into a document. Returns where it was written.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, pages: &[ExportPage], file_name: &str) -> Result<String>;
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    byline: Option<&'a str>,
    image: Option<String>,
    prompt: Option<&'a str>,
}

/// Writes each image to its own file plus a JSON manifest tying text to images.
pub struct FolderRenderer {
    storage: Arc<dyn Storage>,
    folder: String,
}

impl FolderRenderer {
    pub fn new(storage: Arc<dyn Storage>, folder: impl Into<String>) -> Self {
        Self {
            storage,
            folder: folder.into(),
        }
    }
}

#[async_trait]
impl DocumentRenderer for FolderRenderer {
    async fn render(&self, pages: &[ExportPage], file_name: &str) -> Result<String> {
        let dir = format!("{}/{}", self.folder, file_name);
        let mut manifest = Vec::with_capacity(pages.len());

        let mut page_number = 0;

        for page in pages {
            if !page.is_cover() {
                page_number += 1;
            }
            let image = match &page.image {
                Some(image) => {
                    let name = if page.is_cover() {
                        format!("cover.{}", image.extension())
                    } else {
                        format!("page_{:02}.{}", page_number, image.extension())
                    };
                    self.storage.write(&format!("{}/{}", dir, name), &image.bytes).await?;
                    Some(name)
                }
                None => None,
            };
            manifest.push(ManifestEntry {
                text: &page.text,
                byline: page.byline.as_deref(),
                image,
                prompt: page.prompt.as_deref(),
            });
        }

        let manifest_key = format!("{}/{}.json", dir, file_name);
        self.storage
            .write(&manifest_key, serde_json::to_string_pretty(&manifest)?.as_bytes())
            .await?;
        info!("Exported {} pages to {}", pages.len(), dir);
        Ok(dir)
    }
}
