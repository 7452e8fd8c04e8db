use crate::core::error::StoryError;
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Raw form input, exactly as the user typed it.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct StoryForm {
    pub child_name: String,
    pub child_age: String,
    pub child_gender: String,
    /// `data:<mime>;base64,<payload>`
    pub uploaded_image: Option<String>,
    pub social_concept: String,
    pub situation: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Boy,
    Girl,
    Child,
}

impl Gender {
    pub const ALL: [Gender; 3] = [Gender::Boy, Gender::Girl, Gender::Child];
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gender::Boy => "boy",
            Gender::Girl => "girl",
            Gender::Child => "child",
        };
        f.write_str(s)
    }
}

impl FromStr for Gender {
    type Err = StoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "boy" => Ok(Gender::Boy),
            "girl" => Ok(Gender::Girl),
            "child" | "neutral" => Ok(Gender::Child),
            other => Err(StoryError::validation(format!(
                "Unknown gender '{}'. Choose boy, girl or child.",
                other
            ))),
        }
    }
}

/// Binary image plus its MIME type. Serialized with a base64 payload.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageData {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn from_base64(mime_type: &str, data: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(data.trim())
            .context("Image payload is not valid base64")?;
        Ok(Self::new(mime_type, bytes))
    }

    pub fn from_data_url(url: &str) -> Result<Self> {
        let rest = url
            .trim()
            .strip_prefix("data:")
            .ok_or_else(|| anyhow!("Not a data URL"))?;
        let (mime_type, data) = rest
            .split_once(";base64,")
            .ok_or_else(|| anyhow!("Data URL is not base64 encoded"))?;
        if !mime_type.starts_with("image/") {
            anyhow::bail!("Data URL is not an image: {:?}", mime_type);
        }
        let image = Self::from_base64(mime_type, data)?;
        if image.bytes.is_empty() {
            anyhow::bail!("Data URL has an empty payload");
        }
        Ok(image)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let mime_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(mime_for_extension)
            .ok_or_else(|| anyhow!("Unsupported image type: {:?}", path))?;
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Self::new(mime_type, bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "bin",
        }
    }
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A form that passed validation. Constructing one is the only way into the workflow.
#[derive(Clone, Debug, PartialEq)]
pub struct StoryRequest {
    pub child_name: String,
    pub age: u32,
    pub gender: Gender,
    pub photo: ImageData,
    pub social_concept: String,
    pub situation: String,
}

impl StoryRequest {
    pub fn age_band(&self) -> AgeBand {
        AgeBand::from_age(self.age)
    }
}

impl TryFrom<&StoryForm> for StoryRequest {
    type Error = StoryError;

    fn try_from(form: &StoryForm) -> Result<Self, Self::Error> {
        let photo_url = form
            .uploaded_image
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| StoryError::validation("Please upload a photo of the main character."))?;
        let photo = ImageData::from_data_url(photo_url).map_err(|e| {
            log::debug!("Rejected photo: {:#}", e);
            StoryError::validation("Invalid image format.")
        })?;

        let fields = [
            &form.child_name,
            &form.child_age,
            &form.child_gender,
            &form.social_concept,
            &form.situation,
        ];
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err(StoryError::validation(
                "Missing required fields for story generation.",
            ));
        }

        let age = form.child_age.trim().parse::<u32>().map_err(|_| {
            StoryError::validation("Please enter the child's age as a whole number.")
        })?;
        let gender = form.child_gender.parse()?;

        Ok(Self {
            child_name: form.child_name.trim().to_string(),
            age,
            gender,
            photo,
            social_concept: form.social_concept.trim().to_string(),
            situation: form.situation.trim().to_string(),
        })
    }
}

impl TryFrom<StoryForm> for StoryRequest {
    type Error = StoryError;

    fn try_from(form: StoryForm) -> Result<Self, Self::Error> {
        StoryRequest::try_from(&form)
    }
}

/// Narrative band chosen from the child's age.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgeBand {
    Toddler,
    Preschool,
    SchoolAge,
}

impl AgeBand {
    pub fn from_age(age: u32) -> Self {
        match age {
            0..=3 => AgeBand::Toddler,
            4..=5 => AgeBand::Preschool,
            _ => AgeBand::SchoolAge,
        }
    }

    pub fn page_count(self) -> usize {
        match self {
            AgeBand::Toddler => 6,
            AgeBand::Preschool | AgeBand::SchoolAge => 8,
        }
    }
}

/// Visual-only "passport" reused in every illustration prompt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct CharacterDescription(pub String);

impl CharacterDescription {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageDraft {
    pub page_text: String,
    pub action_and_emotion: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryOutline {
    pub title: String,
    pub cover_page_description: String,
    pub setting_description: String,
    #[serde(default)]
    pub key_objects: Vec<String>,
    pub pages: Vec<PageDraft>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryPage {
    pub page_text: String,
    pub action_and_emotion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,
}

impl From<PageDraft> for StoryPage {
    fn from(draft: PageDraft) -> Self {
        Self {
            page_text: draft.page_text,
            action_and_emotion: draft.action_and_emotion,
            image_prompt: None,
            image: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_form() -> StoryForm {
        StoryForm {
            child_name: "Mia".to_string(),
            child_age: "4".to_string(),
            child_gender: "girl".to_string(),
            uploaded_image: Some("data:image/png;base64,AQID".to_string()),
            social_concept: "Sharing".to_string(),
            situation: "A friend takes her blocks".to_string(),
        }
    }

    #[test]
    fn test_valid_form_becomes_request() {
        let request = StoryRequest::try_from(valid_form()).unwrap();
        assert_eq!(request.child_name, "Mia");
        assert_eq!(request.age, 4);
        assert_eq!(request.gender, Gender::Girl);
        assert_eq!(request.photo.mime_type, "image/png");
        assert_eq!(request.photo.bytes, vec![1, 2, 3]);
        assert_eq!(request.age_band(), AgeBand::Preschool);
    }

    #[test]
    fn test_missing_photo_is_rejected_first() {
        let form = StoryForm {
            uploaded_image: None,
            child_name: String::new(),
            ..valid_form()
        };
        let err = StoryRequest::try_from(form).unwrap_err();
        assert_eq!(err.to_string(), "Please upload a photo of the main character.");
    }

    #[test]
    fn test_malformed_photo() {
        for bad in [
            "image/png;base64,AQID",
            "data:image/png,AQID",
            "data:;base64,AQID",
            "data:image/png;base64,@@@",
            "data:image/png;base64,",
            "data:text/plain;base64,AQID",
        ] {
            let form = StoryForm {
                uploaded_image: Some(bad.to_string()),
                ..valid_form()
            };
            let err = StoryRequest::try_from(form).unwrap_err();
            assert_eq!(err, StoryError::validation("Invalid image format."), "input: {}", bad);
        }
    }

    #[test]
    fn test_missing_fields() {
        let form = StoryForm {
            situation: "   ".to_string(),
            ..valid_form()
        };
        let err = StoryRequest::try_from(form).unwrap_err();
        assert_eq!(err.to_string(), "Missing required fields for story generation.");
    }

    #[test]
    fn test_bad_age_and_gender() {
        let form = StoryForm {
            child_age: "four".to_string(),
            ..valid_form()
        };
        assert!(matches!(StoryRequest::try_from(form), Err(StoryError::Validation(_))));

        let form = StoryForm {
            child_gender: "robot".to_string(),
            ..valid_form()
        };
        assert!(matches!(StoryRequest::try_from(form), Err(StoryError::Validation(_))));
    }

    #[test]
    fn test_age_bands() {
        assert_eq!(AgeBand::from_age(0).page_count(), 6);
        assert_eq!(AgeBand::from_age(3).page_count(), 6);
        assert_eq!(AgeBand::from_age(4), AgeBand::Preschool);
        assert_eq!(AgeBand::from_age(5).page_count(), 8);
        assert_eq!(AgeBand::from_age(6), AgeBand::SchoolAge);
        assert_eq!(AgeBand::from_age(12).page_count(), 8);
    }

    #[test]
    fn test_outline_parses_camel_case() {
        let json = r#"{
            "title": "Mia Shares",
            "coverPageDescription": "Mia waving",
            "settingDescription": "A classroom",
            "keyObjects": ["blocks"],
            "pages": [{ "pageText": "Mia plays.", "actionAndEmotion": "smiling" }]
        }"#;
        let outline: StoryOutline = serde_json::from_str(json).unwrap();
        assert_eq!(outline.pages[0].action_and_emotion, "smiling");
        assert_eq!(outline.key_objects, vec!["blocks".to_string()]);
    }

    #[test]
    fn test_image_data_url_and_extension() {
        let image = ImageData::new("image/jpeg", vec![0xff, 0xd8]);
        let url = image.to_data_url();
        assert_eq!(url, "data:image/jpeg;base64,/9g=");
        assert_eq!(ImageData::from_data_url(&url).unwrap(), image);
        assert_eq!(image.extension(), "jpg");

        let json = serde_json::to_string(&image).unwrap();
        assert!(json.contains("/9g="));
    }

    #[test]
    fn test_image_from_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("photo.PNG");
        std::fs::write(&path, [9u8, 8, 7])?;
        let image = ImageData::from_path(&path)?;
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.bytes, vec![9, 8, 7]);

        assert!(ImageData::from_path(&dir.path().join("notes.txt")).is_err());
        Ok(())
    }
}
