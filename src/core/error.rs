use thiserror::Error;

/// Failures surfaced to whoever started a story run.
///
/// Only `Validation` carries a variable message. The other variants map to a
/// fixed sentence; the provider detail behind them is logged where the
/// failure happens and never shown to the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoryError {
    #[error("{0}")]
    Validation(String),

    #[error("The AI failed to analyze the image.")]
    Description,

    #[error("The AI failed to generate the story text.")]
    Outline,

    #[error("The AI failed to generate the image.")]
    Image,
}

impl StoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        StoryError::Validation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_messages() {
        assert_eq!(
            StoryError::validation("Please upload a photo of the main character.").to_string(),
            "Please upload a photo of the main character."
        );
        assert_eq!(StoryError::Description.to_string(), "The AI failed to analyze the image.");
        assert_eq!(StoryError::Outline.to_string(), "The AI failed to generate the story text.");
        assert_eq!(StoryError::Image.to_string(), "The AI failed to generate the image.");
    }
}
