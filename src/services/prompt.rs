//! Prompt and schema construction for the story workflow.
//!
//! Everything here is a pure function of its inputs, so a given request always
//! produces the same prompts.

use crate::core::story::{AgeBand, CharacterDescription, PageDraft, StoryOutline, StoryRequest};
use anyhow::{Context, Result};
use serde_json::{json, Value};

pub const ART_STYLE: &str =
    "A gentle, warm, digital painting style with soft textures and a vibrant, harmonious color palette.";

pub const DESCRIPTION_INSTRUCTIONS: &str = r#"You are an expert descriptive analyst. Analyze the provided image of a child. Generate a detailed, objective, text-based "passport" description focusing on key visual features for consistent character illustration.
- Do NOT mention the child's name, age, or perceived gender.
- Describe physical appearance only: hair color and style, eye color, skin tone, notable features like freckles or glasses.
- Describe the clothing in detail: type of shirt, color, pattern, pants/skirt, shoes.
- Be factual and concise. This description will be used by an illustrator.
- Example: "A child with short, straight blonde hair, blue eyes, and light skin with a few freckles across the nose. They are wearing a red short-sleeved t-shirt with a small dinosaur graphic on the front, and blue jeans.""#;

pub fn narrative_arc(band: AgeBand, request: &StoryRequest) -> String {
    let name = &request.child_name;
    let situation = &request.situation;
    let concept = &request.social_concept;
    match band {
        AgeBand::Toddler => format!(
            "1. Introduction: Introduce {name} in a simple, familiar setting. \
             2. Inciting Incident: The social challenge occurs (e.g., another child takes a toy). \
             3. Initial Reaction: {name} has a big, simple emotional reaction (e.g., feels sad, cries). \
             4. Modeling: A caregiver or peer models the desired behavior in one simple step (e.g., \"Can I have a turn, please?\"). \
             5. Resolution: The situation is resolved simply ({name} gets the toy back or finds another). \
             6. Positive Reinforcement: A simple, positive statement (e.g., \"Sharing is fun!\")."
        ),
        AgeBand::Preschool => format!(
            "1. Introduction: Introduce {name} and their desire (e.g., wanting to play with a specific toy). \
             2. Inciting Incident: The social challenge happens ({situation}). \
             3. Emotional Reaction: Describe {name}'s feeling (e.g., \"felt frustrated and angry\"). \
             4. Perspective-Taking (Simple): Briefly mention the other person's perspective (e.g., \"Maybe they wanted to play too.\"). \
             5. Modeling the Skill: A character (or internal thought) models the target skill ({concept}) with a simple phrase. \
             6. Attempt: {name} tries the new skill (e.g., asks for the toy). \
             7. Resolution: The situation is resolved positively. \
             8. Positive Reinforcement: Connects the action to the positive outcome (e.g., \"When {name} asked nicely, playing together was more fun.\")."
        ),
        AgeBand::SchoolAge => format!(
            "1. Introduction: Set the scene and introduce {name}'s goal or state of mind. \
             2. Inciting Incident: Describe the social challenge ({situation}) with a bit more context. \
             3. Emotional Granularity: Describe {name}'s complex feelings (e.g., \"felt a mix of disappointment and jealousy\"). \
             4. Internal Conflict/Thought: {name} thinks about their initial impulse vs. a better choice. \
             5. Perspective-Taking: Explore the other person's possible feelings or intentions more deeply. \
             6. Applying the Skill: {name} makes a conscious choice to use the social skill ({concept}). \
             7. Resolution & Consequence: The situation resolves, showing the natural positive consequence of their choice. \
             8. Reflection/Generalization: {name} has a concluding thought about why the skill is useful in general."
        ),
    }
}

pub fn narrative_complexity(band: AgeBand) -> &'static str {
    match band {
        AgeBand::Toddler => {
            "Extremely simple. Use 3-6 word sentences. Focus on one core emotion and one simple action. Repetitive phrases are good."
        }
        AgeBand::Preschool => {
            "Standard. Use simple sentences but introduce connecting words (and, but, so). Acknowledge feelings and a simple 'why' behind actions."
        }
        AgeBand::SchoolAge => {
            "More complex sentences. Introduce concepts like thoughts vs. actions, and cause-and-effect. Use a richer vocabulary for emotions."
        }
    }
}

pub fn system_instruction(request: &StoryRequest) -> String {
    format!(
        "You are a warm, empathetic, and skilled writer of social stories for children with developmental needs. \
Your primary goal is to create a story that is simple, direct, and educational, helping the child understand a specific social situation and learn a positive way to respond.
- **Tone**: Gentle, reassuring, and positive.
- **Perspective**: Use the third person (refer to the main character by name, e.g., \"{name} felt sad\").
- **Focus**: The story must directly address the 'Concept to Learn' and the 'Situation/Challenge' provided.
- **Language**: Use age-appropriate language as specified. Avoid idioms, sarcasm, or complex metaphors. Be very literal.
- **Output Format**: You MUST follow the JSON schema provided. Do not add any extra text or formatting outside the JSON structure.
- **Key Task**: For each page, create both the 'pageText' and a corresponding 'actionAndEmotion' summary. The 'actionAndEmotion' is the MOST CRITICAL output as it directly commands an AI illustrator. \
It must be a visually descriptive phrase detailing the character's specific body language, facial expression, and physical action. Be explicit. \
Instead of \"is sad,\" write \"is sitting on the floor, hugging their knees, with tears in their eyes.\" Instead of \"is happy,\" write \"is jumping up and down with a wide, joyful smile.\"
- **Setting and Objects**: Ensure the 'settingDescription' and 'keyObjects' you define are consistently used and referenced throughout the page descriptions to maintain visual continuity in illustrations. \
The 'settingDescription' should be a single, consistent location for the *entire* story.",
        name = request.child_name
    )
}

pub fn story_prompt(request: &StoryRequest) -> String {
    let band = request.age_band();
    let pages = band.page_count();
    format!(
        "Create a {pages}-page social story for {name} ({gender}, age {age}).
- **Concept to Learn**: {concept}
- **Situation/Challenge**: {situation}
- **Narrative Arc**: {arc}
- **Language Complexity**: {complexity}
- **Generate**: A title, a cover page description, a single setting for the whole story, a list of key objects, and {pages} distinct story pages.",
        name = request.child_name,
        gender = request.gender,
        age = request.age,
        concept = request.social_concept,
        situation = request.situation,
        arc = narrative_arc(band, request),
        complexity = narrative_complexity(band),
    )
}

/// JSON-Schema for the outline. `pages` is pinned to the band's page count.
pub fn outline_schema(request: &StoryRequest) -> Value {
    let pages = request.age_band().page_count();
    json!({
        "type": "object",
        "properties": {
            "title": {
                "type": "string",
                "description": "A creative and simple title for the story."
            },
            "coverPageDescription": {
                "type": "string",
                "description": format!(
                    "A vibrant and simple visual description for the cover image. Example: 'A happy {} standing on a playground, waving.'",
                    request.child_name
                )
            },
            "settingDescription": {
                "type": "string",
                "description": "A single, detailed description of the primary setting for the entire story. This will be used to ensure visual consistency across all illustrations."
            },
            "keyObjects": {
                "type": "array",
                "description": "A list of 2-3 important objects that might appear in the story. Example: ['a red ball', 'a blue teddy bear']",
                "items": { "type": "string" }
            },
            "pages": {
                "type": "array",
                "description": format!("An array of exactly {} page objects.", pages),
                "minItems": pages,
                "maxItems": pages,
                "items": {
                    "type": "object",
                    "properties": {
                        "pageText": {
                            "type": "string",
                            "description": "The text for this page of the story. Must be age-appropriate."
                        },
                        "actionAndEmotion": {
                            "type": "string",
                            "description": "A visually explicit command for an AI illustrator. Describe the character's body language, facial expression, and action."
                        }
                    },
                    "required": ["pageText", "actionAndEmotion"]
                }
            }
        },
        "required": ["title", "coverPageDescription", "settingDescription", "keyObjects", "pages"]
    })
}

/// Decodes the service output and checks the page count against the age band.
pub fn parse_outline(value: Value, band: AgeBand) -> Result<StoryOutline> {
    let outline: StoryOutline =
        serde_json::from_value(value).context("Outline does not match the schema")?;
    if outline.pages.len() != band.page_count() {
        anyhow::bail!(
            "Outline has {} pages, expected {}",
            outline.pages.len(),
            band.page_count()
        );
    }
    Ok(outline)
}

pub fn cover_prompt(outline: &StoryOutline, character: &CharacterDescription) -> String {
    format!(
        "A beautiful children's book cover illustration for a story titled \"{title}\".
**Scene:** {scene}.
**Character's Look:** The character should consistently look like this: {character}.
**Art Style:** {style}",
        title = outline.title,
        scene = outline.cover_page_description,
        character = character,
        style = ART_STYLE,
    )
}

pub fn page_prompt(
    page: &PageDraft,
    outline: &StoryOutline,
    character: &CharacterDescription,
) -> String {
    let key_objects = if outline.key_objects.is_empty() {
        "None".to_string()
    } else {
        outline.key_objects.join(", ")
    };
    format!(
        "**Core Directive: Emotion and Action**
This is the most important part. Illustrate the character's facial expression and body language to PERFECTLY match this: **{action}**.
**Visual Consistency:**
- Character Passport: {character}.
- Story Setting: {setting}.
- Key Objects: {key_objects}.
**Artistic Style:** Gentle, warm, digital painting style.",
        action = page.action_and_emotion,
        character = character,
        setting = outline.setting_description,
        key_objects = key_objects,
    )
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}
