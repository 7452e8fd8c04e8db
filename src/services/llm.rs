use crate::core::config::Config;
use crate::core::story::ImageData;
use crate::services::prompt::strip_code_blocks;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Debug;

pub const DESCRIPTION_TEMPERATURE: f32 = 0.2;
pub const OUTLINE_TEMPERATURE: f32 = 0.8;

/// The hosted generative service the story workflow is built on.
#[async_trait]
pub trait GenerativeService: Send + Sync + Debug {
    /// Free-text answer to `instructions` about `image`.
    async fn describe_image(&self, image: &ImageData, instructions: &str) -> Result<String>;
    /// JSON output constrained by a JSON-Schema `schema`.
    async fn generate_structured(&self, system: &str, prompt: &str, schema: &Value) -> Result<Value>;
    async fn generate_image(&self, prompt: &str) -> Result<ImageData>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini" or "openai"
    pub gemini: Option<GeminiConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_image_model")]
    pub image_model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_image_model")]
    pub image_model: String,
    pub base_url: Option<String>,
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_gemini_image_model() -> String {
    "imagen-3.0-generate-002".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_openai_image_model() -> String {
    "gpt-image-1".to_string()
}

impl LlmConfig {
    /// Empty API keys fall back to `GEMINI_API_KEY` / `OPENAI_API_KEY`.
    pub fn fill_keys_from_env(&mut self) {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if self.gemini.is_none() && self.provider == "gemini" {
                self.gemini = Some(GeminiConfig {
                    model: default_gemini_model(),
                    image_model: default_gemini_image_model(),
                    ..Default::default()
                });
            }
            if let Some(cfg) = self.gemini.as_mut().filter(|c| c.api_key.is_empty()) {
                cfg.api_key = key;
            }
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if self.openai.is_none() && self.provider == "openai" {
                self.openai = Some(OpenAIConfig {
                    model: default_openai_model(),
                    image_model: default_openai_image_model(),
                    ..Default::default()
                });
            }
            if let Some(cfg) = self.openai.as_mut().filter(|c| c.api_key.is_empty()) {
                cfg.api_key = key;
            }
        }
    }
}

pub fn create_service(config: &Config) -> Result<Box<dyn GenerativeService>> {
    info!("Initializing generative service: {}", config.llm.provider);
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().context("Gemini config missing")?;
            if cfg.api_key.is_empty() {
                anyhow::bail!("Gemini API key missing (set llm.gemini.api_key or GEMINI_API_KEY)");
            }
            Ok(Box::new(GeminiClient::new(cfg)))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            if cfg.api_key.is_empty() {
                anyhow::bail!("OpenAI API key missing (set llm.openai.api_key or OPENAI_API_KEY)");
            }
            Ok(Box::new(OpenAIClient::new(cfg)))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

fn parse_structured(text: &str) -> Result<Value> {
    let clean_json = strip_code_blocks(text);
    serde_json::from_str(&clean_json).with_context(|| format!("Failed to parse JSON output: {}", clean_json))
}

// --- Gemini ---

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    image_model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(cfg: &GeminiConfig) -> Self {
        Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            image_model: cfg.image_model.clone(),
            client: reqwest::Client::new(),
        }
    }

    async fn generate_content(&self, request_body: &GeminiRequest) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            GEMINI_BASE_URL, self.model, self.api_key
        );

        let resp = self.client.post(&url).json(request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = match serde_json::from_str(&response_text) {
            Ok(r) => r,
            Err(e) => return Err(anyhow!("Failed to parse Gemini response: {}. Body: {}", e, response_text)),
        };
        result.into_text()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiBlob,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }

        let first = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| anyhow!("Gemini response has no candidates"))?;

        let text: String = first
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
            return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
        }
        Ok(text)
    }
}

#[derive(Serialize)]
struct ImagenRequest {
    instances: Vec<ImagenInstance>,
    parameters: ImagenParameters,
}

#[derive(Serialize)]
struct ImagenInstance {
    prompt: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImagenParameters {
    sample_count: u32,
    aspect_ratio: String,
    output_mime_type: String,
}

#[derive(Deserialize)]
struct ImagenResponse {
    #[serde(default)]
    predictions: Vec<ImagenPrediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImagenPrediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

impl ImagenResponse {
    fn into_image(self) -> Result<ImageData> {
        let prediction = self
            .predictions
            .into_iter()
            .find(|p| p.bytes_base64_encoded.is_some())
            .ok_or_else(|| anyhow!("Image model did not return an image."))?;
        let mime_type = prediction.mime_type.as_deref().unwrap_or("image/jpeg");
        let data = prediction.bytes_base64_encoded.unwrap_or_default();
        ImageData::from_base64(mime_type, &data)
    }
}

/// Rewrites a JSON-Schema into Gemini's OpenAPI subset (upper-case type names).
fn to_gemini_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                match key.as_str() {
                    "additionalProperties" | "$schema" => {}
                    "type" => {
                        let upper = value.as_str().map(|s| s.to_uppercase()).unwrap_or_default();
                        out.insert(key.clone(), Value::String(upper));
                    }
                    _ => {
                        out.insert(key.clone(), to_gemini_schema(value));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(to_gemini_schema).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl GenerativeService for GeminiClient {
    async fn describe_image(&self, image: &ImageData, instructions: &str) -> Result<String> {
        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![
                    GeminiPart::InlineData {
                        inline_data: GeminiBlob {
                            mime_type: image.mime_type.clone(),
                            data: image.to_base64(),
                        },
                    },
                    GeminiPart::Text { text: instructions.to_string() },
                ],
            }],
            system_instruction: None,
            generation_config: GeminiGenerationConfig {
                temperature: DESCRIPTION_TEMPERATURE,
                response_mime_type: None,
                response_schema: None,
            },
        };
        self.generate_content(&request_body).await
    }

    async fn generate_structured(&self, system: &str, prompt: &str, schema: &Value) -> Result<Value> {
        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart::Text { text: prompt.to_string() }],
            }],
            system_instruction: Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text { text: system.to_string() }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: OUTLINE_TEMPERATURE,
                response_mime_type: Some("application/json".to_string()),
                response_schema: Some(to_gemini_schema(schema)),
            },
        };
        let text = self.generate_content(&request_body).await?;
        parse_structured(&text)
    }

    async fn generate_image(&self, prompt: &str) -> Result<ImageData> {
        let url = format!(
            "{}/models/{}:predict?key={}",
            GEMINI_BASE_URL, self.image_model, self.api_key
        );
        let request_body = ImagenRequest {
            instances: vec![ImagenInstance { prompt: prompt.to_string() }],
            parameters: ImagenParameters {
                sample_count: 1,
                aspect_ratio: "1:1".to_string(),
                output_mime_type: "image/jpeg".to_string(),
            },
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;
        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Imagen API error: {}", error_text));
        }

        let result: ImagenResponse = resp.json().await.context("Failed to parse Imagen response")?;
        let image = result.into_image()?;
        debug!("Imagen returned {} bytes", image.bytes.len());
        Ok(image)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    image_model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(cfg: &OpenAIConfig) -> Self {
        Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            image_model: cfg.image_model.clone(),
            base_url: cfg
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }
        Ok(resp)
    }

    async fn chat(&self, body: Value) -> Result<String> {
        let result: OpenAIResponse = self.post("chat/completions", &body).await?.json().await?;
        result.into_text()
    }
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

impl OpenAIResponse {
    fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("OpenAI response empty or missing content"))
    }
}

#[derive(Deserialize)]
struct OpenAIImageResponse {
    data: Vec<OpenAIImage>,
}

#[derive(Deserialize)]
struct OpenAIImage {
    b64_json: Option<String>,
}

#[async_trait]
impl GenerativeService for OpenAIClient {
    async fn describe_image(&self, image: &ImageData, instructions: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": DESCRIPTION_TEMPERATURE,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": image.to_data_url() } },
                    { "type": "text", "text": instructions },
                ],
            }],
        });
        self.chat(body).await
    }

    async fn generate_structured(&self, system: &str, prompt: &str, schema: &Value) -> Result<Value> {
        let body = json!({
            "model": self.model,
            "temperature": OUTLINE_TEMPERATURE,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": "story_outline", "schema": schema },
            },
        });
        let text = self.chat(body).await?;
        parse_structured(&text)
    }

    async fn generate_image(&self, prompt: &str) -> Result<ImageData> {
        let mut body = json!({
            "model": self.image_model,
            "prompt": prompt,
            "n": 1,
            "size": "1024x1024",
        });
        // gpt-image models always return base64; dall-e needs to be asked.
        if self.image_model.starts_with("dall-e") {
            body["response_format"] = json!("b64_json");
        }

        let result: OpenAIImageResponse = self
            .post("images/generations", &body)
            .await?
            .json()
            .await
            .context("Failed to parse OpenAI image response")?;
        let data = result
            .data
            .into_iter()
            .find_map(|img| img.b64_json)
            .ok_or_else(|| anyhow!("Image model did not return an image."))?;
        ImageData::from_base64("image/png", &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = result.into_text().unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_gemini_response_joins_text_parts() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [ { "text": "A child with " }, { "text": "curly hair." } ],
                        "role": "model"
                    },
                    "finishReason": "STOP"
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.into_text().unwrap(), "A child with curly hair.");
    }

    #[test]
    fn test_gemini_error_body() {
        let json = r#"{ "error": { "code": 400, "message": "API key not valid" } }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert!(result.into_text().unwrap_err().to_string().contains("API key not valid"));
    }

    #[test]
    fn test_gemini_request_shape() {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![
                    GeminiPart::InlineData {
                        inline_data: GeminiBlob {
                            mime_type: "image/png".to_string(),
                            data: "AQID".to_string(),
                        },
                    },
                    GeminiPart::Text { text: "describe".to_string() },
                ],
            }],
            system_instruction: None,
            generation_config: GeminiGenerationConfig {
                temperature: 0.5,
                response_mime_type: Some("application/json".to_string()),
                response_schema: None,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["parts"][0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(value["contents"][0]["parts"][1]["text"], "describe");
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
        assert!(value.get("systemInstruction").is_none());
        assert!(value["generationConfig"].get("responseSchema").is_none());
    }

    #[test]
    fn test_gemini_schema_conversion() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "keyObjects": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["keyObjects"]
        });
        let converted = to_gemini_schema(&schema);
        assert_eq!(converted["type"], "OBJECT");
        assert_eq!(converted["properties"]["keyObjects"]["type"], "ARRAY");
        assert_eq!(converted["properties"]["keyObjects"]["items"]["type"], "STRING");
        assert_eq!(converted["required"][0], "keyObjects");
        assert!(converted.get("additionalProperties").is_none());
    }

    #[test]
    fn test_imagen_response_parsing() {
        let json = r#"{ "predictions": [ { "bytesBase64Encoded": "AQID", "mimeType": "image/jpeg" } ] }"#;
        let result: ImagenResponse = serde_json::from_str(json).unwrap();
        let image = result.into_image().unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.bytes, vec![1, 2, 3]);

        let empty: ImagenResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.into_image().is_err());
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "```json\n{\"title\": \"Hi\"}\n```"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        let text = result.into_text().unwrap();
        assert_eq!(parse_structured(&text).unwrap()["title"], "Hi");
    }

    #[test]
    fn test_openai_image_parsing() {
        let json = r#"{ "created": 1, "data": [ { "b64_json": "AQID" } ] }"#;
        let result: OpenAIImageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.data[0].b64_json.as_deref(), Some("AQID"));
    }

    #[test]
    fn test_create_service_requires_key() {
        let config = Config::parse(
            r#"
llm:
  provider: openai
  openai:
    api_key: "sk-test"
"#,
        )
        .unwrap();
        assert!(create_service(&config).is_ok());

        let config = Config::parse("llm:\n  provider: ollama\n").unwrap();
        assert!(create_service(&config).is_err());
    }
}
