use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error surface of the remote generative API. The retry layer needs to
/// tell rate-limit/overload signals apart from everything else, so this is
/// a concrete enum rather than `anyhow`.
#[derive(Debug, Error)]
pub enum GenAiError {
    #[error("Gemini API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse Gemini response: {0}")]
    BadResponse(String),

    #[error("Gemini response empty. Finish reason: {0}")]
    Empty(String),

    #[error("no image data in response")]
    NoImageData,
}

impl GenAiError {
    /// Rate limiting and transient server overload. Everything else is
    /// terminal and must not be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenAiError::Api { status, body } => {
                matches!(status, 429 | 500 | 503)
                    || body.contains("RESOURCE_EXHAUSTED")
                    || body.to_ascii_lowercase().contains("quota")
            }
            _ => false,
        }
    }

    /// Quota-pattern errors get a dedicated user-facing message.
    pub fn is_quota(&self) -> bool {
        match self {
            GenAiError::Api { status, body } => {
                *status == 429
                    || body.contains("RESOURCE_EXHAUSTED")
                    || body.to_ascii_lowercase().contains("quota")
            }
            _ => false,
        }
    }
}

/// One piece of a multimodal prompt. Inline image data (base64) is placed
/// ahead of the text part so the model treats it as the visual reference.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPart {
    Text(String),
    InlineData { mime_type: String, data: String },
}

/// An image payload returned by the model: MIME type plus base64 data.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// Narrow seam to the remote model so the orchestration on top (retry,
/// pacing, session transitions) is testable against a mock.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Schema-constrained JSON generation. Returns the raw response text.
    async fn generate_json(
        &self,
        model: &str,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<String, GenAiError>;

    /// Image generation from prompt parts at a fixed aspect ratio.
    async fn generate_image(
        &self,
        model: &str,
        parts: &[PromptPart],
        aspect_ratio: &str,
    ) -> Result<InlineImage, GenAiError>;
}

// --- Gemini REST implementation ---

#[derive(Debug)]
pub struct GeminiBackend {
    api_key: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            model, self.api_key
        )
    }

    async fn post(&self, model: &str, body: &GeminiRequest) -> Result<GeminiResponse, GenAiError> {
        let resp = self
            .client
            .post(self.endpoint(model))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenAiError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        let parsed: GeminiResponse = serde_json::from_str(&text)
            .map_err(|e| GenAiError::BadResponse(format!("{}. Body: {}", e, text)))?;

        if let Some(err) = parsed.error {
            return Err(GenAiError::BadResponse(err.message));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    async fn generate_json(
        &self,
        model: &str,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<String, GenAiError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiRequestPart::text(prompt)],
            }],
            generation_config: Some(GenerationConfig {
                response_mime_type: Some("application/json".to_string()),
                response_schema: Some(schema.clone()),
                response_modalities: None,
                image_config: None,
            }),
        };

        let response = self.post(model, &request).await?;
        first_text_part(response)
    }

    async fn generate_image(
        &self,
        model: &str,
        parts: &[PromptPart],
        aspect_ratio: &str,
    ) -> Result<InlineImage, GenAiError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: parts.iter().map(GeminiRequestPart::from_prompt).collect(),
            }],
            generation_config: Some(GenerationConfig {
                response_mime_type: None,
                response_schema: None,
                response_modalities: Some(vec!["IMAGE".to_string()]),
                image_config: Some(ImageConfig {
                    aspect_ratio: aspect_ratio.to_string(),
                }),
            }),
        };

        let response = self.post(model, &request).await?;
        first_inline_image(response)
    }
}

fn first_text_part(response: GeminiResponse) -> Result<String, GenAiError> {
    if let Some(candidates) = response.candidates {
        if let Some(first) = candidates.into_iter().next() {
            let reason = first.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
            if let Some(content) = first.content {
                for part in content.parts {
                    if let Some(text) = part.text {
                        return Ok(text);
                    }
                }
            }
            return Err(GenAiError::Empty(reason));
        }
    }
    Err(GenAiError::Empty("NO_CANDIDATES".to_string()))
}

fn first_inline_image(response: GeminiResponse) -> Result<InlineImage, GenAiError> {
    if let Some(candidates) = response.candidates {
        for candidate in candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(inline) = part.inline_data {
                        return Ok(InlineImage {
                            mime_type: inline.mime_type,
                            data: inline.data,
                        });
                    }
                }
            }
        }
    }
    Err(GenAiError::NoImageData)
}

// --- Wire types ---

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiRequestPart>,
}

#[derive(Serialize)]
struct GeminiRequestPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl GeminiRequestPart {
    fn text(s: &str) -> Self {
        Self {
            text: Some(s.to_string()),
            inline_data: None,
        }
    }

    fn from_prompt(part: &PromptPart) -> Self {
        match part {
            PromptPart::Text(s) => Self::text(s),
            PromptPart::InlineData { mime_type, data } => Self {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                }),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
    #[serde(rename = "responseModalities", skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<String>>,
    #[serde(rename = "imageConfig", skip_serializing_if = "Option::is_none")]
    image_config: Option<ImageConfig>,
}

#[derive(Serialize)]
struct ImageConfig {
    #[serde(rename = "aspectRatio")]
    aspect_ratio: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiApiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
    #[serde(rename = "inlineData")]
    inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug)]
struct GeminiApiError {
    message: String,
}
