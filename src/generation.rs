use crate::config::Config;
use crate::gemini::{GenerativeBackend, PromptPart};
use crate::retry::{call_with_retry, RetryPolicy};
use crate::session::{Character, Scene, Setting};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Result of the story analysis call: pages in model-declared order,
/// characters normalized with a full (empty) tweak record, and the
/// resolved tone and page count.
#[derive(Debug)]
pub struct StoryAnalysis {
    pub characters: Vec<Character>,
    pub scenes: Vec<Scene>,
    pub tone: String,
    pub scene_count: u32,
}

/// The three generation operations, each a prompt builder plus a retried
/// backend call plus response validation.
pub struct GenerationClient {
    backend: Arc<dyn GenerativeBackend>,
    text_model: String,
    image_model: String,
    aspect_ratio: String,
    text_retry: RetryPolicy,
    image_retry: RetryPolicy,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn GenerativeBackend>, config: &Config) -> Self {
        Self {
            backend,
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
            aspect_ratio: config.aspect_ratio.clone(),
            text_retry: config.text_retry.policy(),
            image_retry: config.image_retry.policy(),
        }
    }

    /// Split the story into pages and extract characters. A response that
    /// is not valid JSON degrades to an empty result; transport and API
    /// errors propagate (retried first when transient).
    pub async fn analyze_story(
        &self,
        story: &str,
        scene_count: &Setting<u32>,
        tone: &Setting<String>,
    ) -> Result<StoryAnalysis> {
        if let Some(n) = scene_count.fixed() {
            anyhow::ensure!(*n >= 1, "page count must be at least 1, got {}", n);
        }

        let prompt = build_analysis_prompt(story, scene_count, tone);
        let schema = analysis_schema();

        let text = call_with_retry(self.text_retry, || {
            self.backend.generate_json(&self.text_model, &prompt, &schema)
        })
        .await
        .context("story analysis failed")?;

        let raw: RawAnalysis = serde_json::from_str(&text).unwrap_or_default();

        let characters = raw
            .characters
            .into_iter()
            .map(|c| Character::new(c.id, c.name, c.description))
            .collect();

        // Re-index pages in the model's declared order.
        let scenes: Vec<Scene> = raw
            .scenes
            .into_iter()
            .enumerate()
            .map(|(i, s)| Scene {
                id: i as u32 + 1,
                story_text: s.story_text,
                description: s.description,
                image_url: None,
                is_generating: false,
                sliders: None,
            })
            .collect();

        // Explicit settings win over whatever the model reported.
        let resolved_tone = tone
            .fixed()
            .cloned()
            .or(raw.determined_tone)
            .unwrap_or_else(|| "gentle and warm".to_string());
        let resolved_count = scene_count
            .fixed()
            .copied()
            .or(raw.determined_count)
            .unwrap_or(scenes.len() as u32);

        Ok(StoryAnalysis {
            characters,
            scenes,
            tone: resolved_tone,
            scene_count: resolved_count,
        })
    }

    /// Generate a three-view reference sheet for one character. A valid
    /// uploaded reference image is attached ahead of the text prompt;
    /// anything that does not look like inline image data is skipped.
    pub async fn generate_character_sheet(
        &self,
        character: &Character,
        tone: &str,
        style_tags: &str,
    ) -> Result<String> {
        let mut parts = Vec::new();
        let reference = character
            .upload_url
            .as_deref()
            .and_then(parse_image_data_uri);
        if let Some((mime_type, data)) = &reference {
            parts.push(PromptPart::InlineData {
                mime_type: mime_type.clone(),
                data: data.clone(),
            });
        }
        parts.push(PromptPart::Text(build_sheet_prompt(
            character,
            tone,
            style_tags,
            reference.is_some(),
        )));

        let image = call_with_retry(self.image_retry, || {
            self.backend.generate_image(&self.image_model, &parts, "1:1")
        })
        .await
        .with_context(|| format!("character sheet generation failed for {}", character.name))?;

        Ok(png_data_uri(&image.data))
    }

    /// Generate the illustration for one page, grounded in the full
    /// character list for visual consistency.
    pub async fn generate_scene_image(
        &self,
        scene: &Scene,
        characters: &[Character],
        tone: &str,
        style_tags: &str,
        use_story_text: bool,
    ) -> Result<String> {
        let prompt = build_scene_prompt(scene, characters, tone, style_tags, use_story_text);
        let parts = vec![PromptPart::Text(prompt)];

        let image = call_with_retry(self.image_retry, || {
            self.backend
                .generate_image(&self.image_model, &parts, &self.aspect_ratio)
        })
        .await
        .with_context(|| format!("illustration failed for page {}", scene.id))?;

        Ok(png_data_uri(&image.data))
    }
}

// --- Prompt construction ---

fn build_analysis_prompt(story: &str, scene_count: &Setting<u32>, tone: &Setting<String>) -> String {
    let count_clause = match scene_count.fixed() {
        Some(n) => format!("Split the story into exactly {} pages.", n),
        None => "Choose a page count between 5 and 40 that fits the length and narrative arc \
                 of the story, split the story into that many pages, and report the number as \
                 determinedCount."
            .to_string(),
    };
    let tone_clause = match tone.fixed() {
        Some(t) => format!("The tone of the book is '{}'.", t),
        None => "Infer the overall tone of the story and report it as determinedTone.".to_string(),
    };

    format!(
        "You are a picture book editor. Turn the following story into a picture book.\n\
         {}\n{}\n\
         For every page provide the printed page text (storyText) and a visual description \
         for the illustrator (description). List every character that appears, with a short \
         visual concept for each.\n\n\
         Story:\n{}",
        count_clause, tone_clause, story
    )
}

fn analysis_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "scenes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "storyText": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["id", "storyText", "description"]
                }
            },
            "characters": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "name": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["id", "name", "description"]
                }
            },
            "determinedTone": { "type": "string" },
            "determinedCount": { "type": "integer" }
        },
        "required": ["scenes", "characters"]
    })
}

fn build_sheet_prompt(
    character: &Character,
    tone: &str,
    style_tags: &str,
    has_reference: bool,
) -> String {
    let mut prompt = format!(
        "Character reference sheet for \"{}\": {}.",
        character.name, character.description
    );
    if let Some(tweaks) = character.tweaks.flatten() {
        prompt.push_str(&format!(" Details: {}.", tweaks));
    }
    if has_reference {
        prompt.push_str(
            " Match the facial features and clothing of the attached reference image.",
        );
    }
    prompt.push_str(&format!(
        " Three views of the same character: front, side and back, full body, standing, \
         on a plain white background. Tone: {}. Style: {}.",
        tone, style_tags
    ));
    prompt
}

fn build_scene_prompt(
    scene: &Scene,
    characters: &[Character],
    tone: &str,
    style_tags: &str,
    use_story_text: bool,
) -> String {
    let primary = if use_story_text {
        &scene.story_text
    } else {
        &scene.description
    };

    let mut prompt = format!("Picture book illustration.\nScene: {}\n", primary);

    if !characters.is_empty() {
        let context: Vec<String> = characters
            .iter()
            .map(|c| match c.tweaks.flatten() {
                Some(tweaks) => format!("{}: {} ({})", c.name, c.description, tweaks),
                None => format!("{}: {}", c.name, c.description),
            })
            .collect();
        prompt.push_str(&format!("Characters: {}.\n", context.join("; ")));
        prompt.push_str("Keep every character's appearance consistent with their description.\n");
    }

    if let Some(sliders) = &scene.sliders {
        prompt.push_str(&format!("Atmosphere (scale 1-10): {}.\n", sliders.clause()));
    }

    prompt.push_str(&format!(
        "Tone: {}. Style: {}.\nHigh resolution. No text, letters or captions in the image.",
        tone, style_tags
    ));
    prompt
}

// --- Data URIs ---

pub fn png_data_uri(base64_payload: &str) -> String {
    format!("data:image/png;base64,{}", base64_payload)
}

/// Parse a `data:image/...;base64,<payload>` URI into (mime type, payload).
/// Anything else, including non-image MIME types, yields None.
pub fn parse_image_data_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    if !mime.starts_with("image/") || payload.is_empty() {
        return None;
    }
    Some((mime.to_string(), payload.to_string()))
}

// --- Analysis wire shape ---

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawAnalysis {
    scenes: Vec<RawScene>,
    characters: Vec<RawCharacter>,
    #[serde(rename = "determinedTone")]
    determined_tone: Option<String>,
    #[serde(rename = "determinedCount")]
    determined_count: Option<u32>,
}

#[derive(Deserialize)]
struct RawScene {
    #[serde(default)]
    #[allow(dead_code)]
    id: u32,
    #[serde(rename = "storyText")]
    story_text: String,
    description: String,
}

#[derive(Deserialize)]
struct RawCharacter {
    id: String,
    name: String,
    description: String,
}
