use serde::{Deserialize, Serialize};

/// Workflow phase. Analysis is transient while the story call is in
/// flight; reset returns to Input from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Input,
    Analysis,
    Characters,
    Scenes,
}

/// Audience band. Each band binds a fixed style phrase that is
/// interpolated into every image prompt for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Toddler,
    #[default]
    EarlyReader,
    Intermediate,
    Adult,
}

impl AgeGroup {
    pub const ALL: [AgeGroup; 4] = [
        AgeGroup::Toddler,
        AgeGroup::EarlyReader,
        AgeGroup::Intermediate,
        AgeGroup::Adult,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            AgeGroup::Toddler => "Toddler (0-4)",
            AgeGroup::EarlyReader => "Early reader (5-7)",
            AgeGroup::Intermediate => "Intermediate (8-12)",
            AgeGroup::Adult => "Adult",
        }
    }

    pub fn style_tags(&self) -> &'static str {
        match self {
            AgeGroup::Toddler => {
                "simple rounded shapes, bold outlines, flat bright colors, minimal detail, cute toddler picture-book style"
            }
            AgeGroup::EarlyReader => {
                "friendly storybook illustration, soft watercolor textures, warm colors, clear expressive faces"
            }
            AgeGroup::Intermediate => {
                "detailed storybook illustration, rich colors, dynamic composition, adventurous mood"
            }
            AgeGroup::Adult => {
                "sophisticated painterly illustration, nuanced palette, atmospheric lighting, literary mood"
            }
        }
    }
}

/// A request parameter the user either fixed or left to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting<T> {
    Auto,
    Fixed(T),
}

impl<T> Setting<T> {
    pub fn fixed(&self) -> Option<&T> {
        match self {
            Setting::Auto => None,
            Setting::Fixed(v) => Some(v),
        }
    }
}

/// Fine-grained per-character overrides. All five fields always exist;
/// empty means unspecified and is left out of prompts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tweaks {
    pub hair: String,
    pub clothing: String,
    pub appearance: String,
    pub personality: String,
    pub accessory: String,
}

impl Tweaks {
    /// Fixed enumeration of (label, value) pairs for prompt flattening.
    pub fn entries(&self) -> [(&'static str, &str); 5] {
        [
            ("hair", &self.hair),
            ("clothing", &self.clothing),
            ("appearance", &self.appearance),
            ("personality", &self.personality),
            ("accessory", &self.accessory),
        ]
    }

    /// Comma-joined "label: value" clause covering the non-empty fields.
    pub fn flatten(&self) -> Option<String> {
        let parts: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(label, value)| format!("{}: {}", label, value.trim()))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// Five-axis atmosphere vector, each axis 1..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sliders {
    pub tone: u8,
    pub excitement: u8,
    pub happiness: u8,
    pub energy: u8,
    pub tension: u8,
}

impl Sliders {
    pub fn new(tone: u8, excitement: u8, happiness: u8, energy: u8, tension: u8) -> Self {
        let clamp = |v: u8| v.clamp(1, 10);
        Self {
            tone: clamp(tone),
            excitement: clamp(excitement),
            happiness: clamp(happiness),
            energy: clamp(energy),
            tension: clamp(tension),
        }
    }

    pub fn clause(&self) -> String {
        format!(
            "Tone:{}, Excitement:{}, Happiness:{}, Energy:{}, Tension:{}",
            self.tone, self.excitement, self.happiness, self.energy, self.tension
        )
    }
}

impl Default for Sliders {
    fn default() -> Self {
        Self::new(5, 5, 5, 5, 5)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tweaks: Tweaks,
    /// Generated reference sheet, as a PNG data URI.
    pub sheet_url: Option<String>,
    /// User-supplied reference image, as a data URI.
    pub upload_url: Option<String>,
    pub is_generating: bool,
}

impl Character {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            tweaks: Tweaks::default(),
            sheet_url: None,
            upload_url: None,
            is_generating: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    /// Page number. Assigned once at analysis time, never reused.
    pub id: u32,
    /// Printed page text.
    pub story_text: String,
    /// Illustrator-facing visual prompt.
    pub description: String,
    pub image_url: Option<String>,
    pub is_generating: bool,
    pub sliders: Option<Sliders>,
}

#[derive(Debug, Clone)]
pub struct StoryParams {
    pub story: String,
    pub age_group: AgeGroup,
    pub tone: Setting<String>,
    pub scene_count: Setting<u32>,
}

impl Default for StoryParams {
    fn default() -> Self {
        Self {
            story: String::new(),
            age_group: AgeGroup::default(),
            tone: Setting::Auto,
            scene_count: Setting::Auto,
        }
    }
}

/// Patch for id-keyed character mutation. `None` leaves a field alone;
/// `upload_url` uses a nested Option so it can also be cleared.
#[derive(Debug, Clone, Default)]
pub struct CharacterPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tweaks: Option<Tweaks>,
    pub upload_url: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ScenePatch {
    pub story_text: Option<String>,
    pub description: Option<String>,
    pub sliders: Option<Option<Sliders>>,
}

/// The whole in-memory project. All mutation is keyed by entity id so
/// interleaved async completions only ever touch their own entity, and a
/// completion that lands after a reset finds no entity and does nothing.
#[derive(Debug, Default)]
pub struct Session {
    pub phase: Phase,
    pub params: StoryParams,
    pub characters: Vec<Character>,
    pub scenes: Vec<Scene>,
    /// Generation calls issued over the session lifetime.
    pub api_calls: u64,
    pub last_error: Option<String>,
    next_character_id: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard everything and return to Input.
    pub fn reset(&mut self) {
        *self = Session::new();
    }

    /// Replace characters/scenes with an analysis result and resolve the
    /// auto parameters to the determined values.
    pub fn apply_analysis(
        &mut self,
        characters: Vec<Character>,
        scenes: Vec<Scene>,
        tone: String,
        scene_count: u32,
    ) {
        self.characters = characters;
        self.scenes = scenes;
        self.params.tone = Setting::Fixed(tone);
        self.params.scene_count = Setting::Fixed(scene_count);
        self.phase = Phase::Characters;
        self.last_error = None;
    }

    /// Resolved tone for prompt building; "auto" requests fall back to a
    /// neutral default until analysis fills them in.
    pub fn tone(&self) -> String {
        self.params
            .tone
            .fixed()
            .cloned()
            .unwrap_or_else(|| "gentle and warm".to_string())
    }

    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == id)
    }

    pub fn character_mut(&mut self, id: &str) -> Option<&mut Character> {
        self.characters.iter_mut().find(|c| c.id == id)
    }

    pub fn scene(&self, id: u32) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.id == id)
    }

    pub fn scene_mut(&mut self, id: u32) -> Option<&mut Scene> {
        self.scenes.iter_mut().find(|s| s.id == id)
    }

    /// Append a user-created character with a fresh unique id. The model
    /// picks its own ids at analysis time, so minted ids skip anything
    /// already in the roster.
    pub fn add_character(&mut self, name: &str, description: &str) -> String {
        loop {
            self.next_character_id += 1;
            let id = format!("char-{}", self.next_character_id);
            if self.character(&id).is_none() {
                self.characters.push(Character::new(&id, name, description));
                return id;
            }
        }
    }

    pub fn remove_character(&mut self, id: &str) -> bool {
        let before = self.characters.len();
        self.characters.retain(|c| c.id != id);
        self.characters.len() != before
    }

    pub fn update_character(&mut self, id: &str, patch: CharacterPatch) -> bool {
        let Some(character) = self.character_mut(id) else {
            return false;
        };
        if let Some(name) = patch.name {
            character.name = name;
        }
        if let Some(description) = patch.description {
            character.description = description;
        }
        if let Some(tweaks) = patch.tweaks {
            character.tweaks = tweaks;
        }
        if let Some(upload_url) = patch.upload_url {
            character.upload_url = upload_url;
        }
        true
    }

    pub fn update_scene(&mut self, id: u32, patch: ScenePatch) -> bool {
        let Some(scene) = self.scene_mut(id) else {
            return false;
        };
        if let Some(story_text) = patch.story_text {
            scene.story_text = story_text;
        }
        if let Some(description) = patch.description {
            scene.description = description;
        }
        if let Some(sliders) = patch.sliders {
            scene.sliders = sliders;
        }
        true
    }

    /// Page ids still lacking an illustration, in book order.
    pub fn pending_scene_ids(&self) -> Vec<u32> {
        self.scenes
            .iter()
            .filter(|s| s.image_url.is_none())
            .map(|s| s.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(id: u32) -> Scene {
        Scene {
            id,
            story_text: format!("page {}", id),
            description: format!("drawing of page {}", id),
            image_url: None,
            is_generating: false,
            sliders: None,
        }
    }

    #[test]
    fn test_tweaks_flatten_skips_empty_fields() {
        let tweaks = Tweaks {
            hair: "curly red".to_string(),
            clothing: String::new(),
            appearance: "  ".to_string(),
            personality: "shy".to_string(),
            accessory: String::new(),
        };
        assert_eq!(
            tweaks.flatten().as_deref(),
            Some("hair: curly red, personality: shy")
        );
        assert_eq!(Tweaks::default().flatten(), None);
    }

    #[test]
    fn test_sliders_clause_and_clamping() {
        let sliders = Sliders::new(0, 11, 5, 1, 10);
        assert_eq!(sliders.clause(), "Tone:1, Excitement:10, Happiness:5, Energy:1, Tension:10");
    }

    #[test]
    fn test_add_character_ids_stay_unique_after_removal() {
        let mut session = Session::new();
        let a = session.add_character("Mia", "a small fox");
        let b = session.add_character("Bo", "a turtle");
        session.remove_character(&a);
        let c = session.add_character("Pip", "a sparrow");
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(session.characters.len(), 2);
    }

    #[test]
    fn test_add_character_skips_model_assigned_ids() {
        let mut session = Session::new();
        session.apply_analysis(
            vec![
                Character::new("char-1", "Mia", "a small fox"),
                Character::new("char-2", "Bo", "a turtle"),
            ],
            vec![scene(1)],
            "whimsical".to_string(),
            1,
        );

        let added = session.add_character("Pip", "a sparrow");
        assert_eq!(added, "char-3");
        let mut ids: Vec<&str> = session.characters.iter().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), session.characters.len());
    }

    #[test]
    fn test_update_character_by_id() {
        let mut session = Session::new();
        let id = session.add_character("Mia", "a small fox");

        let applied = session.update_character(
            &id,
            CharacterPatch {
                tweaks: Some(Tweaks {
                    hair: "white tuft".to_string(),
                    ..Tweaks::default()
                }),
                upload_url: Some(Some("data:image/png;base64,QUJD".to_string())),
                ..CharacterPatch::default()
            },
        );
        assert!(applied);

        let character = session.character(&id).unwrap();
        assert_eq!(character.name, "Mia");
        assert_eq!(character.tweaks.hair, "white tuft");
        assert_eq!(character.upload_url.as_deref(), Some("data:image/png;base64,QUJD"));

        assert!(!session.update_character("missing", CharacterPatch::default()));
    }

    #[test]
    fn test_update_scene_can_clear_sliders() {
        let mut session = Session::new();
        session.scenes = vec![scene(1)];
        session.update_scene(
            1,
            ScenePatch {
                sliders: Some(Some(Sliders::new(2, 8, 3, 9, 4))),
                ..ScenePatch::default()
            },
        );
        assert!(session.scene(1).unwrap().sliders.is_some());

        session.update_scene(
            1,
            ScenePatch {
                sliders: Some(None),
                ..ScenePatch::default()
            },
        );
        assert!(session.scene(1).unwrap().sliders.is_none());
    }

    #[test]
    fn test_apply_analysis_resolves_auto_params() {
        let mut session = Session::new();
        session.params.story = "Once upon a time".to_string();
        session.apply_analysis(
            vec![Character::new("char1", "Mia", "a small fox")],
            vec![scene(1), scene(2)],
            "whimsical".to_string(),
            2,
        );

        assert_eq!(session.phase, Phase::Characters);
        assert_eq!(session.params.tone, Setting::Fixed("whimsical".to_string()));
        assert_eq!(session.params.scene_count, Setting::Fixed(2));
        assert_eq!(session.tone(), "whimsical");
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut session = Session::new();
        session.params.story = "story".to_string();
        session.add_character("Mia", "a fox");
        session.scenes = vec![scene(1)];
        session.phase = Phase::Scenes;
        session.api_calls = 7;

        session.reset();

        assert_eq!(session.phase, Phase::Input);
        assert!(session.characters.is_empty());
        assert!(session.scenes.is_empty());
        assert_eq!(session.api_calls, 0);
    }

    #[test]
    fn test_pending_scene_ids_in_page_order() {
        let mut session = Session::new();
        session.scenes = vec![scene(1), scene(2), scene(3)];
        session.scenes[1].image_url = Some("data:image/png;base64,QUJD".to_string());
        assert_eq!(session.pending_scene_ids(), vec![1, 3]);
    }
}
