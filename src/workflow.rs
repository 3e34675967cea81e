use crate::config::Config;
use crate::gemini::GenAiError;
use crate::generation::GenerationClient;
use crate::session::{
    AgeGroup, CharacterPatch, Phase, ScenePatch, Session, Setting, StoryParams,
};
use anyhow::{bail, Result};
use indicatif::ProgressBar;
use std::sync::{Arc, Mutex, MutexGuard};

/// Drives the session through Input -> Analysis -> Characters -> Scenes.
///
/// The session sits behind a mutex that is never held across an await:
/// every generation call snapshots what it needs, runs, then re-locks and
/// mutates only its own entity by id. A completion that lands after a
/// reset finds no entity and is dropped.
#[derive(Clone)]
pub struct WorkflowManager {
    config: Config,
    generation: Arc<GenerationClient>,
    session: Arc<Mutex<Session>>,
}

impl WorkflowManager {
    pub fn new(config: Config, generation: GenerationClient) -> Self {
        Self {
            config,
            generation: Arc::new(generation),
            session: Arc::new(Mutex::new(Session::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().expect("session mutex poisoned")
    }

    /// Read-only view for the presentation layer.
    pub fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.lock())
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Discard the whole session. In-flight calls resolve against the
    /// fresh session, find no matching entity, and mutate nothing.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Submit the story for analysis. On success the session advances to
    /// Characters; on failure it falls back to Input with the error
    /// recorded, everything else untouched.
    pub async fn analyze(
        &self,
        story: String,
        age_group: AgeGroup,
        tone: Setting<String>,
        scene_count: Setting<u32>,
    ) -> Result<()> {
        if story.trim().is_empty() {
            bail!("story text is empty");
        }
        {
            let mut session = self.lock();
            session.params = StoryParams {
                story: story.clone(),
                age_group,
                tone: tone.clone(),
                scene_count: scene_count.clone(),
            };
            session.phase = Phase::Analysis;
            session.last_error = None;
        }

        let result = self.generation.analyze_story(&story, &scene_count, &tone).await;

        let mut session = self.lock();
        if session.phase != Phase::Analysis {
            // Reset while the call was in flight; drop the result.
            return Ok(());
        }
        session.api_calls += 1;
        match result {
            Ok(analysis) => {
                log::info!(
                    "analysis complete: {} pages, {} characters, tone '{}'",
                    analysis.scenes.len(),
                    analysis.characters.len(),
                    analysis.tone
                );
                session.apply_analysis(
                    analysis.characters,
                    analysis.scenes,
                    analysis.tone,
                    analysis.scene_count,
                );
                Ok(())
            }
            Err(e) => {
                session.phase = Phase::Input;
                session.last_error = Some(user_message(&e));
                Err(e)
            }
        }
    }

    /// Generate (or regenerate) one character's reference sheet. Allowed
    /// while in Characters or Scenes; never changes phase. Safe to run
    /// concurrently for different characters.
    pub async fn generate_character_sheet(&self, id: &str) -> Result<()> {
        let (character, tone, style) = {
            let mut session = self.lock();
            if !matches!(session.phase, Phase::Characters | Phase::Scenes) {
                bail!("no characters yet; analyze a story first");
            }
            let tone = session.tone();
            let style = session.params.age_group.style_tags().to_string();
            let Some(character) = session.character_mut(id) else {
                bail!("unknown character id: {}", id);
            };
            character.is_generating = true;
            (character.clone(), tone, style)
        };

        let result = self
            .generation
            .generate_character_sheet(&character, &tone, &style)
            .await;

        let mut session = self.lock();
        let found = match session.character_mut(id) {
            Some(c) => {
                c.is_generating = false;
                true
            }
            None => false,
        };
        if !found {
            return Ok(());
        }
        session.api_calls += 1;
        match result {
            Ok(uri) => {
                if let Some(c) = session.character_mut(id) {
                    c.sheet_url = Some(uri);
                }
                Ok(())
            }
            Err(e) => {
                session.last_error = Some(user_message(&e));
                Err(e)
            }
        }
    }

    /// Illustrate every page that has no image yet, strictly one at a
    /// time with a pause between calls to stay inside the per-minute
    /// image quota. The first failure aborts the remaining pages;
    /// finished pages keep their images and every flag is cleared.
    pub async fn generate_all_scenes(&self) -> Result<()> {
        let pending = {
            let mut session = self.lock();
            if !matches!(session.phase, Phase::Characters | Phase::Scenes) {
                bail!("no pages yet; analyze a story first");
            }
            if session.scenes.is_empty() {
                bail!("the story has no pages");
            }
            session.phase = Phase::Scenes;
            session.pending_scene_ids()
        };

        let bar = ProgressBar::new(pending.len() as u64);
        for (i, id) in pending.iter().enumerate() {
            match self.generate_scene(*id).await {
                // Page gone: the session was reset mid-batch. Stop quietly.
                Ok(false) => {
                    bar.abandon();
                    return Ok(());
                }
                Ok(true) => {}
                Err(e) => {
                    bar.abandon();
                    return Err(e);
                }
            }
            bar.inc(1);
            if i + 1 < pending.len() {
                tokio::time::sleep(self.config.scene_delay()).await;
            }
        }
        bar.finish();
        Ok(())
    }

    /// Regenerate a single page, optionally applying edited text,
    /// description or atmosphere sliders first. Scenes phase only.
    pub async fn regenerate_scene(&self, id: u32, patch: Option<ScenePatch>) -> Result<()> {
        {
            let mut session = self.lock();
            if session.phase != Phase::Scenes {
                bail!("pages have not been generated yet");
            }
            if let Some(patch) = patch {
                if !session.update_scene(id, patch) {
                    bail!("unknown page: {}", id);
                }
            }
        }
        if !self.generate_scene(id).await? {
            bail!("unknown page: {}", id);
        }
        Ok(())
    }

    /// One page's generation: mark busy, call, unmark in both outcomes.
    /// `Ok(false)` means the page no longer exists, before or after the
    /// call; nothing was recorded.
    async fn generate_scene(&self, id: u32) -> Result<bool> {
        let snapshot = {
            let mut session = self.lock();
            let scene = match session.scene_mut(id) {
                Some(s) => {
                    s.is_generating = true;
                    Some(s.clone())
                }
                None => None,
            };
            scene.map(|scene| {
                (
                    scene,
                    session.characters.clone(),
                    session.tone(),
                    session.params.age_group.style_tags().to_string(),
                )
            })
        };
        let Some((scene, characters, tone, style)) = snapshot else {
            return Ok(false);
        };

        let result = self
            .generation
            .generate_scene_image(&scene, &characters, &tone, &style, self.config.use_story_text)
            .await;

        let mut session = self.lock();
        let found = match session.scene_mut(id) {
            Some(s) => {
                s.is_generating = false;
                true
            }
            None => false,
        };
        if !found {
            return Ok(false);
        }
        session.api_calls += 1;
        match result {
            Ok(uri) => {
                if let Some(s) = session.scene_mut(id) {
                    s.image_url = Some(uri);
                }
                Ok(true)
            }
            Err(e) => {
                session.last_error = Some(user_message(&e));
                Err(e)
            }
        }
    }

    // --- Character roster edits (Characters/Scenes phases only) ---

    pub fn add_character(&self, name: &str, description: &str) -> Result<String> {
        let mut session = self.lock();
        self.ensure_editable(&session)?;
        Ok(session.add_character(name, description))
    }

    pub fn remove_character(&self, id: &str) -> Result<()> {
        let mut session = self.lock();
        self.ensure_editable(&session)?;
        if !session.remove_character(id) {
            bail!("unknown character id: {}", id);
        }
        Ok(())
    }

    pub fn update_character(&self, id: &str, patch: CharacterPatch) -> Result<()> {
        let mut session = self.lock();
        self.ensure_editable(&session)?;
        if !session.update_character(id, patch) {
            bail!("unknown character id: {}", id);
        }
        Ok(())
    }

    pub fn update_scene(&self, id: u32, patch: ScenePatch) -> Result<()> {
        let mut session = self.lock();
        if session.phase != Phase::Scenes {
            bail!("pages have not been generated yet");
        }
        if !session.update_scene(id, patch) {
            bail!("unknown page: {}", id);
        }
        Ok(())
    }

    fn ensure_editable(&self, session: &Session) -> Result<()> {
        if !matches!(session.phase, Phase::Characters | Phase::Scenes) {
            bail!("characters can only be edited after analysis");
        }
        Ok(())
    }
}

/// Quota-pattern failures get a friendlier message than the raw chain.
fn user_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<GenAiError>() {
        Some(e) if e.is_quota() => {
            "API quota reached. Wait a minute and try again.".to_string()
        }
        _ => format!("{:#}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::{GenerativeBackend, InlineImage, PromptPart};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    const ANALYSIS_JSON: &str = r#"{
        "scenes": [
            {"id": 1, "storyText": "Mia wakes up.", "description": "A fox in a burrow"},
            {"id": 2, "storyText": "Mia explores.", "description": "A fox in a forest"},
            {"id": 3, "storyText": "Mia sleeps.", "description": "A fox under stars"}
        ],
        "characters": [
            {"id": "c1", "name": "Mia", "description": "a small red fox"}
        ],
        "determinedTone": "cozy",
        "determinedCount": 3
    }"#;

    fn quota_error() -> GenAiError {
        GenAiError::Api {
            status: 429,
            body: "RESOURCE_EXHAUSTED".to_string(),
        }
    }

    fn image(data: &str) -> InlineImage {
        InlineImage {
            mime_type: "image/png".to_string(),
            data: data.to_string(),
        }
    }

    /// Backend scripted per call; image call N takes response N. Optional
    /// gate lets a test hold a call open while it resets the session.
    #[derive(Default)]
    struct MockBackend {
        json_responses: Mutex<Vec<Result<String, GenAiError>>>,
        image_responses: Mutex<Vec<Result<InlineImage, GenAiError>>>,
        image_calls: AtomicU32,
        entered: Option<Arc<Notify>>,
        release: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl GenerativeBackend for MockBackend {
        async fn generate_json(
            &self,
            _model: &str,
            _prompt: &str,
            _schema: &serde_json::Value,
        ) -> Result<String, GenAiError> {
            self.json_responses.lock().unwrap().remove(0)
        }

        async fn generate_image(
            &self,
            _model: &str,
            _parts: &[PromptPart],
            _aspect_ratio: &str,
        ) -> Result<InlineImage, GenAiError> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            if let (Some(entered), Some(release)) = (&self.entered, &self.release) {
                entered.notify_one();
                release.notified().await;
            }
            self.image_responses.lock().unwrap().remove(0)
        }
    }

    fn workflow(backend: MockBackend) -> WorkflowManager {
        let mut config = Config::default();
        config.scene_delay_ms = 0;
        config.text_retry.retries = 0;
        config.image_retry.retries = 0;
        let generation = GenerationClient::new(Arc::new(backend), &config);
        WorkflowManager::new(config, generation)
    }

    async fn analyzed_workflow(backend: MockBackend) -> WorkflowManager {
        {
            backend
                .json_responses
                .lock()
                .unwrap()
                .push(Ok(ANALYSIS_JSON.to_string()));
        }
        let wf = workflow(backend);
        wf.analyze("Once there was a fox.".to_string(), AgeGroup::EarlyReader, Setting::Auto, Setting::Auto)
            .await
            .unwrap();
        wf
    }

    #[tokio::test]
    async fn test_analyze_advances_to_characters() {
        let wf = analyzed_workflow(MockBackend::default()).await;

        wf.with_session(|s| {
            assert_eq!(s.phase, Phase::Characters);
            assert_eq!(s.scenes.len(), 3);
            assert_eq!(s.characters.len(), 1);
            assert_eq!(s.params.tone, Setting::Fixed("cozy".to_string()));
            assert_eq!(s.api_calls, 1);
        });
    }

    #[tokio::test]
    async fn test_analyze_failure_falls_back_to_input() {
        let backend = MockBackend::default();
        backend.json_responses.lock().unwrap().push(Err(GenAiError::Api {
            status: 400,
            body: "bad request".to_string(),
        }));
        let wf = workflow(backend);

        let result = wf
            .analyze("A story.".to_string(), AgeGroup::Toddler, Setting::Auto, Setting::Auto)
            .await;

        assert!(result.is_err());
        wf.with_session(|s| {
            assert_eq!(s.phase, Phase::Input);
            assert!(s.last_error.is_some());
            assert!(s.scenes.is_empty());
        });
    }

    #[tokio::test]
    async fn test_analyze_rejects_empty_story() {
        let wf = workflow(MockBackend::default());
        let result = wf
            .analyze("   ".to_string(), AgeGroup::Adult, Setting::Auto, Setting::Auto)
            .await;
        assert!(result.is_err());
        assert_eq!(wf.phase(), Phase::Input);
    }

    #[tokio::test]
    async fn test_quota_error_gets_quota_message() {
        let backend = MockBackend::default();
        backend.json_responses.lock().unwrap().push(Err(quota_error()));
        let wf = workflow(backend);

        let _ = wf
            .analyze("A story.".to_string(), AgeGroup::Adult, Setting::Auto, Setting::Auto)
            .await;

        wf.with_session(|s| {
            assert!(s.last_error.as_deref().unwrap().contains("quota"));
        });
    }

    #[tokio::test]
    async fn test_generate_all_aborts_batch_on_first_failure() {
        let backend = MockBackend::default();
        {
            let mut responses = backend.image_responses.lock().unwrap();
            responses.push(Ok(image("UEFHRTE")));
            responses.push(Err(GenAiError::NoImageData));
            responses.push(Ok(image("UEFHRTM")));
        }
        let wf = analyzed_workflow(backend).await;

        let result = wf.generate_all_scenes().await;
        assert!(result.is_err());

        wf.with_session(|s| {
            assert_eq!(s.phase, Phase::Scenes);
            let a = s.scene(1).unwrap();
            assert_eq!(a.image_url.as_deref(), Some("data:image/png;base64,UEFHRTE"));
            assert!(!a.is_generating);

            let b = s.scene(2).unwrap();
            assert!(b.image_url.is_none());
            assert!(!b.is_generating);

            // The failure aborts the rest of the batch.
            let c = s.scene(3).unwrap();
            assert!(c.image_url.is_none());
            assert!(!c.is_generating);

            assert!(s.last_error.is_some());
            assert_eq!(s.api_calls, 3, "analysis + two image attempts");
        });
    }

    #[tokio::test]
    async fn test_generate_all_skips_pages_that_have_images() {
        let backend = MockBackend::default();
        {
            let mut responses = backend.image_responses.lock().unwrap();
            responses.push(Ok(image("QQ")));
            responses.push(Ok(image("Qg")));
            responses.push(Ok(image("Qw")));
            // Second run: only page 2 after its image is cleared.
            responses.push(Ok(image("RA")));
        }
        let wf = analyzed_workflow(backend).await;

        wf.generate_all_scenes().await.unwrap();
        wf.with_session(|s| {
            assert!(s.scenes.iter().all(|sc| sc.image_url.is_some()));
        });

        // Drop one image and run again: exactly one more backend call.
        {
            let mut session = wf.lock();
            session.scene_mut(2).unwrap().image_url = None;
        }
        wf.generate_all_scenes().await.unwrap();
        wf.with_session(|s| {
            assert_eq!(s.scene(2).unwrap().image_url.as_deref(), Some("data:image/png;base64,RA"));
        });
    }

    #[tokio::test]
    async fn test_character_sheet_failure_clears_busy_flag() {
        let backend = MockBackend::default();
        backend
            .image_responses
            .lock()
            .unwrap()
            .push(Err(GenAiError::NoImageData));
        let wf = analyzed_workflow(backend).await;

        let result = wf.generate_character_sheet("c1").await;
        assert!(result.is_err());

        wf.with_session(|s| {
            let c = s.character("c1").unwrap();
            assert!(!c.is_generating);
            assert!(c.sheet_url.is_none());
            assert!(s.last_error.is_some());
        });
    }

    #[tokio::test]
    async fn test_character_sheet_success() {
        let backend = MockBackend::default();
        backend
            .image_responses
            .lock()
            .unwrap()
            .push(Ok(image("U0hFRVQ")));
        let wf = analyzed_workflow(backend).await;

        wf.generate_character_sheet("c1").await.unwrap();

        wf.with_session(|s| {
            let c = s.character("c1").unwrap();
            assert_eq!(c.sheet_url.as_deref(), Some("data:image/png;base64,U0hFRVQ"));
            assert!(!c.is_generating);
        });
    }

    #[tokio::test]
    async fn test_reset_while_generation_in_flight_ignores_stale_result() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let backend = MockBackend {
            entered: Some(entered.clone()),
            release: Some(release.clone()),
            ..MockBackend::default()
        };
        backend
            .image_responses
            .lock()
            .unwrap()
            .push(Ok(image("U1RBTEU")));
        let wf = analyzed_workflow(backend).await;

        let task = {
            let wf = wf.clone();
            tokio::spawn(async move { wf.generate_character_sheet("c1").await })
        };

        entered.notified().await;
        wf.reset();
        release.notify_one();

        // The stale completion resolves without touching the new session.
        task.await.unwrap().unwrap();
        wf.with_session(|s| {
            assert_eq!(s.phase, Phase::Input);
            assert!(s.characters.is_empty());
            assert!(s.scenes.is_empty());
            assert_eq!(s.api_calls, 0);
        });
    }

    #[tokio::test]
    async fn test_reset_during_batch_ends_it_without_error() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let backend = MockBackend {
            entered: Some(entered.clone()),
            release: Some(release.clone()),
            ..MockBackend::default()
        };
        // One response only: pages 2 and 3 must never be attempted.
        backend
            .image_responses
            .lock()
            .unwrap()
            .push(Ok(image("U1RBTEU")));
        let wf = analyzed_workflow(backend).await;

        let task = {
            let wf = wf.clone();
            tokio::spawn(async move { wf.generate_all_scenes().await })
        };

        entered.notified().await;
        wf.reset();
        release.notify_one();

        // The batch ends quietly, not with an "unknown page" error.
        task.await.unwrap().unwrap();
        wf.with_session(|s| {
            assert_eq!(s.phase, Phase::Input);
            assert!(s.scenes.is_empty());
            assert!(s.last_error.is_none());
            assert_eq!(s.api_calls, 0);
        });
    }

    #[tokio::test]
    async fn test_regenerate_scene_applies_edits_first() {
        let backend = MockBackend::default();
        {
            let mut responses = backend.image_responses.lock().unwrap();
            responses.push(Ok(image("QQ")));
            responses.push(Ok(image("Qg")));
            responses.push(Ok(image("Qw")));
            responses.push(Ok(image("TkVX")));
        }
        let wf = analyzed_workflow(backend).await;
        wf.generate_all_scenes().await.unwrap();

        wf.regenerate_scene(
            2,
            Some(ScenePatch {
                description: Some("A fox on a hill at dusk".to_string()),
                ..ScenePatch::default()
            }),
        )
        .await
        .unwrap();

        wf.with_session(|s| {
            let scene = s.scene(2).unwrap();
            assert_eq!(scene.description, "A fox on a hill at dusk");
            assert_eq!(scene.image_url.as_deref(), Some("data:image/png;base64,TkVX"));
            assert_eq!(s.phase, Phase::Scenes);
        });
    }

    #[tokio::test]
    async fn test_character_edits_require_analysis() {
        let wf = workflow(MockBackend::default());
        assert!(wf.add_character("Bo", "a turtle").is_err());

        let wf = analyzed_workflow(MockBackend::default()).await;
        let id = wf.add_character("Bo", "a turtle").unwrap();
        wf.update_character(
            &id,
            CharacterPatch {
                description: Some("a wise old turtle".to_string()),
                ..CharacterPatch::default()
            },
        )
        .unwrap();
        wf.remove_character(&id).unwrap();
        wf.with_session(|s| assert_eq!(s.characters.len(), 1));
    }
}
