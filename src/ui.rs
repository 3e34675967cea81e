use crate::config::Config;
use crate::export;
use crate::session::{AgeGroup, CharacterPatch, Phase, ScenePatch, Setting, Sliders, Tweaks};
use crate::workflow::WorkflowManager;
use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use inquire::{Confirm, CustomType, Editor, Select, Text};
use std::fs;
use std::path::Path;

/// Top-level interactive loop. Thin on purpose: every state change goes
/// through the workflow, this layer only prompts and prints.
pub async fn run(workflow: WorkflowManager, config: &Config) -> Result<()> {
    println!("story2picturebook - turn a story into an illustrated book");
    loop {
        let keep_going = match workflow.phase() {
            Phase::Input => input_screen(&workflow).await?,
            Phase::Characters | Phase::Scenes => book_menu(&workflow, config).await?,
            // Analysis is awaited inline by input_screen.
            Phase::Analysis => true,
        };
        if !keep_going {
            return Ok(());
        }
    }
}

async fn input_screen(workflow: &WorkflowManager) -> Result<bool> {
    let choice = Select::new("What now?", vec!["Start a new book", "Quit"]).prompt()?;
    if choice == "Quit" {
        return Ok(false);
    }

    let story = Editor::new("Write or paste your story:").prompt()?;

    let age_labels: Vec<&str> = AgeGroup::ALL.iter().map(|a| a.label()).collect();
    let picked = Select::new("Audience:", age_labels).raw_prompt()?;
    let age_group = AgeGroup::ALL[picked.index];

    let tone_input = Text::new("Tone (or 'auto'):")
        .with_default("auto")
        .prompt()?;
    let tone = if tone_input.trim().eq_ignore_ascii_case("auto") {
        Setting::Auto
    } else {
        Setting::Fixed(tone_input.trim().to_string())
    };

    let count_input = Text::new("Page count, 5-40 (or 'auto'):")
        .with_default("auto")
        .prompt()?;
    let scene_count = match count_input.trim().parse::<u32>() {
        Ok(n) => Setting::Fixed(n),
        Err(_) => Setting::Auto,
    };

    println!("Analyzing story...");
    if let Err(e) = workflow.analyze(story, age_group, tone, scene_count).await {
        print_failure(workflow, &e);
    }
    Ok(true)
}

async fn book_menu(workflow: &WorkflowManager, config: &Config) -> Result<bool> {
    print_overview(workflow);

    let scenes_ready = workflow.phase() == Phase::Scenes;
    let mut options = vec![
        "Edit a character",
        "Generate a character sheet",
        "Attach a reference image",
        "Add a character",
        "Remove a character",
        "Generate all pages",
    ];
    if scenes_ready {
        options.push("Regenerate a page");
        options.push("Edit a page");
        options.push("Export the book");
    }
    options.push("Start over");
    options.push("Quit");

    match Select::new("What now?", options).prompt()? {
        "Edit a character" => edit_character(workflow)?,
        "Generate a character sheet" => {
            if let Some(id) = pick_character(workflow)? {
                println!("Generating reference sheet...");
                if let Err(e) = workflow.generate_character_sheet(&id).await {
                    print_failure(workflow, &e);
                }
            }
        }
        "Attach a reference image" => attach_reference(workflow)?,
        "Add a character" => {
            let name = Text::new("Name:").prompt()?;
            let description = Text::new("Visual concept:").prompt()?;
            workflow.add_character(&name, &description)?;
        }
        "Remove a character" => {
            if let Some(id) = pick_character(workflow)? {
                workflow.remove_character(&id)?;
            }
        }
        "Generate all pages" => {
            println!("Illustrating pages (paced to respect the image quota)...");
            if let Err(e) = workflow.generate_all_scenes().await {
                print_failure(workflow, &e);
                println!("Finished pages are kept; run 'Generate all pages' again to continue.");
            }
        }
        "Regenerate a page" => {
            if let Some(id) = pick_scene(workflow)? {
                let patch = scene_edits(workflow, id)?;
                println!("Regenerating page {}...", id);
                if let Err(e) = workflow.regenerate_scene(id, patch).await {
                    print_failure(workflow, &e);
                }
            }
        }
        "Edit a page" => {
            if let Some(id) = pick_scene(workflow)? {
                if let Some(patch) = scene_edits(workflow, id)? {
                    workflow.update_scene(id, patch)?;
                }
            }
        }
        "Export the book" => export_book(workflow, config)?,
        "Start over" => {
            if Confirm::new("Discard the whole book?").with_default(false).prompt()? {
                workflow.reset();
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn print_overview(workflow: &WorkflowManager) {
    workflow.with_session(|s| {
        println!();
        println!(
            "Characters: {} | Pages: {} ({} illustrated) | API calls: {}",
            s.characters.len(),
            s.scenes.len(),
            s.scenes.iter().filter(|sc| sc.image_url.is_some()).count(),
            s.api_calls
        );
        for c in &s.characters {
            let sheet = if c.sheet_url.is_some() { "sheet ready" } else { "no sheet" };
            println!("  {} - {} [{}]", c.name, c.description, sheet);
        }
    });
}

fn print_failure(workflow: &WorkflowManager, err: &anyhow::Error) {
    let message = workflow.with_session(|s| s.last_error.clone());
    match message {
        Some(m) => eprintln!("Failed: {}", m),
        None => eprintln!("Failed: {:#}", err),
    }
}

fn pick_character(workflow: &WorkflowManager) -> Result<Option<String>> {
    let entries: Vec<(String, String)> = workflow.with_session(|s| {
        s.characters
            .iter()
            .map(|c| (c.id.clone(), format!("{} - {}", c.name, c.description)))
            .collect()
    });
    if entries.is_empty() {
        println!("No characters.");
        return Ok(None);
    }
    let labels: Vec<String> = entries.iter().map(|(_, label)| label.clone()).collect();
    let picked = Select::new("Which character?", labels).raw_prompt()?;
    Ok(Some(entries[picked.index].0.clone()))
}

fn pick_scene(workflow: &WorkflowManager) -> Result<Option<u32>> {
    let entries: Vec<(u32, String)> = workflow.with_session(|s| {
        s.scenes
            .iter()
            .map(|sc| {
                let status = if sc.image_url.is_some() { "illustrated" } else { "pending" };
                (sc.id, format!("Page {} ({}): {}", sc.id, status, truncate(&sc.story_text, 60)))
            })
            .collect()
    });
    if entries.is_empty() {
        println!("No pages.");
        return Ok(None);
    }
    let labels: Vec<String> = entries.iter().map(|(_, label)| label.clone()).collect();
    let picked = Select::new("Which page?", labels).raw_prompt()?;
    Ok(Some(entries[picked.index].0))
}

fn edit_character(workflow: &WorkflowManager) -> Result<()> {
    let Some(id) = pick_character(workflow)? else {
        return Ok(());
    };
    let (name, description, tweaks) = workflow.with_session(|s| {
        let c = s.character(&id).cloned();
        c.map(|c| (c.name, c.description, c.tweaks))
            .unwrap_or_default()
    });

    let name = Text::new("Name:").with_initial_value(&name).prompt()?;
    let description = Text::new("Visual concept:")
        .with_initial_value(&description)
        .prompt()?;
    let tweaks = Tweaks {
        hair: Text::new("Hair:").with_initial_value(&tweaks.hair).prompt()?,
        clothing: Text::new("Clothing:").with_initial_value(&tweaks.clothing).prompt()?,
        appearance: Text::new("Appearance:").with_initial_value(&tweaks.appearance).prompt()?,
        personality: Text::new("Personality:").with_initial_value(&tweaks.personality).prompt()?,
        accessory: Text::new("Accessory:").with_initial_value(&tweaks.accessory).prompt()?,
    };

    workflow.update_character(
        &id,
        CharacterPatch {
            name: Some(name),
            description: Some(description),
            tweaks: Some(tweaks),
            upload_url: None,
        },
    )?;
    Ok(())
}

fn attach_reference(workflow: &WorkflowManager) -> Result<()> {
    let Some(id) = pick_character(workflow)? else {
        return Ok(());
    };
    let path_input = Text::new("Image file (png/jpg/webp):").prompt()?;
    let path = Path::new(path_input.trim());

    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => {
            eprintln!("Unsupported file type.");
            return Ok(());
        }
    };
    let bytes = fs::read(path)?;
    let uri = format!("data:{};base64,{}", mime, STANDARD.encode(&bytes));

    workflow.update_character(
        &id,
        CharacterPatch {
            upload_url: Some(Some(uri)),
            ..CharacterPatch::default()
        },
    )?;
    println!("Reference attached.");
    Ok(())
}

/// Collect optional page edits: text, description, atmosphere sliders.
fn scene_edits(workflow: &WorkflowManager, id: u32) -> Result<Option<ScenePatch>> {
    let current = workflow.with_session(|s| s.scene(id).cloned());
    let Some(current) = current else {
        return Ok(None);
    };

    if !Confirm::new("Edit this page before generating?")
        .with_default(false)
        .prompt()?
    {
        return Ok(None);
    }

    let story_text = Text::new("Page text:")
        .with_initial_value(&current.story_text)
        .prompt()?;
    let description = Text::new("Illustration description:")
        .with_initial_value(&current.description)
        .prompt()?;

    let sliders = if Confirm::new("Set atmosphere sliders (1-10)?")
        .with_default(false)
        .prompt()?
    {
        let axis = |label: &str| -> Result<u8> {
            Ok(CustomType::<u8>::new(label).with_default(5).prompt()?)
        };
        Some(Some(Sliders::new(
            axis("Tone:")?,
            axis("Excitement:")?,
            axis("Happiness:")?,
            axis("Energy:")?,
            axis("Tension:")?,
        )))
    } else {
        None
    };

    Ok(Some(ScenePatch {
        story_text: Some(story_text),
        description: Some(description),
        sliders,
    }))
}

fn export_book(workflow: &WorkflowManager, config: &Config) -> Result<()> {
    let dir = Path::new(&config.output_folder);
    let (scenes, characters) =
        workflow.with_session(|s| (s.scenes.clone(), s.characters.clone()));

    let script = export::write_script(&scenes, dir)?;
    println!("Script: {:?}", script);

    let pages = export::export_page_images(&scenes, dir)?;
    println!("Pages exported: {}", pages.len());

    let sheets = export::export_character_sheets(&characters, dir)?;
    println!("Character sheets exported: {}", sheets.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
