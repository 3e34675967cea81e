use crate::generation::parse_image_data_uri;
use crate::session::{Character, Scene};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Write the book script: one "PAGE N" block per scene, in page order.
pub fn write_script(scenes: &[Scene], dir: &Path) -> Result<PathBuf> {
    let mut script = String::new();
    for scene in scenes {
        script.push_str(&format!("PAGE {}\n{}\n\n", scene.id, scene.story_text));
    }
    let path = dir.join("script.txt");
    fs::write(&path, script).with_context(|| format!("failed to write {:?}", path))?;
    Ok(path)
}

/// Re-encode every generated page illustration as JPEG (quality 95) and
/// write them as page_NN.jpg. Pages without an image are skipped.
pub fn export_page_images(scenes: &[Scene], dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for scene in scenes {
        let Some(uri) = &scene.image_url else { continue };
        let Some((_, payload)) = parse_image_data_uri(uri) else {
            continue;
        };
        let bytes = STANDARD
            .decode(payload)
            .with_context(|| format!("invalid image data on page {}", scene.id))?;
        let img = image::load_from_memory(&bytes)
            .with_context(|| format!("undecodable image on page {}", scene.id))?;

        let path = dir.join(format!("page_{:02}.jpg", scene.id));
        let file = fs::File::create(&path)?;
        let mut writer = BufWriter::new(file);
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, 95);
        // JPEG has no alpha channel.
        img.to_rgb8()
            .write_with_encoder(encoder)
            .with_context(|| format!("failed to encode page {}", scene.id))?;
        written.push(path);
    }
    Ok(written)
}

/// Write generated reference sheets as PNG files, named by character id.
pub fn export_character_sheets(characters: &[Character], dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for character in characters {
        let Some(uri) = &character.sheet_url else { continue };
        let Some((_, payload)) = parse_image_data_uri(uri) else {
            continue;
        };
        let bytes = STANDARD
            .decode(payload)
            .with_context(|| format!("invalid sheet data for {}", character.name))?;
        let path = dir.join(format!("sheet_{}.png", character.id));
        fs::write(&path, bytes).with_context(|| format!("failed to write {:?}", path))?;
        written.push(path);
    }
    Ok(written)
}
