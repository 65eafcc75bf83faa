//! Reference templates, loaded once at startup and shared read-only.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbaImage;

/// A named reference raster. The category tag groups related templates (all
/// avatar portraits carry `avatar`) so plans can say "every avatar" without
/// listing files.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub category: Option<String>,
    pub image: RgbaImage,
}

/// Immutable registry of templates keyed by name. File-not-found here is a
/// startup-fatal configuration error, never a per-call one.
#[derive(Debug, Default)]
pub struct TemplateLibrary {
    templates: BTreeMap<String, Template>,
}

impl TemplateLibrary {
    /// Loads every `.png`/`.jpg`/`.jpeg` under `dir`. Files in an immediate
    /// subdirectory are tagged with the subdirectory name as their category
    /// (the layout the game assets ship in: `game_elements/avatar/user1.png`).
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("template directory not found: {}", dir.display());
        }
        let mut library = Self::default();
        library.load_level(dir, None)?;
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read template dir: {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let category = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .map(ToString::to_string);
                library.load_level(&path, category)?;
            }
        }
        if library.templates.is_empty() {
            bail!("no template images found under {}", dir.display());
        }
        Ok(library)
    }

    fn load_level(&mut self, dir: &Path, category: Option<String>) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read template dir: {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || !is_image_file(&path) {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .with_context(|| format!("unusable template file name: {}", path.display()))?
                .to_string();
            let image = image::open(&path)
                .with_context(|| format!("failed to load template: {}", path.display()))?
                .to_rgba8();
            self.insert(Template {
                name,
                category: category.clone(),
                image,
            })?;
        }
        Ok(())
    }

    pub fn insert(&mut self, template: Template) -> Result<()> {
        if self.templates.contains_key(&template.name) {
            bail!("duplicate template name: {}", template.name);
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn names_in_category(&self, category: &str) -> Vec<String> {
        self.templates
            .values()
            .filter(|t| t.category.as_deref() == Some(category))
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn is_image_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_png(path: &Path) {
        let img = RgbaImage::from_pixel(4, 4, image::Rgba([10, 20, 30, 255]));
        img.save(path).unwrap();
    }

    #[test]
    fn loads_flat_files_and_categorized_subdirs() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("play_button.png"));
        std::fs::create_dir(dir.path().join("avatar")).unwrap();
        write_png(&dir.path().join("avatar").join("user1.png"));
        write_png(&dir.path().join("avatar").join("user2.png"));
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = TemplateLibrary::load_dir(dir.path()).unwrap();
        assert_eq!(library.len(), 3);
        assert!(library.get("play_button").unwrap().category.is_none());
        assert_eq!(
            library.get("user1").unwrap().category.as_deref(),
            Some("avatar")
        );
        let mut avatars = library.names_in_category("avatar");
        avatars.sort();
        assert_eq!(avatars, vec!["user1", "user2"]);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(TemplateLibrary::load_dir(&missing).is_err());
    }

    #[test]
    fn empty_directory_is_fatal() {
        let dir = tempdir().unwrap();
        assert!(TemplateLibrary::load_dir(dir.path()).is_err());
    }
}
