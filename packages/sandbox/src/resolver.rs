// ABOUTME: Entry-point resolution for uploaded bundles
// ABOUTME: Checks conventional filenames in priority order, then the manifest's main field

use crate::guard;
use crate::settings::EngineSettings;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where a resolved entry point came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    Convention,
    Manifest,
}

/// Entry file of a bundle, relative to the bundle root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub path: PathBuf,
    pub source: EntrySource,
}

/// Determines what a bundle runs
#[derive(Debug, Clone)]
pub struct EntryPointResolver {
    candidates: Vec<String>,
    manifest_file: String,
    manifest_field: String,
    interpreter: String,
}

impl EntryPointResolver {
    pub fn new(
        candidates: Vec<String>,
        manifest_file: impl Into<String>,
        manifest_field: impl Into<String>,
        interpreter: impl Into<String>,
    ) -> Self {
        Self {
            candidates,
            manifest_file: manifest_file.into(),
            manifest_field: manifest_field.into(),
            interpreter: interpreter.into(),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.entry_candidates.clone(),
            settings.manifest_file.clone(),
            settings.manifest_entry_field.clone(),
            settings.interpreter.clone(),
        )
    }

    /// Resolve the entry point of the bundle rooted at `bundle_root`.
    ///
    /// Returns `None` when neither a conventional file nor a usable manifest
    /// entry exists.
    pub fn resolve(&self, bundle_root: &Path) -> Option<EntryPoint> {
        debug!("Resolving entry point in: {}", bundle_root.display());

        for candidate in &self.candidates {
            if bundle_root.join(candidate).is_file() {
                return Some(EntryPoint {
                    path: PathBuf::from(candidate),
                    source: EntrySource::Convention,
                });
            }
        }

        self.resolve_from_manifest(bundle_root)
    }

    /// Command line that runs `entry` inside the sandbox
    pub fn command(&self, entry: &EntryPoint) -> Vec<String> {
        vec![
            self.interpreter.clone(),
            entry.path.to_string_lossy().into_owned(),
        ]
    }

    /// Explanation used when nothing resolves
    pub fn describe_search(&self) -> String {
        format!(
            "none of [{}] exist and {} has no usable \"{}\" field",
            self.candidates.join(", "),
            self.manifest_file,
            self.manifest_field
        )
    }

    fn resolve_from_manifest(&self, bundle_root: &Path) -> Option<EntryPoint> {
        let manifest_path = bundle_root.join(&self.manifest_file);
        if !manifest_path.is_file() {
            return None;
        }

        let content = match fs::read_to_string(&manifest_path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {}", manifest_path.display(), e);
                return None;
            }
        };

        let manifest: Value = match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Invalid manifest {}: {}", manifest_path.display(), e);
                return None;
            }
        };

        let main = manifest
            .get(&self.manifest_field)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())?;

        // The manifest is untrusted: its entry must stay inside the bundle
        let resolved = guard::resolve_within(bundle_root, main).ok()?;
        if !resolved.is_file() {
            debug!(
                "Manifest entry {:?} does not name a file in {}",
                main,
                bundle_root.display()
            );
            return None;
        }

        let canonical_root = bundle_root.canonicalize().ok()?;
        let relative = resolved.strip_prefix(&canonical_root).ok()?;

        Some(EntryPoint {
            path: relative.to_path_buf(),
            source: EntrySource::Manifest,
        })
    }
}

impl Default for EntryPointResolver {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write(root: &Path, name: &str, content: &str) {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_first_candidate_wins() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "server.js", "");
        write(root, "app.js", "");
        write(root, "index.js", "");

        let entry = EntryPointResolver::default().resolve(root).unwrap();
        assert_eq!(entry.path, PathBuf::from("index.js"));
        assert_eq!(entry.source, EntrySource::Convention);
    }

    #[test]
    fn test_priority_order() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "server.js", "");
        write(root, "app.js", "");

        let entry = EntryPointResolver::default().resolve(root).unwrap();
        assert_eq!(entry.path, PathBuf::from("app.js"));
    }

    #[test]
    fn test_convention_beats_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "server.js", "");
        write(root, "bot/main.js", "");
        write(root, "package.json", r#"{"main": "bot/main.js"}"#);

        let entry = EntryPointResolver::default().resolve(root).unwrap();
        assert_eq!(entry.path, PathBuf::from("server.js"));
    }

    #[test]
    fn test_manifest_main_field() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "src/bot.js", "");
        write(
            root,
            "package.json",
            r#"{"name": "my-bot", "main": "./src/bot.js"}"#,
        );

        let resolver = EntryPointResolver::default();
        let entry = resolver.resolve(root).unwrap();
        assert_eq!(entry.path, PathBuf::from("src/bot.js"));
        assert_eq!(entry.source, EntrySource::Manifest);
        assert_eq!(resolver.command(&entry), vec!["node", "src/bot.js"]);
    }

    #[test]
    fn test_candidate_directory_is_not_an_entry() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("index.js")).unwrap();

        assert_eq!(EntryPointResolver::default().resolve(root), None);
    }

    #[test]
    fn test_no_entry_point() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "README.md", "# bot");
        write(root, "package.json", r#"{"name": "my-bot"}"#);

        assert_eq!(EntryPointResolver::default().resolve(root), None);
    }

    #[test]
    fn test_invalid_manifest_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "package.json", "{ not json");

        assert_eq!(EntryPointResolver::default().resolve(root), None);
    }

    #[test]
    fn test_manifest_main_must_exist() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "package.json", r#"{"main": "dist/bot.js"}"#);

        assert_eq!(EntryPointResolver::default().resolve(root), None);
    }

    #[test]
    fn test_manifest_main_cannot_escape_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("bundle");
        write(temp_dir.path(), "outside.js", "");
        write(&root, "package.json", r#"{"main": "../outside.js"}"#);

        assert_eq!(EntryPointResolver::default().resolve(&root), None);
    }

    #[test]
    fn test_custom_conventions() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "main.py", "");

        let resolver = EntryPointResolver::new(
            vec!["main.py".to_string()],
            "pyproject.json",
            "entry",
            "python3",
        );
        let entry = resolver.resolve(root).unwrap();
        assert_eq!(resolver.command(&entry), vec!["python3", "main.py"]);
        assert!(resolver.describe_search().contains("main.py"));
    }
}
