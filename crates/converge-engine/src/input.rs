//! Input aggregation
//!
//! Turns the command-line targets into one [`Document`]:
//! - a single file is read as-is
//! - a directory contributes its `.utf`/`.txt` files, sorted by name
//! - several explicit source files are labeled with file markers so the
//!   model can answer per file

use crate::sections::render_sections;
use converge_core::{ConvergeError, Document, DocumentIdentity, InputSettings, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fallback base name when no better one can be derived
const DEFAULT_BASE: &str = "input";

/// Reads targets into a [`Document`]
#[derive(Debug, Clone)]
pub struct InputAggregator {
    programming_extensions: Vec<String>,
    directory_extensions: Vec<String>,
}

/// One file that contributes to the document
struct Source {
    path: PathBuf,
    /// Named on the command line rather than found in a directory
    explicit: bool,
}

impl InputAggregator {
    pub fn new(settings: &InputSettings) -> Self {
        Self {
            programming_extensions: settings
                .programming_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            directory_extensions: settings
                .directory_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
        }
    }

    /// Whether `path` has a programming-language extension
    pub fn is_programming_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .is_some_and(|ext| self.programming_extensions.contains(&ext))
    }

    fn is_collected(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_lowercase)
            .is_some_and(|name| self.directory_extensions.iter().any(|ext| name.ends_with(ext)))
    }

    /// Build the document for `targets`
    pub async fn aggregate(&self, targets: &[PathBuf]) -> Result<Document> {
        let first = targets
            .first()
            .ok_or_else(|| ConvergeError::Input("No input path given".to_string()))?;

        let mut sources = Vec::new();
        let mut saw_directory = false;
        for target in targets {
            let meta = tokio::fs::metadata(target).await.map_err(|e| {
                ConvergeError::Input(format!("Cannot access {}: {}", target.display(), e))
            })?;

            if meta.is_dir() {
                saw_directory = true;
                let found = self.collect_directory(target).await?;
                sources.extend(found.into_iter().map(|path| Source {
                    path,
                    explicit: false,
                }));
            } else {
                sources.push(Source {
                    path: target.clone(),
                    explicit: true,
                });
            }
        }

        let mut texts = Vec::with_capacity(sources.len());
        for source in &sources {
            texts.push(read_utf8(&source.path).await?);
        }

        let is_programming_file = sources
            .iter()
            .all(|s| s.explicit && self.is_programming_path(&s.path));
        let single = targets.len() == 1 && !saw_directory;
        let paths: Vec<PathBuf> = sources.iter().map(|s| s.path.clone()).collect();

        let content = if single {
            texts.remove(0)
        } else if is_programming_file {
            let labels: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            render_sections(
                labels
                    .iter()
                    .zip(texts.iter())
                    .map(|(l, t)| (l.as_str(), t.as_str())),
            )
        } else {
            texts.join("\n")
        };

        let identity = if single {
            DocumentIdentity::SingleFile(first.clone())
        } else {
            DocumentIdentity::Directory(paths)
        };

        let document = Document {
            content,
            identity,
            is_programming_file,
            base: base_name(first),
        };

        info!(
            "Loaded {} source file(s) as '{}' ({} chars, policy: {})",
            document.paths().len(),
            document.base,
            document.content.chars().count(),
            document.accumulation_policy()
        );
        Ok(document)
    }

    async fn collect_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            ConvergeError::Input(format!("Cannot read directory {}: {}", dir.display(), e))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && self.is_collected(&path) {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(ConvergeError::Input(format!(
                "No {} files found in {}",
                self.directory_extensions.join("/"),
                dir.display()
            )));
        }

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        debug!("Collected {} files from {}", files.len(), dir.display());
        Ok(files)
    }
}

async fn read_utf8(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ConvergeError::Input(format!("Cannot read {}: {}", path.display(), e)))?;
    String::from_utf8(bytes)
        .map_err(|e| ConvergeError::Input(format!("{} is not valid UTF-8: {}", path.display(), e)))
}

/// Stem used for debug and fallback names: file stem, or directory name
pub fn base_name(target: &Path) -> String {
    let from_path = |p: &Path| -> Option<String> {
        let name = if p.is_dir() {
            p.file_name()
        } else {
            p.file_stem()
        }?;
        Some(name.to_string_lossy().into_owned()).filter(|s| !s.is_empty())
    };

    from_path(target)
        .or_else(|| target.canonicalize().ok().as_deref().and_then(from_path))
        .unwrap_or_else(|| DEFAULT_BASE.to_string())
}
