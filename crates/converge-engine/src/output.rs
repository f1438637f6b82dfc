//! Final output persistence
//!
//! Exactly one write pass per run, after the loop stops. Source files are
//! replaced atomically (sibling temp file + rename) and only when the content
//! actually changed; everything else goes to `output_<base>.txt`.

use crate::sections::SectionMap;
use converge_core::{ConvergeError, Document, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where the final text goes, chosen once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Overwrite the single source file
    InPlace,
    /// Split the response and overwrite each source file
    MultiFile,
    /// Write a new `output_<base>.txt` artifact
    Fallback,
}

impl OutputMode {
    pub fn select(document: &Document, direct_edit: bool) -> Self {
        if !direct_edit || !document.is_programming_file {
            Self::Fallback
        } else if document.spans_multiple_sources() {
            Self::MultiFile
        } else {
            Self::InPlace
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InPlace => write!(f, "in-place"),
            Self::MultiFile => write!(f, "multi-file"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Paths touched by the final write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrittenOutputs {
    /// Source files overwritten with new content
    pub updated: Vec<PathBuf>,
    /// Source files left alone because the content did not change
    pub unchanged: Vec<PathBuf>,
    /// Fallback artifact, if one was written
    pub fallback: Option<PathBuf>,
}

impl WrittenOutputs {
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.updated.iter().chain(self.fallback.iter())
    }
}

/// Writes the final text according to the session's [`OutputMode`]
#[derive(Debug, Clone)]
pub struct OutputWriter {
    output_dir: PathBuf,
}

impl OutputWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// `output_<base>.txt` in the output directory
    pub fn fallback_path(&self, base: &str) -> PathBuf {
        self.output_dir.join(format!("output_{}.txt", base))
    }

    /// Persist the final text
    ///
    /// `sections` is the mapped final response in multi-file mode; without it
    /// the full text goes to the fallback artifact.
    pub async fn write(
        &self,
        mode: OutputMode,
        document: &Document,
        final_text: &str,
        sections: Option<&SectionMap>,
    ) -> Result<WrittenOutputs> {
        let mut written = WrittenOutputs::default();

        match (mode, sections) {
            (OutputMode::InPlace, _) => {
                let target = document.paths().first().map(|p| p.to_path_buf()).ok_or_else(
                    || ConvergeError::Other("Document has no source path".to_string()),
                )?;
                self.replace_source(&target, final_text, &mut written).await?;
            }
            (OutputMode::MultiFile, Some(map)) if !map.mapped.is_empty() => {
                for (path, body) in &map.mapped {
                    self.replace_source(path, body, &mut written).await?;
                }
                let missing: Vec<_> = document
                    .paths()
                    .into_iter()
                    .filter(|p| map.body_for(p).is_none())
                    .collect();
                if !missing.is_empty() {
                    warn!("No section returned for {} file(s), left unchanged", missing.len());
                    written
                        .unchanged
                        .extend(missing.into_iter().map(Path::to_path_buf));
                }
                if let Some(residual) = map.residual.as_deref() {
                    warn!("Response contained text outside known file sections");
                    written.fallback = Some(self.write_fallback(&document.base, residual).await?);
                }
            }
            (OutputMode::MultiFile, _) => {
                warn!("No file sections could be mapped, writing the full response instead");
                written.fallback = Some(self.write_fallback(&document.base, final_text).await?);
            }
            (OutputMode::Fallback, _) => {
                written.fallback = Some(self.write_fallback(&document.base, final_text).await?);
            }
        }

        Ok(written)
    }

    async fn replace_source(
        &self,
        path: &Path,
        content: &str,
        written: &mut WrittenOutputs,
    ) -> Result<()> {
        let current = tokio::fs::read_to_string(path).await.ok();
        if current.as_deref() == Some(content) {
            debug!("{} unchanged, not rewriting", path.display());
            written.unchanged.push(path.to_path_buf());
            return Ok(());
        }

        write_atomic(path, content).await?;
        info!("Updated {}", path.display());
        written.updated.push(path.to_path_buf());
        Ok(())
    }

    async fn write_fallback(&self, base: &str, content: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.fallback_path(base);
        write_atomic(&path, content).await?;
        info!("Wrote {}", path.display());
        Ok(path)
    }
}

/// Replace `path` with `content` so readers never see a partial file.
///
/// An existing file keeps its permissions.
pub async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ConvergeError::Other(format!("Not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.converge-tmp", file_name.to_string_lossy()));

    tokio::fs::write(&tmp, content).await?;
    if let Ok(existing) = tokio::fs::metadata(path).await {
        if let Err(e) = tokio::fs::set_permissions(&tmp, existing.permissions()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::SectionMapper;
    use converge_core::DocumentIdentity;
    use tempfile::TempDir;

    fn source_doc(paths: Vec<PathBuf>) -> Document {
        let identity = if paths.len() == 1 {
            DocumentIdentity::SingleFile(paths[0].clone())
        } else {
            DocumentIdentity::Directory(paths)
        };
        Document {
            content: String::new(),
            identity,
            is_programming_file: true,
            base: "main".to_string(),
        }
    }

    #[test]
    fn test_mode_selection() {
        let single = source_doc(vec!["a.rs".into()]);
        assert_eq!(OutputMode::select(&single, true), OutputMode::InPlace);
        assert_eq!(OutputMode::select(&single, false), OutputMode::Fallback);

        let multi = source_doc(vec!["a.rs".into(), "b.rs".into()]);
        assert_eq!(OutputMode::select(&multi, true), OutputMode::MultiFile);

        let mut prose = source_doc(vec!["a.txt".into()]);
        prose.is_programming_file = false;
        assert_eq!(OutputMode::select(&prose, true), OutputMode::Fallback);
    }

    #[tokio::test]
    async fn test_in_place_overwrites_source() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("main.rs");
        std::fs::write(&src, "fn main() {}").unwrap();

        let writer = OutputWriter::new(tmp.path());
        let written = writer
            .write(OutputMode::InPlace, &source_doc(vec![src.clone()]), "fn main() { run(); }", None)
            .await
            .unwrap();

        assert_eq!(written.updated, vec![src.clone()]);
        assert!(written.fallback.is_none());
        assert_eq!(std::fs::read_to_string(&src).unwrap(), "fn main() { run(); }");
        assert!(!tmp.path().join("output_main.txt").exists());
    }

    #[tokio::test]
    async fn test_in_place_skips_identical_content() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("main.rs");
        std::fs::write(&src, "same").unwrap();

        let written = OutputWriter::new(tmp.path())
            .write(OutputMode::InPlace, &source_doc(vec![src.clone()]), "same", None)
            .await
            .unwrap();
        assert!(written.updated.is_empty());
        assert_eq!(written.unchanged, vec![src]);
    }

    #[tokio::test]
    async fn test_fallback_leaves_source_untouched() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("main.rs");
        std::fs::write(&src, "original").unwrap();
        let out_dir = tmp.path().join("out");

        let written = OutputWriter::new(&out_dir)
            .write(OutputMode::Fallback, &source_doc(vec![src.clone()]), "revised", None)
            .await
            .unwrap();

        let artifact = out_dir.join("output_main.txt");
        assert_eq!(written.fallback, Some(artifact.clone()));
        assert_eq!(std::fs::read_to_string(artifact).unwrap(), "revised");
        assert_eq!(std::fs::read_to_string(src).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_multi_file_writes_each_section() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.rs");
        let b = tmp.path().join("b.rs");
        std::fs::write(&a, "old a\n").unwrap();
        std::fs::write(&b, "old b\n").unwrap();

        let raw = "--- FILE: a.rs\nnew a\n--- FILE: b.rs\nold b\n--- FILE: c.rs\nstray\n";
        let map = SectionMapper::new(vec![a.clone(), b.clone()]).map(raw);

        let written = OutputWriter::new(tmp.path())
            .write(OutputMode::MultiFile, &source_doc(vec![a.clone(), b.clone()]), raw, Some(&map))
            .await
            .unwrap();

        assert_eq!(written.updated, vec![a.clone()]);
        assert_eq!(written.unchanged, vec![b.clone()]);
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "new a\n");

        let residual = std::fs::read_to_string(written.fallback.unwrap()).unwrap();
        assert_eq!(residual, "--- FILE: c.rs\nstray\n");
    }

    #[tokio::test]
    async fn test_multi_file_without_sections_falls_back() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.rs");
        let b = tmp.path().join("b.rs");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();

        let raw = "Sorry, I cannot do that.";
        let map = SectionMapper::new(vec![a.clone(), b.clone()]).map(raw);
        let written = OutputWriter::new(tmp.path())
            .write(OutputMode::MultiFile, &source_doc(vec![a.clone(), b]), raw, Some(&map))
            .await
            .unwrap();

        assert!(written.updated.is_empty());
        let fallback = written.fallback.unwrap();
        assert_eq!(std::fs::read_to_string(fallback).unwrap(), raw);
        assert_eq!(std::fs::read_to_string(a).unwrap(), "a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_in_place_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("deploy.sh");
        std::fs::write(&script, "#!/bin/sh\necho old\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let written = OutputWriter::new(tmp.path())
            .write(
                OutputMode::InPlace,
                &source_doc(vec![script.clone()]),
                "#!/bin/sh\necho new\n",
                None,
            )
            .await
            .unwrap();

        assert_eq!(written.updated, vec![script.clone()]);
        assert_eq!(std::fs::read_to_string(&script).unwrap(), "#!/bin/sh\necho new\n");
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.txt");
        write_atomic(&path, "content").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("file.txt")]);
    }
}
