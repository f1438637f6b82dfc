//! Instruction composition
//!
//! The user's instructions are sent unchanged on every request, plus one
//! directive chosen by the output mode. The text is built once per session.

use crate::output::OutputMode;
use crate::sections::MARKER_PREFIX;
use converge_core::Document;

/// Appended when a single source file is edited in place
pub const SOURCE_ONLY_DIRECTIVE: &str = "IMPORTANT: Only return the complete, revised source code file. Do not include any extra text or explanations.";

/// Builds the fixed instruction text for a session
#[derive(Debug, Clone, Copy)]
pub struct InstructionComposer {
    mode: OutputMode,
}

impl InstructionComposer {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    /// Base instructions plus the directive for this mode
    pub fn compose(&self, base: &str, document: &Document) -> String {
        let directive = match self.mode {
            OutputMode::InPlace => SOURCE_ONLY_DIRECTIVE.to_string(),
            OutputMode::MultiFile => section_directive(document),
            OutputMode::Fallback => return base.to_string(),
        };

        format!("{}\n\n{}", base.trim_end(), directive)
    }
}

/// Directive asking for one marked section per source file
fn section_directive(document: &Document) -> String {
    let paths = document.paths();
    let mut directive = format!(
        "IMPORTANT: The input contains {} source files. Return the complete, revised content of every file. \
         Start each file with a line of the form\n{} <filename>\nfollowed by the full file content. \
         Use exactly these filenames:\n",
        paths.len(),
        MARKER_PREFIX
    );
    for path in paths {
        directive.push_str("- ");
        directive.push_str(&path.display().to_string());
        directive.push('\n');
    }
    directive.push_str("Do not include any extra text or explanations.");
    directive
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::DocumentIdentity;
    use std::path::PathBuf;

    fn document(paths: Vec<&str>, programming: bool) -> Document {
        let identity = if paths.len() == 1 {
            DocumentIdentity::SingleFile(PathBuf::from(paths[0]))
        } else {
            DocumentIdentity::Directory(paths.into_iter().map(PathBuf::from).collect())
        };
        Document {
            content: String::new(),
            identity,
            is_programming_file: programming,
            base: "doc".to_string(),
        }
    }

    #[test]
    fn test_in_place_appends_source_directive() {
        let doc = document(vec!["main.rs"], true);
        let text = InstructionComposer::new(OutputMode::InPlace).compose("Fix bugs.\n", &doc);
        assert_eq!(text, format!("Fix bugs.\n\n{}", SOURCE_ONLY_DIRECTIVE));
    }

    #[test]
    fn test_fallback_leaves_instructions_alone() {
        let doc = document(vec!["essay.txt"], false);
        let text = InstructionComposer::new(OutputMode::Fallback).compose("Tighten prose", &doc);
        assert_eq!(text, "Tighten prose");
    }

    #[test]
    fn test_multi_file_lists_every_file() {
        let doc = document(vec!["src/a.rs", "src/b.rs"], true);
        let text = InstructionComposer::new(OutputMode::MultiFile).compose("Refactor", &doc);
        assert!(text.starts_with("Refactor\n\nIMPORTANT: The input contains 2 source files."));
        assert!(text.contains("--- FILE: <filename>"));
        assert!(text.contains("- src/a.rs\n- src/b.rs\n"));
        assert!(!text.contains(SOURCE_ONLY_DIRECTIVE));
    }
}
