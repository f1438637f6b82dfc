//! File-section protocol for multi-file responses
//!
//! When one request covers several source files, every file is labeled with a
//! marker line:
//!
//! ```text
//! --- FILE: src/lib.rs
//! <full file content>
//! --- FILE: src/main.rs
//! <full file content>
//! ```
//!
//! Parsing is tolerant. Comment-style prefixes (`#`, `//`, `;`, `'`, `/*`,
//! `<!--`) are accepted in place of the dashes and the `FILE` token is matched
//! case-insensitively. Anything that cannot be attributed to a known file ends
//! up in the residual, which is never silently dropped.

use converge_core::FileSection;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Marker written in front of every section
pub const MARKER_PREFIX: &str = "--- FILE:";

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?im)^[ \t]*(?:#+|//+|;+|'|-{2,}|/\*+|<!--)[ \t]*file[ \t]*:[ \t]*(.+?)[ \t]*(?:\*/|-->)?[ \t]*\r?$",
        )
        .expect("marker regex is valid")
    })
}

/// Render the marker line for a file label
pub fn marker_line(label: &str) -> String {
    format!("{} {}", MARKER_PREFIX, label)
}

/// Render labeled sections in the marker format
///
/// Each body is terminated with a newline so the next marker starts a line.
pub fn render_sections<'a, I>(sections: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (label, body) in sections {
        out.push_str(&marker_line(label));
        out.push('\n');
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// A response split at marker lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitOutput {
    /// Text before the first marker
    pub preamble: String,
    /// Sections in the order they appear
    pub sections: Vec<FileSection>,
}

/// Split a response into labeled sections
///
/// A section body runs from the line after its marker to the start of the next
/// marker line. Leading blank lines of a body are dropped.
pub fn split_sections(raw: &str) -> SplitOutput {
    let mut markers: Vec<(usize, usize, String)> = Vec::new();
    for caps in marker_regex().captures_iter(raw) {
        let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let label = clean_label(label.as_str());
        if label.is_empty() {
            continue;
        }
        markers.push((whole.start(), whole.end(), label));
    }

    let Some(first) = markers.first() else {
        return SplitOutput {
            preamble: raw.to_string(),
            sections: Vec::new(),
        };
    };

    let preamble = raw[..first.0].to_string();
    let sections = markers
        .iter()
        .enumerate()
        .map(|(idx, (_, end, label))| {
            let stop = markers.get(idx + 1).map(|m| m.0).unwrap_or(raw.len());
            let body = raw[*end..stop].trim_start_matches(['\r', '\n']);
            FileSection {
                label: label.clone(),
                body: body.to_string(),
            }
        })
        .collect();

    SplitOutput { preamble, sections }
}

fn clean_label(label: &str) -> String {
    label
        .trim()
        .trim_end_matches("-->")
        .trim_end_matches("*/")
        .trim()
        .trim_matches(|c| c == '`' || c == '"')
        .to_string()
}

/// Sections attributed to target files, plus what could not be attributed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionMap {
    /// `(target, body)` in target order
    pub mapped: Vec<(PathBuf, String)>,
    /// Unattributed text, with marker lines kept for unmatched sections
    pub residual: Option<String>,
}

impl SectionMap {
    pub fn body_for(&self, path: &Path) -> Option<&str> {
        self.mapped
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, body)| body.as_str())
    }

    /// Canonical text used for convergence: mapped sections in target order,
    /// followed by the residual
    pub fn concatenated(&self) -> String {
        let labels: Vec<String> = self
            .mapped
            .iter()
            .map(|(p, _)| p.display().to_string())
            .collect();
        let mut out = render_sections(
            labels
                .iter()
                .zip(self.mapped.iter())
                .map(|(label, (_, body))| (label.as_str(), body.as_str())),
        );
        if let Some(residual) = &self.residual {
            out.push_str(residual);
        }
        out
    }
}

/// Attributes response sections to a fixed list of target files
#[derive(Debug, Clone)]
pub struct SectionMapper {
    targets: Vec<PathBuf>,
}

impl SectionMapper {
    pub fn new(targets: Vec<PathBuf>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[PathBuf] {
        &self.targets
    }

    /// Map a raw response onto the targets
    ///
    /// Labels match by exact path first, then by file name. The first section
    /// for a target wins; duplicates go to the residual.
    pub fn map(&self, raw: &str) -> SectionMap {
        let split = split_sections(raw);
        let mut assigned: BTreeMap<usize, String> = BTreeMap::new();
        let mut residual = String::new();

        if !split.preamble.trim().is_empty() {
            residual.push_str(&split.preamble);
        }

        for section in split.sections {
            match self.resolve(&section.label, &assigned) {
                Some(idx) => {
                    assigned.insert(idx, section.body);
                }
                None => {
                    tracing::debug!("Unmatched section label: {}", section.label);
                    if !residual.is_empty() && !residual.ends_with('\n') {
                        residual.push('\n');
                    }
                    residual.push_str(&render_sections([(
                        section.label.as_str(),
                        section.body.as_str(),
                    )]));
                }
            }
        }

        let mapped = assigned
            .into_iter()
            .map(|(idx, body)| (self.targets[idx].clone(), body))
            .collect();

        SectionMap {
            mapped,
            residual: (!residual.trim().is_empty()).then_some(residual),
        }
    }

    fn resolve(&self, label: &str, assigned: &BTreeMap<usize, String>) -> Option<usize> {
        let wanted = Path::new(label.trim_start_matches("./"));
        let free = |idx: &usize| !assigned.contains_key(idx);

        let exact = self
            .targets
            .iter()
            .position(|t| t.as_path() == wanted || t.strip_prefix("./").ok() == Some(wanted));
        if let Some(idx) = exact {
            return free(&idx).then_some(idx);
        }

        let name = wanted.file_name()?;
        (0..self.targets.len())
            .filter(free)
            .find(|&idx| self.targets[idx].file_name() == Some(name))
    }
}
