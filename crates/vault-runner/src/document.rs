use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Where a document's text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    File(PathBuf),
    Inline,
}

/// An immutable, line-oriented SimC import.
///
/// Transformations never edit a document in place; they build a new one
/// with [`Document::with_lines`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    source: DocumentSource,
    lines: Vec<String>,
}

impl Document {
    pub fn from_text(text: &str) -> Self {
        Self {
            source: DocumentSource::Inline,
            lines: split_lines(text),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(Self {
            source: DocumentSource::File(path.to_path_buf()),
            lines: split_lines(&text),
        })
    }

    pub fn source(&self) -> &DocumentSource {
        &self.source
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn line(&self, idx: usize) -> Option<&str> {
        self.lines.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Derived document sharing this one's source.
    pub fn with_lines(&self, lines: Vec<String>) -> Self {
        Self {
            source: self.source.clone(),
            lines,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<(), PipelineError> {
        fs::write(path, self.to_text()).map_err(|e| PipelineError::io(path, e))
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect()
}
