use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::PipelineError;

pub const DEFAULT_SECTION_START: &str = "### Weekly Reward Choices";
pub const DEFAULT_SECTION_END: &str = "### End of Weekly Reward Choices";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionMarkers {
    pub start: String,
    pub end: String,
}

impl Default for SectionMarkers {
    fn default() -> Self {
        Self {
            start: DEFAULT_SECTION_START.to_string(),
            end: DEFAULT_SECTION_END.to_string(),
        }
    }
}

/// Inclusive line range of the reward section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionBounds {
    pub start: usize,
    pub end: usize,
}

impl SectionBounds {
    pub fn contains(&self, idx: usize) -> bool {
        idx >= self.start && idx <= self.end
    }
}

pub fn locate_section(
    doc: &Document,
    markers: &SectionMarkers,
) -> Result<SectionBounds, PipelineError> {
    let mut start = None;
    for (idx, line) in doc.lines().iter().enumerate() {
        let trimmed = line.trim();
        if start.is_none() && trimmed.contains(markers.start.as_str()) {
            start = Some(idx);
        }
        if let Some(start) = start {
            if trimmed.contains(markers.end.as_str()) {
                return Ok(SectionBounds { start, end: idx });
            }
        }
    }
    let marker = if start.is_none() {
        &markers.start
    } else {
        &markers.end
    };
    Err(PipelineError::SectionNotFound {
        marker: marker.clone(),
    })
}
