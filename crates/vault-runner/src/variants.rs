use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::document::Document;
use crate::error::PipelineError;
use crate::rewards::Candidate;
use crate::scratch::{
    atomic_write_bytes, clear_files_with_extension, ensure_dir, files_with_extension, sha256_bytes,
};
use crate::section::SectionBounds;

pub const COMMENT_MARKER: &str = "# ";
pub const VARIANT_EXTENSION: &str = "simc";
pub const MANIFEST_FILE: &str = "variants.json";

const DUPLICATE_SEPARATOR: char = '~';

/// Result of activating one candidate in a copy of the source document.
#[derive(Debug, Clone)]
pub struct Activation {
    pub document: Document,
    /// Number of section lines that were uncommented. Anything but 1 means
    /// the parser and the generator disagree about the option line.
    pub matches: usize,
}

/// Raised when a candidate activates zero or several lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyWarning {
    pub label: String,
    pub option_line: String,
    pub matches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantArtifact {
    pub candidate: Candidate,
    pub path: PathBuf,
    pub digest: String,
    pub activated: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GeneratedBatch {
    pub variants: Vec<VariantArtifact>,
    pub warnings: Vec<ConsistencyWarning>,
    pub cleared: usize,
}

fn is_commented(line: &str) -> bool {
    line.trim_start().starts_with(COMMENT_MARKER)
}

fn recomment(line: &str) -> String {
    let body = line
        .trim_start()
        .trim_start_matches(|c| c == '#' || c == ' ')
        .trim_end();
    format!("{}{}", COMMENT_MARKER, body)
}

/// Copy of `doc` with `candidate` uncommented and every other commented
/// line in the section normalised to stay commented.
pub fn activate(doc: &Document, bounds: SectionBounds, candidate: &Candidate) -> Activation {
    let mut matches = 0;
    let lines = doc
        .lines()
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            if !bounds.contains(idx) || !is_commented(line) {
                return line.clone();
            }
            if line.contains(candidate.option_line.as_str()) {
                matches += 1;
                candidate.option_line.clone()
            } else {
                recomment(line)
            }
        })
        .collect();
    Activation {
        document: doc.with_lines(lines),
        matches,
    }
}

fn file_stem_for(label: &str) -> String {
    label
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// File name for the first variant of `label`, e.g. `Signet_of_the_Deep.simc`.
pub fn variant_file_name(label: &str) -> String {
    format!("{}.{}", file_stem_for(label), VARIANT_EXTENSION)
}

fn numbered_file_name(label: &str, occurrence: usize) -> String {
    if occurrence <= 1 {
        variant_file_name(label)
    } else {
        format!(
            "{}{}{}.{}",
            file_stem_for(label),
            DUPLICATE_SEPARATOR,
            occurrence,
            VARIANT_EXTENSION
        )
    }
}

/// Inverse of [`variant_file_name`]; also strips the `~N` suffix given to
/// repeated labels.
pub fn label_from_file_name(name: &str) -> String {
    let stem = name
        .strip_suffix(&format!(".{}", VARIANT_EXTENSION))
        .unwrap_or(name);
    let stem = match stem.rsplit_once(DUPLICATE_SEPARATOR) {
        Some((head, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => head,
        _ => stem,
    };
    stem.replace('_', " ")
}

pub fn label_from_path(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(label_from_file_name)
        .unwrap_or_default()
}

/// Writes one variant per candidate into `scratch`, after clearing the
/// previous generation pass.
pub fn generate_variants(
    candidates: &[Candidate],
    doc: &Document,
    bounds: SectionBounds,
    scratch: &Path,
) -> Result<GeneratedBatch, PipelineError> {
    ensure_dir(scratch)?;
    let cleared = clear_files_with_extension(scratch, VARIANT_EXTENSION)?;
    info!(dir = %scratch.display(), cleared, "cleared previous variants");

    let mut batch = GeneratedBatch {
        cleared,
        ..GeneratedBatch::default()
    };
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut issued: BTreeSet<String> = BTreeSet::new();
    for candidate in candidates {
        let activation = activate(doc, bounds, candidate);
        if activation.matches != 1 {
            warn!(
                target: "vault::consistency",
                label = %candidate.label,
                option = %candidate.option_line,
                matches = activation.matches,
                "option line did not activate exactly one line"
            );
            batch.warnings.push(ConsistencyWarning {
                label: candidate.label.clone(),
                option_line: candidate.option_line.clone(),
                matches: activation.matches,
            });
        }

        let occurrence = seen.entry(file_stem_for(&candidate.label)).or_insert(0);
        *occurrence += 1;
        // A label that already ends in `~N` can claim a numbered name first.
        while issued.contains(&numbered_file_name(&candidate.label, *occurrence)) {
            *occurrence += 1;
        }
        let file_name = numbered_file_name(&candidate.label, *occurrence);
        issued.insert(file_name.clone());
        let path = scratch.join(file_name);
        let text = activation.document.to_text();
        atomic_write_bytes(&path, text.as_bytes())?;
        info!(label = %candidate.label, file = %path.display(), "generated variant");

        batch.variants.push(VariantArtifact {
            candidate: candidate.clone(),
            path,
            digest: sha256_bytes(text.as_bytes()),
            activated: activation.matches,
        });
    }

    write_manifest(scratch, &batch)?;
    Ok(batch)
}

fn write_manifest(scratch: &Path, batch: &GeneratedBatch) -> Result<(), PipelineError> {
    let variants: Vec<_> = batch
        .variants
        .iter()
        .map(|v| {
            json!({
                "label": v.candidate.label,
                "option_line": v.candidate.option_line,
                "file": v.path.file_name().and_then(|s| s.to_str()),
                "digest": v.digest,
                "activated": v.activated,
            })
        })
        .collect();
    let manifest = json!({
        "schema_version": "vault_variants_v1",
        "created_at": Utc::now().to_rfc3339(),
        "variants": variants,
        "warnings": batch.warnings,
    });
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    atomic_write_bytes(&scratch.join(MANIFEST_FILE), &bytes)
}

/// Variant files currently in `scratch`, sorted by file name.
pub fn discover_variants(scratch: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    files_with_extension(scratch, VARIANT_EXTENSION)
}
