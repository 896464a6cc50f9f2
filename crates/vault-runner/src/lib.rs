//! Great Vault reward evaluation.
//!
//! A SimC import lists the weekly reward choices as commented option lines
//! between two marker lines. The pipeline parses those options, writes one
//! variant import per option with only that option active, runs the
//! simulator on every variant and ranks the options by mean throughput.

pub mod aggregate;
pub mod config;
pub mod document;
pub mod error;
pub mod rewards;
pub mod scratch;
pub mod section;
pub mod simulate;
pub mod variants;

use std::path::Path;

use tracing::info;

pub use aggregate::{pick_best, rank, Ranking};
pub use config::VaultConfig;
pub use document::{Document, DocumentSource};
pub use error::{PipelineError, VariantError};
pub use rewards::{
    parse_candidates, parse_positions, remove_positions, Candidate, LineMatcher, OrphanPolicy,
    RegexMatcher, RewardFormat,
};
pub use section::{locate_section, SectionBounds, SectionMarkers};
pub use simulate::{
    BatchReport, CancelToken, RunResult, RunnerOptions, SimulationRunner, VariantFailure,
    VariantJob,
};
pub use variants::{
    activate, discover_variants, generate_variants, ConsistencyWarning, GeneratedBatch,
    VariantArtifact,
};

/// A document together with its located and parsed reward section.
#[derive(Debug, Clone)]
pub struct RewardSection {
    pub document: Document,
    pub bounds: SectionBounds,
    pub candidates: Vec<Candidate>,
}

impl RewardSection {
    pub fn parse(document: Document, cfg: &VaultConfig) -> Result<Self, PipelineError> {
        Self::parse_with(document, cfg, &RewardFormat::simc()?)
    }

    pub fn parse_with(
        document: Document,
        cfg: &VaultConfig,
        format: &RewardFormat,
    ) -> Result<Self, PipelineError> {
        let bounds = locate_section(&document, &cfg.markers)?;
        let candidates = parse_candidates(&document, bounds, format, cfg.orphan_policy)?;
        info!(
            start = bounds.start,
            end = bounds.end,
            candidates = candidates.len(),
            "parsed reward section"
        );
        Ok(Self {
            document,
            bounds,
            candidates,
        })
    }

    /// Drops candidates by 1-based position.
    pub fn remove(self, positions: &[usize]) -> Result<Self, PipelineError> {
        let candidates = remove_positions(self.candidates, positions)?;
        Ok(Self { candidates, ..self })
    }

    pub fn generate(&self, scratch: &Path) -> Result<GeneratedBatch, PipelineError> {
        generate_variants(&self.candidates, &self.document, self.bounds, scratch)
    }
}

/// How a full evaluation ended.
#[derive(Debug)]
pub enum Evaluation {
    /// The section had no candidates left to simulate.
    NothingToRun,
    /// Every variant failed or was skipped.
    NoUsableResults {
        generated: GeneratedBatch,
        report: BatchReport,
    },
    Ranked {
        generated: GeneratedBatch,
        report: BatchReport,
        ranking: Ranking,
    },
}

/// Generates, simulates and ranks every candidate of `section`.
pub fn evaluate(
    section: &RewardSection,
    runner: &SimulationRunner,
    cancel: &CancelToken,
) -> Result<Evaluation, PipelineError> {
    if section.candidates.is_empty() {
        info!("no reward candidates to simulate");
        return Ok(Evaluation::NothingToRun);
    }
    let generated = section.generate(&runner.options().scratch_dir)?;
    let jobs: Vec<VariantJob> = generated.variants.iter().map(VariantJob::from).collect();
    let report = runner.run_jobs(&jobs, cancel)?;
    match rank(&report.results) {
        Some(ranking) => {
            info!(
                label = %ranking.best.label,
                mean = ranking.best.mean,
                "best reward"
            );
            Ok(Evaluation::Ranked {
                generated,
                report,
                ranking,
            })
        }
        None => {
            info!("no usable simulation results");
            Ok(Evaluation::NoUsableResults { generated, report })
        }
    }
}
