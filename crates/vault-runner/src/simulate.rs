use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::error::{PipelineError, VariantError};
use crate::scratch::{ensure_dir, remove_if_exists};
use crate::variants::{label_from_path, VariantArtifact};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOG_TAIL_LINES: usize = 5;

/// Cooperative stop flag shared between the caller and a running batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Throughput statistics of one simulated variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub label: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl RunResult {
    pub fn new(label: impl Into<String>, mean: f64, min: f64, max: f64) -> Self {
        Self {
            label: label.into(),
            mean,
            min,
            max,
        }
    }
}

#[derive(Debug)]
pub struct VariantFailure {
    pub label: String,
    pub variant: PathBuf,
    pub error: VariantError,
}

/// Everything one batch produced. Owned by the caller; nothing is kept
/// between batches.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<RunResult>,
    pub failures: Vec<VariantFailure>,
    /// Labels of variants never started because the batch was cancelled.
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
    pub extra_args: Vec<String>,
    pub output_key: String,
    pub scratch_dir: PathBuf,
    pub output_file: String,
    pub metric: String,
    pub jobs: usize,
    pub timeout: Option<Duration>,
    pub kill_on_cancel: bool,
}

impl RunnerOptions {
    pub fn from_config(program: PathBuf, cfg: &VaultConfig) -> Self {
        Self {
            program,
            leading_args: cfg.simc_args.clone(),
            extra_args: cfg.extra_args.clone(),
            output_key: cfg.output_key.clone(),
            scratch_dir: cfg.scratch_dir.clone(),
            output_file: cfg.output_file.clone(),
            metric: cfg.metric.clone(),
            jobs: cfg.effective_jobs(),
            timeout: cfg.timeout(),
            kill_on_cancel: cfg.kill_on_cancel,
        }
    }
}

/// A variant file and the label its result is reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantJob {
    pub label: String,
    pub path: PathBuf,
}

impl VariantJob {
    /// Label recovered from the file name, for variants found on disk.
    pub fn from_path(path: &Path) -> Self {
        Self {
            label: label_from_path(path),
            path: path.to_path_buf(),
        }
    }
}

impl From<&VariantArtifact> for VariantJob {
    fn from(artifact: &VariantArtifact) -> Self {
        Self {
            label: artifact.candidate.label.clone(),
            path: artifact.path.clone(),
        }
    }
}

type Outcome = (usize, Result<RunResult, VariantError>);

pub struct SimulationRunner {
    options: RunnerOptions,
}

impl SimulationRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    fn logs_dir(&self) -> PathBuf {
        self.options.scratch_dir.join("logs")
    }

    fn pooled_output_dir(&self) -> PathBuf {
        self.options.scratch_dir.join("out")
    }

    fn pooled(&self) -> bool {
        self.options.jobs > 1
    }

    /// Output path for one invocation. Sequential batches share a single
    /// file; pooled batches give every variant its own.
    pub fn output_path_for(&self, variant: &Path) -> PathBuf {
        if self.pooled() {
            self.pooled_output_dir()
                .join(format!("{}.json", variant_stem(variant)))
        } else {
            self.options.scratch_dir.join(&self.options.output_file)
        }
    }

    /// Runs variant files found on disk, labelling them by file name.
    pub fn run_batch(
        &self,
        variants: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<BatchReport, PipelineError> {
        let jobs: Vec<VariantJob> = variants.iter().map(|p| VariantJob::from_path(p)).collect();
        self.run_jobs(&jobs, cancel)
    }

    /// Runs every job once. Per-variant failures are recorded in the report
    /// and never abort the batch.
    pub fn run_jobs(
        &self,
        variants: &[VariantJob],
        cancel: &CancelToken,
    ) -> Result<BatchReport, PipelineError> {
        ensure_dir(&self.options.scratch_dir)?;
        ensure_dir(&self.logs_dir())?;
        if self.pooled() {
            ensure_dir(&self.pooled_output_dir())?;
        }
        let started = Instant::now();
        info!(
            variants = variants.len(),
            jobs = self.options.jobs,
            program = %self.options.program.display(),
            "starting simulation batch"
        );

        let mut outcomes = if self.pooled() {
            self.run_pooled(variants, cancel)
        } else {
            self.run_sequential(variants, cancel)
        };
        outcomes.sort_by_key(|(idx, _)| *idx);

        let mut report = BatchReport::default();
        let mut finished = vec![false; variants.len()];
        for (idx, outcome) in outcomes {
            finished[idx] = true;
            let job = &variants[idx];
            match outcome {
                Ok(result) => report.results.push(result),
                Err(error) => report.failures.push(VariantFailure {
                    label: job.label.clone(),
                    variant: job.path.clone(),
                    error,
                }),
            }
        }
        report.skipped = variants
            .iter()
            .zip(finished)
            .filter(|(_, done)| !done)
            .map(|(job, _)| job.label.clone())
            .collect();
        report.elapsed = started.elapsed();
        info!(
            results = report.results.len(),
            failures = report.failures.len(),
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "simulation batch complete"
        );
        Ok(report)
    }

    fn run_sequential(&self, variants: &[VariantJob], cancel: &CancelToken) -> Vec<Outcome> {
        let mut out = Vec::with_capacity(variants.len());
        for (idx, variant) in variants.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(remaining = variants.len() - idx, "batch cancelled");
                break;
            }
            out.push((idx, self.run_logged(variant, cancel)));
        }
        out
    }

    fn run_pooled(&self, variants: &[VariantJob], cancel: &CancelToken) -> Vec<Outcome> {
        let next = AtomicUsize::new(0);
        let workers = self.options.jobs.min(variants.len()).max(1);
        let (tx, rx) = mpsc::channel::<Outcome>();
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(variant) = variants.get(idx) else {
                        break;
                    };
                    if tx.send((idx, self.run_logged(variant, cancel))).is_err() {
                        break;
                    }
                });
            }
            drop(tx);
            rx.iter().collect()
        })
    }

    fn run_logged(&self, job: &VariantJob, cancel: &CancelToken) -> Result<RunResult, VariantError> {
        info!(label = %job.label, variant = %job.path.display(), "running simulator");
        let outcome = self.run_one(job, cancel);
        match &outcome {
            Ok(result) => info!(
                label = %result.label,
                mean = result.mean,
                min = result.min,
                max = result.max,
                "processed variant"
            ),
            Err(error) => warn!(
                label = %job.label,
                variant = %job.path.display(),
                error = %error,
                log_tail = %log_tail(&self.log_path_for(&job.path)),
                "simulation failed; skipping variant"
            ),
        }
        outcome
    }

    fn log_path_for(&self, variant: &Path) -> PathBuf {
        self.logs_dir()
            .join(format!("{}.log", variant_stem(variant)))
    }

    fn command_for(&self, variant: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.options.program);
        cmd.args(&self.options.leading_args);
        cmd.arg(variant);
        cmd.args(&self.options.extra_args);
        cmd.arg(format!("{}={}", self.options.output_key, output.display()));
        cmd
    }

    /// One simulator invocation followed by output parsing.
    pub fn run_one(&self, job: &VariantJob, cancel: &CancelToken) -> Result<RunResult, VariantError> {
        let variant = job.path.as_path();
        let output = self.output_path_for(variant);
        // a stale file would be mistaken for this run's output
        remove_if_exists(&output)?;

        let log = fs::File::create(self.log_path_for(variant))?;
        let mut cmd = self.command_for(variant, &output);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log.try_clone()?));
        cmd.stderr(Stdio::from(log));
        debug!(command = ?cmd, "spawning simulator");

        let status = self.wait(cmd, cancel)?;
        if !status.success() {
            return Err(VariantError::NonZeroExit {
                code: status.code(),
            });
        }
        if !output.exists() {
            return Err(VariantError::MissingOutput { path: output });
        }
        let bytes = fs::read(&output)?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|source| {
            VariantError::MalformedOutput {
                path: output.clone(),
                source,
            }
        })?;
        let (mean, min, max) = match extract_metric(&value, &self.options.metric) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(
                    variant = %variant.display(),
                    raw = %serde_json::to_string_pretty(&value).unwrap_or_default(),
                    "no player data in simulator output"
                );
                return Err(e);
            }
        };
        Ok(RunResult::new(job.label.clone(), mean, min, max))
    }

    fn wait(&self, mut cmd: Command, cancel: &CancelToken) -> Result<ExitStatus, VariantError> {
        let mut child = cmd.spawn().map_err(VariantError::Spawn)?;
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if self.options.kill_on_cancel && cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(VariantError::Killed);
            }
            if let Some(limit) = self.options.timeout {
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(VariantError::TimedOut {
                        millis: limit.as_millis() as u64,
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Reads `mean`/`min`/`max` of `collected_data.<metric>` from the first
/// player. Missing statistics count as zero; a missing player is an error.
pub fn extract_metric(report: &Value, metric: &str) -> Result<(f64, f64, f64), VariantError> {
    let player = report
        .pointer("/sim/players/0")
        .ok_or(VariantError::NoEntity)?;
    let stats = player.get("collected_data").and_then(|c| c.get(metric));
    let field = |name: &str| {
        stats
            .and_then(|s| s.get(name))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    };
    Ok((field("mean"), field("min"), field("max")))
}

fn variant_stem(variant: &Path) -> String {
    variant
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("variant")
        .to_string()
}

fn log_tail(path: &Path) -> String {
    let Ok(text) = fs::read_to_string(path) else {
        return String::new();
    };
    let mut tail: Vec<&str> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(LOG_TAIL_LINES)
        .collect();
    tail.reverse();
    tail.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(scratch: &Path, jobs: usize) -> RunnerOptions {
        RunnerOptions {
            program: PathBuf::from("simc"),
            leading_args: vec!["--profile".to_string()],
            extra_args: vec!["iterations=100".to_string()],
            output_key: "json2".to_string(),
            scratch_dir: scratch.to_path_buf(),
            output_file: "data.json".to_string(),
            metric: "dps".to_string(),
            jobs,
            timeout: None,
            kill_on_cancel: true,
        }
    }

    #[test]
    fn extract_metric_reads_first_player() {
        let report = json!({
            "sim": { "players": [
                { "collected_data": { "dps": { "mean": 1500.5, "min": 1200.0, "max": 1800.25 } } },
                { "collected_data": { "dps": { "mean": 1.0, "min": 1.0, "max": 1.0 } } }
            ] }
        });
        assert_eq!(
            extract_metric(&report, "dps").expect("stats"),
            (1500.5, 1200.0, 1800.25)
        );
    }

    #[test]
    fn extract_metric_defaults_missing_fields_to_zero() {
        let report = json!({ "sim": { "players": [ { "collected_data": { "dps": { "mean": 10 } } } ] } });
        assert_eq!(extract_metric(&report, "dps").expect("stats"), (10.0, 0.0, 0.0));
        let bare = json!({ "sim": { "players": [ {} ] } });
        assert_eq!(extract_metric(&bare, "dps").expect("stats"), (0.0, 0.0, 0.0));
    }

    #[test]
    fn extract_metric_supports_other_metrics() {
        let report = json!({ "sim": { "players": [ { "collected_data": { "hps": { "mean": 7, "min": 5, "max": 9 } } } ] } });
        assert_eq!(extract_metric(&report, "hps").expect("stats"), (7.0, 5.0, 9.0));
    }

    #[test]
    fn extract_metric_without_player_is_no_entity() {
        for report in [json!({}), json!({ "sim": {} }), json!({ "sim": { "players": [] } })] {
            assert!(matches!(
                extract_metric(&report, "dps"),
                Err(VariantError::NoEntity)
            ));
        }
    }

    #[test]
    fn sequential_batches_share_one_output_path() {
        let runner = SimulationRunner::new(options(Path::new("/tmp/vault"), 1));
        let a = runner.output_path_for(Path::new("/tmp/vault/A.simc"));
        let b = runner.output_path_for(Path::new("/tmp/vault/B.simc"));
        assert_eq!(a, PathBuf::from("/tmp/vault/data.json"));
        assert_eq!(a, b);
    }

    #[test]
    fn pooled_batches_use_distinct_output_paths() {
        let runner = SimulationRunner::new(options(Path::new("/tmp/vault"), 4));
        let a = runner.output_path_for(Path::new("/tmp/vault/A.simc"));
        let b = runner.output_path_for(Path::new("/tmp/vault/B~2.simc"));
        assert_eq!(a, PathBuf::from("/tmp/vault/out/A.json"));
        assert_eq!(b, PathBuf::from("/tmp/vault/out/B~2.json"));
    }

    #[test]
    fn command_orders_arguments() {
        let runner = SimulationRunner::new(options(Path::new("/tmp/vault"), 1));
        let cmd = runner.command_for(
            Path::new("/tmp/vault/A.simc"),
            Path::new("/tmp/vault/data.json"),
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(cmd.get_program(), "simc");
        assert_eq!(
            args,
            vec![
                "--profile",
                "/tmp/vault/A.simc",
                "iterations=100",
                "json2=/tmp/vault/data.json"
            ]
        );
    }

    #[test]
    fn missing_program_is_recorded_as_spawn_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let variant = dir.path().join("Cloak_of_Embers.simc");
        fs::write(&variant, "level=80\n").expect("variant");
        let mut opts = options(dir.path(), 1);
        opts.program = dir.path().join("no-such-simc");
        opts.leading_args.clear();
        let report = SimulationRunner::new(opts)
            .run_batch(&[variant], &CancelToken::new())
            .expect("batch");
        assert!(report.results.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].label, "Cloak of Embers");
        assert!(matches!(report.failures[0].error, VariantError::Spawn(_)));
    }

    #[test]
    fn job_labels_are_reported_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let variant = dir.path().join("Soul_Reaver.simc");
        fs::write(&variant, "level=80\n").expect("variant");
        let mut opts = options(dir.path(), 1);
        opts.program = dir.path().join("no-such-simc");
        let job = VariantJob {
            label: "Soul_Reaver".to_string(),
            path: variant.clone(),
        };
        let report = SimulationRunner::new(opts)
            .run_jobs(&[job], &CancelToken::new())
            .expect("batch");
        assert_eq!(report.failures[0].label, "Soul_Reaver");
        assert_eq!(VariantJob::from_path(&variant).label, "Soul Reaver");
    }

    #[test]
    fn sub_second_timeout_is_reported_in_millis() {
        let err = VariantError::TimedOut { millis: 300 };
        assert_eq!(err.to_string(), "simulator timed out after 300ms and was killed");
    }

    #[test]
    fn cancelled_batch_skips_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let variants = vec![dir.path().join("A.simc"), dir.path().join("B.simc")];
        let cancel = CancelToken::new();
        cancel.cancel();
        for jobs in [1, 2] {
            let report = SimulationRunner::new(options(dir.path(), jobs))
                .run_batch(&variants, &cancel)
                .expect("batch");
            assert!(report.results.is_empty());
            assert!(report.failures.is_empty());
            assert_eq!(report.skipped, vec!["A".to_string(), "B".to_string()]);
        }
    }

    #[test]
    fn log_tail_keeps_last_non_empty_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x.log");
        fs::write(&path, "1\n2\n\n3\n4\n5\n6\n\n").expect("log");
        assert_eq!(log_tail(&path), "2 | 3 | 4 | 5 | 6");
        assert_eq!(log_tail(&dir.path().join("missing.log")), "");
    }
}
