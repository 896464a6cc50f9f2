use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vault_runner::{
    discover_variants, evaluate, parse_positions, rank, BatchReport, CancelToken, Document,
    Evaluation, GeneratedBatch, PipelineError, RewardSection, RunResult, RunnerOptions,
    SimulationRunner, VaultConfig,
};

const SIMC_NAMES: &[&str] = &["simc", "simc.exe", "SimulationCraft.exe"];

#[derive(Parser)]
#[command(name = "vault", version, about = "Simulate Great Vault reward choices with SimulationCraft")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SimulationCraft executable
    #[arg(long, global = true)]
    simc: Option<PathBuf>,
    /// Scratch directory for variants and simulator output
    #[arg(long, global = true)]
    scratch: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the reward candidates of an import
    List {
        /// SimC import file, or `-` for stdin
        import: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write one variant import per candidate
    Generate {
        import: PathBuf,
        /// 1-based positions to leave out, e.g. "1 5 9"
        #[arg(long)]
        remove: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Simulate the variants already in the scratch directory
    Run {
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Generate, simulate and rank in one go
    Evaluate {
        import: PathBuf,
        #[arg(long)]
        remove: Option<String>,
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(&cli.global, cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(global: &GlobalArgs, jobs: Option<usize>) -> Result<VaultConfig> {
    let mut cfg = match &global.config {
        Some(path) => VaultConfig::load(path)?,
        None => VaultConfig::default(),
    };
    if let Some(simc) = &global.simc {
        cfg.simc = Some(simc.clone());
    }
    if let Some(scratch) = &global.scratch {
        cfg.scratch_dir = scratch.clone();
    }
    if let Some(jobs) = jobs {
        cfg.jobs = jobs;
    }
    Ok(cfg)
}

fn run_command(global: &GlobalArgs, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::List { import, json } => {
            let cfg = load_config(global, None)?;
            let section = RewardSection::parse(read_import(&import)?, &cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "bounds": section.bounds,
                    "candidates": section.candidates,
                })));
            }
            print_candidates(&section);
        }
        Commands::Generate {
            import,
            remove,
            json,
        } => {
            let cfg = load_config(global, None)?;
            let section = parse_and_trim(&import, remove.as_deref(), &cfg)?;
            let generated = section.generate(&cfg.scratch_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate",
                    "generated": generated_to_json(&generated),
                })));
            }
            print_candidates(&section);
            print_generated(&generated);
        }
        Commands::Run { jobs, json } => {
            let cfg = load_config(global, jobs)?;
            let variants = discover_variants(&cfg.scratch_dir)?;
            if variants.is_empty() {
                return Err(anyhow!(
                    "no variants in {}; run `vault generate` first",
                    cfg.scratch_dir.display()
                ));
            }
            let runner = build_runner(&cfg)?;
            let report = runner.run_batch(&variants, &CancelToken::new())?;
            let ranking = rank(&report.results);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": report_to_json(&report),
                    "best": ranking.as_ref().map(|r| &r.best),
                })));
            }
            print_report(&report);
            match ranking {
                Some(r) => {
                    print_ranked(&r.ranked);
                    print_best_item(&r.best);
                }
                None => println!("No valid DPS data was found."),
            }
        }
        Commands::Evaluate {
            import,
            remove,
            jobs,
            json,
        } => {
            let cfg = load_config(global, jobs)?;
            let section = parse_and_trim(&import, remove.as_deref(), &cfg)?;
            let outcome = evaluate_section(&section, &cfg, build_runner)?;
            if json {
                return Ok(Some(evaluation_to_json(&outcome)));
            }
            match outcome {
                Evaluation::NothingToRun => println!("No reward candidates to simulate."),
                Evaluation::NoUsableResults { generated, report } => {
                    print_generated(&generated);
                    print_report(&report);
                    println!("No valid DPS data was found.");
                }
                Evaluation::Ranked {
                    generated,
                    report,
                    ranking,
                } => {
                    print_generated(&generated);
                    print_report(&report);
                    print_ranked(&ranking.ranked);
                    print_best_item(&ranking.best);
                }
            }
        }
    }
    Ok(None)
}

fn read_import(path: &Path) -> Result<Document> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(Document::from_text(&text));
    }
    Ok(Document::load(path)?)
}

fn parse_and_trim(import: &Path, remove: Option<&str>, cfg: &VaultConfig) -> Result<RewardSection> {
    let section = RewardSection::parse(read_import(import)?, cfg)?;
    match remove {
        Some(raw) => {
            let positions = parse_positions(raw)?;
            info!(?positions, "removing candidates");
            Ok(section.remove(&positions)?)
        }
        None => Ok(section),
    }
}

/// Looks for the simulator only when there is something to simulate.
fn evaluate_section(
    section: &RewardSection,
    cfg: &VaultConfig,
    make_runner: impl FnOnce(&VaultConfig) -> Result<SimulationRunner>,
) -> Result<Evaluation> {
    if section.candidates.is_empty() {
        info!("no reward candidates to simulate");
        return Ok(Evaluation::NothingToRun);
    }
    let runner = make_runner(cfg)?;
    Ok(evaluate(section, &runner, &CancelToken::new())?)
}

fn build_runner(cfg: &VaultConfig) -> Result<SimulationRunner> {
    let program = find_simc(cfg.simc.as_deref()).ok_or_else(|| {
        anyhow!(
            "SimulationCraft executable not found; pass --simc, set `simc` in the config, \
             or place one of {:?} next to this binary, in the working directory or on PATH",
            SIMC_NAMES
        )
    })?;
    info!(program = %program.display(), "using simulator");
    Ok(SimulationRunner::new(RunnerOptions::from_config(program, cfg)))
}

fn find_simc(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }
    dirs.iter()
        .flat_map(|dir| SIMC_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

fn print_candidates(section: &RewardSection) {
    println!(
        "reward section: lines {}-{}",
        section.bounds.start + 1,
        section.bounds.end + 1
    );
    for (idx, candidate) in section.candidates.iter().enumerate() {
        println!("[{}] {}", idx + 1, candidate.label);
    }
}

fn print_generated(generated: &GeneratedBatch) {
    println!(
        "generated {} variants (cleared {} old files)",
        generated.variants.len(),
        generated.cleared
    );
    for warning in &generated.warnings {
        println!(
            "warning: '{}' activated {} lines for option `{}`",
            warning.label, warning.matches, warning.option_line
        );
    }
}

fn print_report(report: &BatchReport) {
    for failure in &report.failures {
        println!("failed: {} ({})", failure.label, failure.error);
    }
    for label in &report.skipped {
        println!("skipped: {}", label);
    }
    println!(
        "All simulations took: {:.2}s",
        report.elapsed.as_secs_f64()
    );
}

fn print_ranked(ranked: &[RunResult]) {
    for (idx, r) in ranked.iter().enumerate() {
        println!(
            "{:>2}. {:<40} mean {:>12.2}  min {:>12.2}  max {:>12.2}",
            idx + 1,
            r.label,
            r.mean,
            r.min,
            r.max
        );
    }
}

fn print_best_item(best: &RunResult) {
    println!("\n### Best Item by Mean DPS ###");
    println!("# Item: {:>20}", best.label);
    println!("# Mean DPS:\t {:.2}", best.mean);
    println!("# Min DPS:\t {:.2}", best.min);
    println!("# Max DPS:\t {:.2}", best.max);
    println!("#############################\n");
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::SectionNotFound { .. }) => "section_not_found",
        Some(PipelineError::OrphanCandidate { .. }) => "orphan_candidate",
        Some(PipelineError::InvalidPosition { .. })
        | Some(PipelineError::UnparsablePosition { .. }) => "invalid_position",
        Some(PipelineError::Config { .. }) => "invalid_config",
        Some(PipelineError::InvalidBounds { .. }) => "invalid_bounds",
        Some(_) => "pipeline_error",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::List { json, .. }
        | Commands::Generate { json, .. }
        | Commands::Run { json, .. }
        | Commands::Evaluate { json, .. } => *json,
    }
}

fn generated_to_json(generated: &GeneratedBatch) -> Value {
    json!({
        "cleared": generated.cleared,
        "variants": generated.variants,
        "warnings": generated.warnings,
    })
}

fn report_to_json(report: &BatchReport) -> Value {
    let failures: Vec<Value> = report
        .failures
        .iter()
        .map(|f| {
            json!({
                "label": f.label,
                "variant": f.variant.display().to_string(),
                "error": f.error.to_string(),
            })
        })
        .collect();
    json!({
        "results": report.results,
        "failures": failures,
        "skipped": report.skipped,
        "elapsed_ms": report.elapsed.as_millis() as u64,
    })
}

fn evaluation_to_json(outcome: &Evaluation) -> Value {
    match outcome {
        Evaluation::NothingToRun => json!({
            "ok": true,
            "command": "evaluate",
            "outcome": "nothing_to_run",
        }),
        Evaluation::NoUsableResults { generated, report } => json!({
            "ok": true,
            "command": "evaluate",
            "outcome": "no_usable_results",
            "generated": generated_to_json(generated),
            "report": report_to_json(report),
        }),
        Evaluation::Ranked {
            generated,
            report,
            ranking,
        } => json!({
            "ok": true,
            "command": "evaluate",
            "outcome": "ranked",
            "generated": generated_to_json(generated),
            "report": report_to_json(report),
            "best": ranking.best,
            "ranked": ranking.ranked,
        }),
    }
}
