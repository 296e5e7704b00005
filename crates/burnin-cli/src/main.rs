use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use burnin_analysis::{evaluate_file, format_value, render_report_csv, EvaluationReport, Verdict};
use burnin_runner::{
    logging, run_plan, BatteryOutcome, CancelFlag, Checkpoint, PlanConfig, PlanExecutor,
    ResultDir, RunContext, RunError, RunOutcome, RunSummary, StepExecutor, TracingSink, TEMPLATE,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};

const EXIT_FAIL: i32 = 1;
const EXIT_ABORTED: i32 = 130;

#[derive(Parser)]
#[command(name = "burnin", version, about = "Resumable run-in test controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BatteryTestArg {
    Hold,
    Cycle,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run, or resume the one recorded in the checkpoint.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Discard any stored checkpoint first.
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Delete the checkpoint and verdict markers.
    Reset {
        #[arg(long)]
        config: PathBuf,
    },
    /// Write the template plan.
    Init {
        #[arg(long, default_value = "plan.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Describe {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate a recorded telemetry series against a bounds table.
    Evaluate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        series: PathBuf,
        #[arg(long)]
        mode: String,
        #[arg(long, default_value_t = 120)]
        window_sec: u64,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run a battery test outside the plan sequence.
    Battery {
        #[arg(value_enum)]
        test: BatteryTestArg,
        #[arg(long)]
        config: PathBuf,
        /// Hold duration.
        #[arg(long, default_value_t = 60)]
        minutes: u64,
        #[arg(long)]
        json: bool,
    },
}

struct Reply {
    payload: Option<Value>,
    exit: i32,
}

impl Reply {
    fn done() -> Self {
        Self {
            payload: None,
            exit: 0,
        }
    }

    fn json(payload: Value, exit: i32) -> Self {
        Self {
            payload: Some(payload),
            exit,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(reply) => {
            if let Some(payload) = &reply.payload {
                print_json(payload);
            }
            if reply.exit != 0 {
                std::process::exit(reply.exit);
            }
            Ok(())
        }
        Err(err) => {
            let run_error = err.downcast_ref::<RunError>();
            let exit = match run_error {
                Some(e) if e.is_abort() => EXIT_ABORTED,
                _ => EXIT_FAIL,
            };
            if json_mode {
                print_json(&failure_envelope(&err));
                std::process::exit(exit);
            }
            if exit != EXIT_FAIL {
                eprintln!("Error: {:#}", err);
                std::process::exit(exit);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Reply> {
    match command {
        Commands::Run {
            config,
            fresh,
            json,
        } => {
            let plan = load_plan(&config)?;
            let log_file = logging::init(Some(&plan.run.state_dir.join("log")), "Runin");
            let ctx = context(plan);
            install_stop_handler(&ctx.cancel)?;
            if let Some(path) = &log_file {
                tracing::info!(log = %path.display(), "logging to file");
            }
            let summary = run_plan(&ctx, fresh)?;
            let exit = outcome_exit(&summary.outcome);
            if json {
                return Ok(Reply::json(
                    json!({
                        "ok": true,
                        "command": "run",
                        "run": summary_to_json(&summary),
                        "result_dir": ctx.paths.results.display().to_string(),
                        "log_file": log_file.map(|p| p.display().to_string()),
                    }),
                    exit,
                ));
            }
            print_summary(&summary);
            println!("result_dir: {}", ctx.paths.results.display());
            Ok(Reply { payload: None, exit })
        }
        Commands::Status { config, json } => {
            let plan = load_plan(&config)?;
            let ctx = context(plan);
            let checkpoint = ctx.store.load()?;
            let marker = ResultDir::new(&ctx.paths.results).marker()?;
            if json {
                return Ok(Reply::json(
                    json!({
                        "ok": true,
                        "command": "status",
                        "checkpoint": checkpoint,
                        "marker": marker.as_ref().map(|(v, m)| json!({"verdict": v, "message": m})),
                        "lock_held": ctx.paths.lock.exists(),
                    }),
                    0,
                ));
            }
            match &checkpoint {
                Some(cp) => print_checkpoint(cp),
                None => println!("no run in progress"),
            }
            if let Some((verdict, message)) = marker {
                println!("marker: {} ({})", verdict, message);
            }
            Ok(Reply::done())
        }
        Commands::Reset { config } => {
            let plan = load_plan(&config)?;
            let ctx = context(plan);
            if ctx.paths.lock.exists() {
                return Err(anyhow!(
                    "a run may be active (lock at {}); stop it before resetting",
                    ctx.paths.lock.display()
                ));
            }
            let removed = ctx.store.clear()?;
            ResultDir::new(&ctx.paths.results).clear_markers()?;
            println!(
                "{}",
                if removed {
                    "checkpoint removed"
                } else {
                    "no checkpoint to remove"
                }
            );
            Ok(Reply::done())
        }
        Commands::Init { path, force } => {
            if path.exists() && !force {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, TEMPLATE)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
            Ok(Reply::done())
        }
        Commands::Describe { config, json } => {
            let plan = load_plan(&config)?;
            let digest = plan.digest()?;
            if json {
                return Ok(Reply::json(
                    json!({
                        "ok": true,
                        "command": "describe",
                        "digest": digest,
                        "plan": serde_json::to_value(&plan)?,
                    }),
                    0,
                ));
            }
            print_plan(&plan, &digest);
            Ok(Reply::done())
        }
        Commands::Evaluate {
            config,
            series,
            mode,
            window_sec,
            out,
            json,
        } => {
            let plan = load_plan(&config)?;
            let bounds = plan.bounds_for(&mode)?;
            let report = evaluate_file(&series, bounds, Duration::from_secs(window_sec))?;
            if let Some(out) = &out {
                std::fs::write(out, render_report_csv(&report))
                    .with_context(|| format!("writing {}", out.display()))?;
            }
            let exit = verdict_exit(report.verdict());
            if json {
                return Ok(Reply::json(
                    json!({
                        "ok": true,
                        "command": "evaluate",
                        "mode": mode,
                        "verdict": report.verdict(),
                        "report": report_to_json(&report),
                    }),
                    exit,
                ));
            }
            print_report(&report);
            Ok(Reply { payload: None, exit })
        }
        Commands::Battery {
            test,
            config,
            minutes,
            json,
        } => {
            let plan = load_plan(&config)?;
            logging::init(Some(&plan.run.state_dir.join("log")), "Battery");
            let ctx = context(plan);
            install_stop_handler(&ctx.cancel)?;
            let outcome = run_battery(&ctx, test, minutes)?;
            let report_path = outcome.write_artifacts(&ctx.paths.results, outcome.test.label())?;
            let exit = verdict_exit(outcome.verdict());
            if json {
                return Ok(Reply::json(
                    json!({
                        "ok": true,
                        "command": "battery",
                        "test": outcome.test.label(),
                        "verdict": outcome.verdict(),
                        "message": outcome.message,
                        "samples": outcome.samples.len(),
                        "report": report_to_json(&outcome.report),
                        "report_path": report_path.display().to_string(),
                    }),
                    exit,
                ));
            }
            println!("{}: {}", outcome.test.label(), outcome.verdict());
            println!("{}", outcome.message);
            print_report(&outcome.report);
            println!("report: {}", report_path.display());
            Ok(Reply { payload: None, exit })
        }
    }
}

/// Relative commands resolve against the plan's folder unless the plan says
/// otherwise.
fn load_plan(path: &Path) -> Result<PlanConfig> {
    let mut plan = PlanConfig::load(path)?;
    if plan.run.workdir.is_none() {
        plan.run.workdir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
    }
    Ok(plan)
}

fn context(plan: PlanConfig) -> RunContext {
    RunContext::new(plan, Arc::new(TracingSink), CancelFlag::new())
}

fn install_stop_handler(cancel: &CancelFlag) -> Result<()> {
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("stop requested, finishing teardown");
        flag.cancel();
    })
    .context("installing Ctrl-C handler")
}

fn run_battery(ctx: &RunContext, test: BatteryTestArg, minutes: u64) -> Result<BatteryOutcome> {
    let mut executor = PlanExecutor::new(ctx);
    let outcome = executor.battery_controller(ctx).and_then(|mut controller| match test {
        BatteryTestArg::Hold => controller.hold(Duration::from_secs(minutes * 60)),
        BatteryTestArg::Cycle => controller.cycle(),
    });
    executor.teardown(ctx);
    Ok(outcome?)
}

fn outcome_exit(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Failed(failure) if failure.code == "aborted" => EXIT_ABORTED,
        other => match other.verdict() {
            Some(Verdict::Fail) => EXIT_FAIL,
            _ => 0,
        },
    }
}

fn verdict_exit(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Pass => 0,
        Verdict::Fail => EXIT_FAIL,
    }
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Passed => "PASS".to_string(),
        RunOutcome::Failed(_) => "FAIL".to_string(),
        RunOutcome::Rebooting => "REBOOTING".to_string(),
        RunOutcome::AlreadyFinished { status, .. } => format!("already finished ({})", status),
    }
}

fn summary_to_json(summary: &RunSummary) -> Value {
    json!({
        "outcome": outcome_label(&summary.outcome),
        "verdict": summary.outcome.verdict(),
        "failure": summary.outcome.failure(),
        "resumed_from": summary.resumed_from,
        "crash": summary.crash,
    })
}

fn report_to_json(report: &EvaluationReport) -> Value {
    json!({
        "passed": report.passed(),
        "items": report.items,
        "structural_errors": report
            .structural_errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    })
}

fn print_summary(summary: &RunSummary) {
    if let Some(cp) = &summary.resumed_from {
        println!(
            "resumed_from: block {} step {} cycle {} ({})",
            cp.block, cp.step, cp.cycle, cp.status
        );
    }
    if let Some(crash) = &summary.crash {
        println!(
            "crash_recovery: {} (crash {} at block {} step {})",
            crash.action, crash.crash_count, crash.block, crash.step
        );
    }
    println!("outcome: {}", outcome_label(&summary.outcome));
    if let Some(failure) = summary.outcome.failure() {
        println!("failure: [{}] {}", failure.code, failure.message);
    }
}

fn print_checkpoint(cp: &Checkpoint) {
    println!("status: {}", cp.status);
    println!(
        "position: block {} ({}) step {} cycle {}",
        cp.block,
        cp.block.name(),
        cp.step,
        cp.cycle
    );
    if cp.crash_count > 0 {
        println!("crash_count: {}", cp.crash_count);
    }
    if let Some(failure) = &cp.failure {
        println!("failure: [{}] {}", failure.code, failure.message);
    }
    if let Some(at) = &cp.updated_at {
        println!("updated_at: {}", at);
    }
}

fn print_plan(plan: &PlanConfig, digest: &str) {
    println!("digest: {}", digest);
    println!("state_dir: {}", plan.run.state_dir.display());
    println!(
        "cycles: {} (crash policy {:?}, retry limit {})",
        plan.run.total_cycles, plan.run.crash_policy, plan.run.crash_retry_limit
    );
    for block in &plan.blocks {
        println!(
            "block {} {}{}",
            block.id,
            block.name,
            if block.enabled { "" } else { " (disabled)" }
        );
        for (idx, step) in block.steps.iter().enumerate() {
            let mut flags = Vec::new();
            if step.interrupts {
                flags.push("interrupts");
            }
            if step.awaits_restart {
                flags.push("awaits_restart");
            }
            println!(
                "  {:>2}. [{}] {}{}",
                idx,
                step.action.kind(),
                step.name,
                if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                }
            );
        }
        if !block.post.is_empty() {
            println!("  post hooks: {}", block.post.len());
        }
    }
    for (mode, bounds) in &plan.bounds {
        for bound in bounds {
            println!(
                "bound {}: {} in [{}, {}]",
                mode, bound.metric, bound.low, bound.high
            );
        }
    }
}

fn print_report(report: &EvaluationReport) {
    for item in &report.items {
        println!(
            "{:<16} {:>10}  [{}, {}]  {}",
            item.item,
            format_value(item.observed),
            item.low,
            item.high,
            item.result
        );
    }
    for error in &report.structural_errors {
        println!("error: {}", error);
    }
    println!("verdict: {}", report.verdict());
}

/// One compact JSON document per line on stdout.
fn print_json(value: &Value) {
    println!("{}", value);
}

/// Failure document for `--json` callers. Fields of the underlying run
/// error travel in `details` so scripts need not parse the message.
fn failure_envelope(err: &anyhow::Error) -> Value {
    let run_error = err.downcast_ref::<RunError>();
    json!({
        "ok": false,
        "error": {
            "code": run_error.map_or("command_failed", RunError::error_code),
            "message": format!("{:#}", err),
            "details": run_error.map_or_else(|| json!({}), error_details),
        }
    })
}

fn error_details(err: &RunError) -> Value {
    match err {
        RunError::CommandFailed { command, code } => {
            json!({ "command": command, "exit_code": code })
        }
        RunError::Timeout {
            operation,
            timeout_ms,
            pid,
        } => json!({ "operation": operation, "timeout_ms": timeout_ms, "pid": pid }),
        RunError::ThresholdViolation(items) => json!({
            "failed_items": items.iter().map(|i| i.item.as_str()).collect::<Vec<_>>()
        }),
        RunError::InvalidConfig(problems) => json!({ "problems": problems }),
        RunError::CheckpointCorrupt { path, reason } => {
            json!({ "path": path.display().to_string(), "reason": reason })
        }
        RunError::RunInProgress { path, pid } => {
            json!({ "path": path.display().to_string(), "pid": pid })
        }
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Status { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Evaluate { json, .. }
        | Commands::Battery { json, .. } => *json,
        Commands::Reset { .. } | Commands::Init { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burnin_runner::FailureRecord;

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(outcome_exit(&RunOutcome::Passed), 0);
        assert_eq!(outcome_exit(&RunOutcome::Rebooting), 0);
        let failed = RunOutcome::Failed(FailureRecord {
            code: "threshold_violation".into(),
            message: "cpu_temp".into(),
        });
        assert_eq!(outcome_exit(&failed), EXIT_FAIL);
        let aborted = RunOutcome::Failed(FailureRecord {
            code: "aborted".into(),
            message: "stop requested".into(),
        });
        assert_eq!(outcome_exit(&aborted), EXIT_ABORTED);
    }

    #[test]
    fn failure_envelope_carries_run_error_fields() {
        let err = anyhow::Error::new(RunError::RunInProgress {
            path: PathBuf::from("/var/runin/runtime/operation.lock"),
            pid: 4242,
        })
        .context("starting run");
        let value = failure_envelope(&err);
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], json!("run_in_progress"));
        assert_eq!(value["error"]["details"]["pid"], json!(4242));
        let message = value["error"]["message"].as_str().expect("message");
        assert!(message.starts_with("starting run: "), "{}", message);

        let err = anyhow::Error::new(RunError::InvalidConfig(vec![
            "run.total_cycles must be at least 1".into(),
        ]));
        let value = failure_envelope(&err);
        assert_eq!(value["error"]["code"], json!("invalid_config"));
        assert_eq!(value["error"]["details"]["problems"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn foreign_errors_get_a_generic_code() {
        let value = failure_envelope(&anyhow!("plan file not found"));
        assert_eq!(value["error"]["code"], json!("command_failed"));
        assert_eq!(value["error"]["details"], json!({}));
        assert_eq!(value["error"]["message"], json!("plan file not found"));
    }

    #[test]
    fn plan_workdir_defaults_to_plan_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.yaml");
        let yaml = format!(
            "run:\n  state_dir: '{}'\nblocks:\n  - id: 2\n    name: Aging\n    steps: []\n",
            dir.path().display()
        );
        std::fs::write(&path, yaml).expect("write");
        let plan = load_plan(&path).expect("plan");
        assert_eq!(plan.run.workdir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn cli_parses_battery_subcommand() {
        let cli = Cli::try_parse_from([
            "burnin", "battery", "cycle", "--config", "plan.yaml", "--json",
        ])
        .expect("parse");
        assert!(command_json_mode(&cli.command));
    }
}
