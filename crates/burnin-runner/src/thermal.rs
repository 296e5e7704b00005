//! The composite stress step: tools + sampler for a fixed duration, then a
//! windowed evaluation of what was recorded.

use std::time::Duration;

use burnin_analysis::{evaluate_trailing, render_report_csv, EvaluationReport};

use crate::config::{StressSpec, TelemetrySourceConfig, ToolLaunch};
use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::files::atomic_write_bytes;
use crate::process::ProcessManager;
use crate::telemetry::{Sampler, TelemetrySource};

/// Kills every launched companion tool when dropped, whatever the outcome.
struct ToolGuard {
    processes: ProcessManager,
    names: Vec<String>,
    retries: u32,
}

impl ToolGuard {
    fn launch(&mut self, tool: &ToolLaunch) -> RunResult<()> {
        self.names.push(tool.process_name.clone());
        self.processes.run_detached(tool).map(|_| ())
    }
}

impl Drop for ToolGuard {
    fn drop(&mut self) {
        let quiet = self.processes.uncancellable();
        for name in self.names.iter().rev() {
            if let Err(err) = quiet.ensure_terminated(name, self.retries) {
                tracing::warn!(tool = %name, error = %err, "stress tool survived teardown");
            }
        }
    }
}

pub fn run_stress(
    ctx: &RunContext,
    processes: &ProcessManager,
    source: Box<dyn TelemetrySource>,
    label: &str,
    spec: &StressSpec,
) -> RunResult<EvaluationReport> {
    let bounds = ctx.config.bounds_for(&spec.mode)?.to_vec();
    if let Some(prepare) = &spec.prepare {
        processes.run_and_wait(prepare, None, false)?;
    }

    let mut guard = ToolGuard {
        processes: processes.clone(),
        names: Vec::new(),
        retries: ctx.config.teardown.kill_retries,
    };
    if let Some(TelemetrySourceConfig::MonitorLog {
        launch: Some(monitor),
        ..
    }) = &ctx.config.telemetry.source
    {
        guard.launch(monitor)?;
    }
    for tool in &spec.tools {
        guard.launch(tool)?;
    }

    let series_path = ctx.paths.telemetry.join(format!("{}.csv", label));
    let sampler = Sampler::start(
        source,
        &series_path,
        Duration::from_secs(ctx.config.telemetry.interval_sec),
        ctx.events.clone(),
    )?;
    ctx.log(&format!(
        "{} stress running for {}s, sampling to {}",
        spec.mode,
        spec.duration_sec,
        series_path.display()
    ));
    let waited = ctx.cancel.sleep(Duration::from_secs(spec.duration_sec));
    let series = sampler.stop();
    drop(guard);
    waited?;
    let series = series?;

    let report = evaluate_trailing(&series, &bounds, Duration::from_secs(spec.window_sec));
    let report_path = ctx.paths.results.join(format!("{}_report.csv", label));
    atomic_write_bytes(&report_path, render_report_csv(&report).as_bytes())?;
    for item in &report.items {
        ctx.log(&format!(
            "{} {} = {} [{}, {}]",
            item.result,
            item.item,
            burnin_analysis::format_value(item.observed),
            item.low,
            item.high
        ));
    }

    if series.is_empty() {
        return Err(RunError::TelemetryMissing(format!(
            "no samples recorded in {}",
            series_path.display()
        )));
    }
    if !report.passed() {
        return Err(RunError::ThresholdViolation(report.failures().cloned().collect()));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanConfig;
    use crate::context::{CancelFlag, RecordingSink};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Steady(f64);

    impl TelemetrySource for Steady {
        fn channels(&self) -> Vec<String> {
            vec!["cpu_temp".to_string()]
        }
        fn read(&mut self) -> RunResult<BTreeMap<String, f64>> {
            let mut values = BTreeMap::new();
            values.insert("cpu_temp".to_string(), self.0);
            Ok(values)
        }
    }

    fn context(dir: &std::path::Path) -> RunContext {
        let yaml = format!(
            r#"
run:
  state_dir: '{}'
blocks:
  - id: 1
    name: Thermal
    steps:
      - {{ name: single, kind: stress, mode: single, duration_sec: 1, window_sec: 60 }}
bounds:
  single:
    - {{ metric: cpu_temp, low: 40, high: 95 }}
telemetry:
  interval_sec: 1
  source: {{ kind: ec, registers: [] }}
"#,
            dir.display()
        );
        let plan = PlanConfig::from_yaml_str(&yaml).expect("plan");
        RunContext::new(plan, Arc::new(RecordingSink::new()), CancelFlag::new())
    }

    fn spec() -> StressSpec {
        StressSpec {
            mode: "single".into(),
            duration_sec: 1,
            window_sec: 60,
            prepare: None,
            tools: Vec::new(),
        }
    }

    #[test]
    fn in_band_stress_passes_and_writes_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let pm = ProcessManager::from_context(&ctx);
        let report = run_stress(&ctx, &pm, Box::new(Steady(70.0)), "c1_b1_s1", &spec())
            .expect("stress");
        assert!(report.passed());
        assert!(ctx.paths.telemetry.join("c1_b1_s1.csv").exists());
        let csv = std::fs::read_to_string(ctx.paths.results.join("c1_b1_s1_report.csv"))
            .expect("report");
        assert!(csv.contains("cpu_temp,70.00,40,95,PASS"), "{}", csv);
    }

    #[test]
    fn hot_stress_is_a_threshold_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let pm = ProcessManager::from_context(&ctx);
        let err = run_stress(&ctx, &pm, Box::new(Steady(101.0)), "hot", &spec())
            .expect_err("too hot");
        match err {
            RunError::ThresholdViolation(items) => assert_eq!(items[0].item, "cpu_temp"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_mode_is_config_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let pm = ProcessManager::from_context(&ctx);
        let mut wrong = spec();
        wrong.mode = "dual".into();
        let err = run_stress(&ctx, &pm, Box::new(Steady(70.0)), "x", &wrong).expect_err("no bounds");
        assert_eq!(err.error_code(), "config_missing");
    }

    #[test]
    fn stop_during_stress_aborts_after_closing_the_series() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        ctx.cancel.cancel();
        let pm = ProcessManager::from_context(&ctx);
        let err = run_stress(&ctx, &pm, Box::new(Steady(70.0)), "stopped", &spec())
            .expect_err("aborted");
        assert!(err.is_abort());
        let text = std::fs::read_to_string(ctx.paths.telemetry.join("stopped.csv")).expect("series");
        assert!(text.starts_with("timestamp,cpu_temp"));
    }
}
