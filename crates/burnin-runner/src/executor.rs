use std::sync::Arc;
use std::time::Duration;

use crate::battery::{
    wait_for_threshold, BatteryController, BatteryOutcome, CommandBatteryProbe, EcChargeDriver,
};
use crate::config::{BatteryProbeConfig, StepAction, StepSpec};
use crate::context::RunContext;
use crate::ec::{EcTool, SharedEc, ToolEcChannel};
use crate::error::{RunError, RunResult};
use crate::process::ProcessManager;
use crate::telemetry::source_from_config;
use crate::thermal::run_stress;

/// Runs single steps on behalf of the sequencer. `label` is unique per
/// (cycle, block, step) and names any artifacts the step writes.
pub trait StepExecutor {
    fn execute(&mut self, ctx: &RunContext, label: &str, step: &StepSpec) -> RunResult<()>;

    /// Puts the hardware back into automatic modes. Must not fail.
    fn teardown(&mut self, ctx: &RunContext);
}

pub struct PlanExecutor {
    processes: ProcessManager,
    ec: SharedEc,
    ec_tool: EcTool,
}

impl PlanExecutor {
    pub fn new(ctx: &RunContext) -> Self {
        let processes = ProcessManager::from_context(ctx);
        let ec = SharedEc::new(Box::new(ToolEcChannel::new(
            processes.clone(),
            ctx.config.ec.clone(),
        )));
        let ec_tool = EcTool::new(processes.clone(), ctx.config.ec.clone());
        Self {
            processes,
            ec,
            ec_tool,
        }
    }

    /// Swaps in a different EC transport for telemetry reads.
    pub fn with_ec(mut self, ec: SharedEc) -> Self {
        self.ec = ec;
        self
    }

    pub fn battery_controller(&self, ctx: &RunContext) -> RunResult<BatteryController> {
        let battery = ctx.config.battery()?.clone();
        let probe = CommandBatteryProbe::new(self.processes.clone(), battery.probe.clone());
        let driver = EcChargeDriver::new(
            self.ec_tool.clone(),
            self.processes.clone(),
            ctx.cancel.clone(),
            ctx.events.clone(),
            &battery,
            ctx.config.teardown.kill_retries,
        );
        Ok(BatteryController::new(
            battery,
            Box::new(probe),
            Box::new(driver),
            ctx.cancel.clone(),
            Arc::clone(&ctx.events),
        ))
    }

    fn finish_battery(
        &self,
        ctx: &RunContext,
        label: &str,
        outcome: BatteryOutcome,
    ) -> RunResult<()> {
        let report = outcome.write_artifacts(&ctx.paths.results, label)?;
        ctx.log(&format!(
            "{} {}: {} ({})",
            outcome.test.label(),
            outcome.verdict(),
            outcome.message,
            report.display()
        ));
        outcome.into_result().map(|_| ())
    }
}

impl StepExecutor for PlanExecutor {
    fn execute(&mut self, ctx: &RunContext, label: &str, step: &StepSpec) -> RunResult<()> {
        match &step.action {
            StepAction::Command {
                command,
                capture_output,
                timeout_sec,
            } => {
                ctx.log(&format!("CMD > {}", command));
                self.processes.run_and_wait(
                    command,
                    timeout_sec.map(Duration::from_secs),
                    *capture_output,
                )?;
                ctx.log("CMD < PASS");
                Ok(())
            }
            StepAction::Stress(spec) => {
                let source_config = ctx.config.telemetry.source.as_ref().ok_or_else(|| {
                    RunError::ConfigMissing("telemetry source for stress step".to_string())
                })?;
                let source = source_from_config(source_config, &self.ec);
                run_stress(ctx, &self.processes, source, label, spec).map(|_| ())
            }
            StepAction::BatteryGate {
                threshold_percent,
                poll_sec,
                timeout_min,
            } => {
                let probe_config = ctx
                    .config
                    .battery
                    .as_ref()
                    .map(|b| b.probe.clone())
                    .unwrap_or_else(BatteryProbeConfig::default);
                let mut probe = CommandBatteryProbe::new(self.processes.clone(), probe_config);
                wait_for_threshold(
                    &mut probe,
                    *threshold_percent,
                    Duration::from_secs(*poll_sec),
                    timeout_min.map(|m| Duration::from_secs(m * 60)),
                    &ctx.cancel,
                    ctx.events.as_ref(),
                )
                .map(|_| ())
            }
            StepAction::BatteryHold { duration_min } => {
                let outcome = self
                    .battery_controller(ctx)?
                    .hold(Duration::from_secs(duration_min * 60))?;
                self.finish_battery(ctx, label, outcome)
            }
            StepAction::BatteryCycle => {
                let outcome = self.battery_controller(ctx)?.cycle()?;
                self.finish_battery(ctx, label, outcome)
            }
            // The sequencer owns reboots; nothing to run here.
            StepAction::Reboot => Ok(()),
        }
    }

    fn teardown(&mut self, ctx: &RunContext) {
        let quiet = self.processes.uncancellable();
        let retries = ctx.config.teardown.kill_retries;
        let mut names = ctx.config.teardown.kill_processes.clone();
        if let Some(load) = ctx.config.battery.as_ref().and_then(|b| b.discharge_load.as_ref()) {
            if !names.contains(&load.process_name) {
                names.push(load.process_name.clone());
            }
        }
        for name in &names {
            if let Err(err) = quiet.ensure_terminated(name, retries) {
                ctx.log(&format!("Teardown could not stop {}: {}", name, err));
            }
        }
        if self.ec_tool.restore_auto_modes() {
            ctx.log("Fan and battery back in automatic mode");
        } else {
            ctx.log("Teardown could not restore automatic fan/battery mode");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PlanConfig;
    use crate::context::{CancelFlag, RecordingSink};

    fn context(dir: &std::path::Path) -> (RunContext, Arc<RecordingSink>) {
        let yaml = format!(
            r#"
run:
  state_dir: '{}'
blocks:
  - id: 2
    name: Aging
    steps:
      - {{ name: ok, kind: command, command: 'true' }}
ec:
  tool: 'true'
  retries: 1
teardown:
  kill_processes: [burnin-test-absent-tool]
  kill_retries: 1
"#,
            dir.display()
        );
        let plan = PlanConfig::from_yaml_str(&yaml).expect("plan");
        let sink = Arc::new(RecordingSink::new());
        (
            RunContext::new(plan, sink.clone(), CancelFlag::new()),
            sink,
        )
    }

    #[test]
    fn command_steps_map_exit_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ctx, sink) = context(dir.path());
        let mut exec = PlanExecutor::new(&ctx);
        exec.execute(&ctx, "ok", &StepSpec::command("ok", "echo hi"))
            .expect("ok");
        let err = exec
            .execute(&ctx, "bad", &StepSpec::command("bad", "exit 4"))
            .expect_err("fails");
        assert_eq!(err.error_code(), "command_failed");
        assert!(sink.logs().contains(&"CMD < PASS".to_string()));
    }

    #[test]
    fn battery_steps_need_battery_section() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ctx, _) = context(dir.path());
        let mut exec = PlanExecutor::new(&ctx);
        let step = StepSpec {
            name: "cycle".into(),
            action: StepAction::BatteryCycle,
            interrupts: false,
            awaits_restart: false,
        };
        let err = exec.execute(&ctx, "cycle", &step).expect_err("no battery");
        assert_eq!(err.error_code(), "config_missing");
    }

    #[test]
    fn teardown_runs_after_stop_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ctx, sink) = context(dir.path());
        let mut exec = PlanExecutor::new(&ctx);
        ctx.cancel.cancel();
        exec.teardown(&ctx);
        assert!(sink
            .logs()
            .iter()
            .any(|l| l.contains("back in automatic mode")));
    }
}
