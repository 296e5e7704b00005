//! Resumable run-in controller: plan loading, the block/step/cycle sequencer,
//! process supervision, EC access, thermal stress and battery regulation.

pub mod artifacts;
pub mod battery;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod ec;
pub mod error;
pub mod executor;
pub mod files;
pub mod logging;
pub mod process;
pub mod reboot;
pub mod sequencer;
pub mod telemetry;
pub mod thermal;

pub use artifacts::ResultDir;
pub use battery::{
    wait_for_threshold, BatteryController, BatteryOutcome, BatteryProbe, BatteryReading,
    BatteryTest, ChargeDriver, CommandBatteryProbe, Decision, EcChargeDriver, GateOutcome,
    Hysteresis,
};
pub use checkpoint::{
    read_crash_notes, BlockId, Checkpoint, CheckpointStore, CrashNote, FailureRecord, RunLock,
    Status,
};
pub use config::{Block, CrashPolicy, Hook, PlanConfig, StepAction, StepSpec, TEMPLATE};
pub use context::{CancelFlag, Event, EventSink, RecordingSink, RunContext, RunPaths, TracingSink};
pub use ec::{EcChannel, EcTool, SharedEc};
pub use error::{RunError, RunResult};
pub use executor::{PlanExecutor, StepExecutor};
pub use process::{CommandLine, OutputMode, ProcessManager, RetryPolicy};
pub use reboot::{CommandRebooter, Rebooter};
pub use sequencer::{RunOutcome, RunSummary, Sequencer, CRASH_LOOP_CODE};
pub use telemetry::{Sampler, SamplerHandle, TelemetrySource};

/// Runs (or resumes) the plan with the production executor and rebooter.
pub fn run_plan(ctx: &RunContext, fresh: bool) -> RunResult<RunSummary> {
    let mut executor = PlanExecutor::new(ctx);
    let mut rebooter = CommandRebooter::new(ctx);
    Sequencer::new(ctx, &mut executor, &mut rebooter)?.run(fresh)
}
