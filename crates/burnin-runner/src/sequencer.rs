//! The resumable block/step/cycle state machine.
//!
//! Every step boundary is persisted before anything that can crash or reboot
//! the host. On start the stored checkpoint decides where to pick up:
//!
//! | stored status      | action                                              |
//! |--------------------|-----------------------------------------------------|
//! | none               | fresh run from block 1 step 0, cycle 1              |
//! | `FINISHED_*`       | report the stored verdict, run nothing              |
//! | `RUNNING`          | harness crash; retry in place (or skip) per policy  |
//! | `REBOOTING`        | planned restart; continue at the stored next step   |
//! | `IDLE`             | continue at the stored step                         |

use chrono::Local;
use burnin_analysis::Verdict;

use crate::artifacts::ResultDir;
use crate::checkpoint::{BlockId, Checkpoint, CrashNote, FailureRecord, RunLock, Status};
use crate::config::{Block, CrashPolicy, Hook, StepAction, StepSpec};
use crate::context::RunContext;
use crate::error::{RunError, RunResult};
use crate::executor::StepExecutor;
use crate::reboot::Rebooter;

pub const CRASH_LOOP_CODE: &str = "harness_crash_loop";

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Passed,
    Failed(FailureRecord),
    /// The host is restarting; the next launch continues the run.
    Rebooting,
    AlreadyFinished {
        status: Status,
        failure: Option<FailureRecord>,
    },
}

impl RunOutcome {
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Self::Passed => Some(Verdict::Pass),
            Self::Failed(_) => Some(Verdict::Fail),
            Self::Rebooting => None,
            Self::AlreadyFinished { status, .. } => Some(Verdict::from_bool(
                *status == Status::FinishedPass,
            )),
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match self {
            Self::Failed(failure) => Some(failure),
            Self::AlreadyFinished { failure, .. } => failure.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub resumed_from: Option<Checkpoint>,
    pub crash: Option<CrashNote>,
}

enum Flow {
    Completed,
    /// Reboot through the rebooter once teardown is done.
    Reboot,
    /// The step itself is taking the host down.
    AwaitRestart,
}

pub struct Sequencer<'a> {
    ctx: &'a RunContext,
    executor: &'a mut dyn StepExecutor,
    rebooter: &'a mut dyn Rebooter,
    digest: String,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        ctx: &'a RunContext,
        executor: &'a mut dyn StepExecutor,
        rebooter: &'a mut dyn Rebooter,
    ) -> RunResult<Self> {
        Ok(Self {
            digest: ctx.config.digest()?,
            ctx,
            executor,
            rebooter,
        })
    }

    /// Starts or resumes the run. `fresh` discards any stored checkpoint.
    pub fn run(&mut self, fresh: bool) -> RunResult<RunSummary> {
        let _lock = RunLock::acquire(&self.ctx.paths.lock)?;
        let results = ResultDir::new(&self.ctx.paths.results);
        if fresh && self.ctx.store.clear()? {
            self.ctx.log("Discarded previous checkpoint");
        }

        let stored = self.ctx.store.load()?;
        let mut crash = None;
        let mut position = match &stored {
            None => {
                results.reset()?;
                self.ctx.log(&format!(
                    "Starting new run: {} cycle(s)",
                    self.ctx.config.run.total_cycles
                ));
                Checkpoint::new(BlockId::Thermal, 0, 1, Status::Idle)
            }
            Some(cp) if cp.status.is_finished() => {
                self.ctx.log(&format!("Run already finished: {}", cp.status));
                self.ctx.status(cp.status.as_str());
                return Ok(RunSummary {
                    outcome: RunOutcome::AlreadyFinished {
                        status: cp.status,
                        failure: cp.failure.clone(),
                    },
                    resumed_from: stored.clone(),
                    crash: None,
                });
            }
            Some(cp) => {
                if cp.plan_digest.as_deref().map_or(false, |d| d != self.digest) {
                    self.ctx
                        .log("WARNING: plan changed since this run started; continuing with the new plan");
                }
                match cp.status {
                    Status::Running => {
                        let (next, note) = self.recover_crash(cp)?;
                        crash = Some(note);
                        match next {
                            Some(next) => next,
                            None => {
                                return self.finish_crash_loop(&results, cp, stored.clone(), crash)
                            }
                        }
                    }
                    Status::Rebooting => {
                        self.ctx.log(&format!(
                            ">>> RESUMED FROM REBOOT: block {} step {} cycle {}",
                            cp.block, cp.step, cp.cycle
                        ));
                        cp.clone()
                    }
                    _ => {
                        self.ctx.log(&format!(
                            "Resuming at block {} step {} cycle {}",
                            cp.block, cp.step, cp.cycle
                        ));
                        cp.clone()
                    }
                }
            }
        };
        position.failure = None;

        let flow = self.drive(&mut position);
        self.executor.teardown(self.ctx);
        let flow = match flow {
            _ if self.ctx.cancel.is_cancelled() => {
                Err(RunError::Aborted("stop requested".to_string()))
            }
            Ok(Flow::Reboot) => self.rebooter.reboot(self.ctx).map(|_| Flow::Reboot),
            other => other,
        };

        let outcome = match flow {
            Ok(Flow::Completed) => self.finish_pass(&results)?,
            Ok(Flow::Reboot) | Ok(Flow::AwaitRestart) => {
                self.ctx.status(Status::Rebooting.as_str());
                RunOutcome::Rebooting
            }
            Err(err) => self.finish_fail(&results, &position, FailureRecord::from_error(&err))?,
        };
        Ok(RunSummary {
            outcome,
            resumed_from: stored,
            crash,
        })
    }

    /// Returns the position to continue from, or `None` once the crash limit
    /// is exceeded.
    fn recover_crash(&self, cp: &Checkpoint) -> RunResult<(Option<Checkpoint>, CrashNote)> {
        let settings = &self.ctx.config.run;
        let crashes = cp.crash_count + 1;
        let (next, action) = if crashes > settings.crash_retry_limit {
            (None, "give_up")
        } else {
            match settings.crash_policy {
                CrashPolicy::RetryInPlace => {
                    let mut next = cp.clone();
                    next.crash_count = crashes;
                    (Some(next), "retry_in_place")
                }
                CrashPolicy::Skip => {
                    let mut next = cp.clone();
                    next.step += 1;
                    next.crash_count = 0;
                    (Some(next), "skip")
                }
            }
        };
        let note = CrashNote::new(cp, crashes, action);
        note.append(&self.ctx.paths.crash_notes)?;
        self.ctx.log(&format!(
            "CRASH DETECTED: harness died during block {} step {} cycle {} (crash {} of {} allowed), action: {}",
            cp.block, cp.step, cp.cycle, crashes, settings.crash_retry_limit, action
        ));
        tracing::warn!(
            block = %cp.block,
            step = cp.step,
            cycle = cp.cycle,
            crashes,
            action,
            "crash recovery"
        );
        Ok((next, note))
    }

    fn finish_crash_loop(
        &mut self,
        results: &ResultDir,
        cp: &Checkpoint,
        stored: Option<Checkpoint>,
        crash: Option<CrashNote>,
    ) -> RunResult<RunSummary> {
        self.executor.teardown(self.ctx);
        let failure = FailureRecord {
            code: CRASH_LOOP_CODE.to_string(),
            message: format!(
                "block {} step {} crashed the harness {} times",
                cp.block,
                cp.step,
                cp.crash_count + 1
            ),
        };
        let outcome = self.finish_fail(results, cp, failure)?;
        Ok(RunSummary {
            outcome,
            resumed_from: stored,
            crash,
        })
    }

    fn save(&self, position: &Checkpoint, status: Status) -> RunResult<()> {
        let mut cp = position.clone();
        cp.status = status;
        cp.plan_digest = Some(self.digest.clone());
        self.ctx.store.save(&cp)?;
        self.ctx.status(status.as_str());
        Ok(())
    }

    fn drive(&mut self, position: &mut Checkpoint) -> RunResult<Flow> {
        let config = self.ctx.config.clone();
        let total = config.run.total_cycles;
        if position.cycle > total {
            return Ok(Flow::Completed);
        }
        for block_id in BlockId::ALL {
            if block_id < position.block {
                continue;
            }
            if block_id != position.block {
                position.block = block_id;
                position.step = 0;
                position.crash_count = 0;
            }
            let block = match config.block(block_id) {
                Some(block) if block.enabled => block,
                _ => {
                    self.ctx.log(&format!("Block {} disabled, skipping", block_id));
                    continue;
                }
            };
            if let Some(flow) = self.run_block(block, position)? {
                return Ok(flow);
            }
        }
        if position.cycle < total {
            let next = Checkpoint::new(BlockId::Thermal, 0, position.cycle + 1, Status::Rebooting);
            self.ctx.log(&format!(
                "Cycle {} of {} done, rebooting into cycle {}",
                position.cycle, total, next.cycle
            ));
            *position = next;
            self.save(position, Status::Rebooting)?;
            return Ok(Flow::Reboot);
        }
        Ok(Flow::Completed)
    }

    /// `Some(flow)` when the run has to stop inside or right after this block.
    fn run_block(&mut self, block: &Block, position: &mut Checkpoint) -> RunResult<Option<Flow>> {
        self.ctx.log(&format!(
            "--- Block {}: {} (cycle {}) ---",
            block.id, block.name, position.cycle
        ));
        if position.step == 0 {
            self.run_hooks(block, "pre", &block.pre)?;
        }

        while position.step < block.steps.len() {
            self.ctx.cancel.checkpoint()?;
            let step = &block.steps[position.step];
            let label = format!("c{}_b{}_s{}", position.cycle, block.id, position.step);
            self.ctx.log(&format!(
                "[Block {} Step {}] {}",
                block.id, position.step, step.name
            ));

            if matches!(step.action, StepAction::Reboot) {
                position.step += 1;
                position.crash_count = 0;
                self.save(position, Status::Rebooting)?;
                return Ok(Some(Flow::Reboot));
            }
            if step.interrupts {
                let mut next = position.clone();
                next.step += 1;
                next.crash_count = 0;
                self.save(&next, Status::Rebooting)?;
            } else {
                self.save(position, Status::Running)?;
            }

            self.executor.execute(self.ctx, &label, step)?;

            position.step += 1;
            position.crash_count = 0;
            if step.awaits_restart {
                self.ctx.log("Waiting for the host to restart");
                return Ok(Some(Flow::AwaitRestart));
            }
            self.save(position, Status::Idle)?;
        }

        let commands: Vec<Hook> = block
            .post
            .iter()
            .filter(|h| !matches!(h, Hook::Reboot))
            .cloned()
            .collect();
        self.run_hooks(block, "post", &commands)?;
        if block.post.iter().any(|h| matches!(h, Hook::Reboot)) {
            let next = BlockId::ALL.into_iter().find(|b| {
                *b > block.id
                    && self
                        .ctx
                        .config
                        .block(*b)
                        .map_or(false, |later| later.enabled)
            });
            match next {
                Some(next) => {
                    self.ctx
                        .log(&format!("Block {} done, rebooting to block {}", block.id, next));
                    *position = Checkpoint::new(next, 0, position.cycle, Status::Rebooting);
                    self.save(position, Status::Rebooting)?;
                    return Ok(Some(Flow::Reboot));
                }
                None => self.ctx.log("Last block done, skipping reboot hook"),
            }
        }
        self.ctx.log(&format!("Block {} PASS", block.id));
        Ok(None)
    }

    fn run_hooks(&mut self, block: &Block, phase: &str, hooks: &[Hook]) -> RunResult<()> {
        for (idx, hook) in hooks.iter().enumerate() {
            if let Hook::Command {
                command,
                timeout_sec,
            } = hook
            {
                let step = StepSpec {
                    name: format!("{} hook {}", phase, idx),
                    action: StepAction::Command {
                        command: command.clone(),
                        capture_output: false,
                        timeout_sec: *timeout_sec,
                    },
                    interrupts: false,
                    awaits_restart: false,
                };
                let label = format!("b{}_{}{}", block.id, phase, idx);
                self.executor.execute(self.ctx, &label, &step)?;
            }
        }
        Ok(())
    }

    fn finish_pass(&mut self, results: &ResultDir) -> RunResult<RunOutcome> {
        let message = format!(
            "{} cycle(s) completed",
            self.ctx.config.run.total_cycles
        );
        results.write_marker(Verdict::Pass, &message)?;
        self.backup(results);
        self.ctx.store.clear()?;
        self.ctx.log("=== TEST FINISHED: PASS ===");
        self.ctx.status(Status::FinishedPass.as_str());
        Ok(RunOutcome::Passed)
    }

    fn finish_fail(
        &mut self,
        results: &ResultDir,
        position: &Checkpoint,
        failure: FailureRecord,
    ) -> RunResult<RunOutcome> {
        let mut cp = position.clone();
        cp.status = Status::FinishedFail;
        cp.failure = Some(failure.clone());
        cp.plan_digest = Some(self.digest.clone());
        self.ctx.store.save(&cp)?;
        results.write_marker(Verdict::Fail, &format!("{}: {}", failure.code, failure.message))?;
        self.backup(results);
        self.ctx.log(&format!("=== TEST STOPPED: FAIL ({}) ===", failure.message));
        self.ctx.status(Status::FinishedFail.as_str());
        Ok(RunOutcome::Failed(failure))
    }

    /// Archive copy; failures are logged and never change the verdict.
    fn backup(&self, results: &ResultDir) {
        let Some(root) = self.ctx.config.artifacts.backup_dir.as_ref() else {
            return;
        };
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        match results.backup_to(root, &stamp) {
            Ok(copy) => self.ctx.log(&format!("Results backed up to {}", copy.display())),
            Err(err) => self.ctx.log(&format!("Result backup failed: {}", err)),
        }
    }
}
