use std::time::Duration;

use crate::context::RunContext;
use crate::error::RunResult;
use crate::process::ProcessManager;

const AUTOSTART_TIMEOUT: Duration = Duration::from_secs(30);

/// Restarts the host. On return the caller stops and waits to be relaunched;
/// everything needed to resume is already in the checkpoint.
pub trait Rebooter {
    fn reboot(&mut self, ctx: &RunContext) -> RunResult<()>;
}

/// Registers the auto-start command, then issues the reboot command.
pub struct CommandRebooter {
    processes: ProcessManager,
}

impl CommandRebooter {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            processes: ProcessManager::from_context(ctx),
        }
    }
}

impl Rebooter for CommandRebooter {
    fn reboot(&mut self, ctx: &RunContext) -> RunResult<()> {
        let settings = &ctx.config.run.reboot;
        if let Some(autostart) = &settings.autostart_command {
            self.processes
                .run_and_wait(autostart, Some(AUTOSTART_TIMEOUT), true)?;
            ctx.log("Auto-start registered");
        }
        ctx.log("Reboot triggered, shutting down");
        self.processes.run_and_wait(
            &settings.command,
            Some(Duration::from_secs(settings.timeout_sec)),
            false,
        )
    }
}
