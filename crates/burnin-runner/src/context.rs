//! The explicit run context threaded through every component: plan, event
//! sink, cooperative stop flag, checkpoint store and on-disk layout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::checkpoint::CheckpointStore;
use crate::config::PlanConfig;
use crate::error::{RunError, RunResult};

/// Longest stretch any wait goes without looking at the stop flag.
pub const STOP_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> RunResult<()> {
        if self.is_cancelled() {
            return Err(RunError::Aborted("stop requested".to_string()));
        }
        Ok(())
    }

    /// Sleeps in short slices; returns `Aborted` as soon as a stop is seen.
    pub fn sleep(&self, duration: Duration) -> RunResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}

/// One-way notifications out of the core. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn log(&self, message: &str);
    fn status(&self, text: &str);
}

pub struct TracingSink;

impl EventSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!(target: "burnin::events", "{}", message);
    }

    fn status(&self, text: &str) {
        tracing::info!(target: "burnin::status", status = text, "status changed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Log(String),
    Status(String),
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Log(m) => Some(m),
                Event::Status(_) => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

impl EventSink for RecordingSink {
    fn log(&self, message: &str) {
        self.push(Event::Log(message.to_string()));
    }

    fn status(&self, text: &str) {
        self.push(Event::Status(text.to_string()));
    }
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub state_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub lock: PathBuf,
    pub crash_notes: PathBuf,
    pub results: PathBuf,
    pub telemetry: PathBuf,
    pub logs: PathBuf,
}

impl RunPaths {
    pub fn new(state_dir: &Path, result_dir: Option<&Path>) -> Self {
        let results = result_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| state_dir.join("result"));
        Self {
            state_dir: state_dir.to_path_buf(),
            checkpoint: state_dir.join("runin_state.json"),
            lock: state_dir.join("runtime").join("operation.lock"),
            crash_notes: state_dir.join("crash_notes.jsonl"),
            telemetry: results.join("telemetry"),
            results,
            logs: state_dir.join("log"),
        }
    }
}

pub struct RunContext {
    pub config: Arc<PlanConfig>,
    pub events: Arc<dyn EventSink>,
    pub cancel: CancelFlag,
    pub store: CheckpointStore,
    pub paths: RunPaths,
}

impl RunContext {
    pub fn new(config: PlanConfig, events: Arc<dyn EventSink>, cancel: CancelFlag) -> Self {
        let paths = RunPaths::new(
            &config.run.state_dir,
            config.artifacts.result_dir.as_deref(),
        );
        Self {
            store: CheckpointStore::new(&paths.checkpoint),
            config: Arc::new(config),
            events,
            cancel,
            paths,
        }
    }

    pub fn log(&self, message: &str) {
        self.events.log(message);
    }

    pub fn status(&self, text: &str) {
        self.events.status(text);
    }
}
