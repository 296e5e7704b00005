//! The durable resume anchor, the single-instance run lock and crash notes.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{RunError, RunResult};
use crate::files::{append_json_line, atomic_write_json_pretty, ensure_dir, remove_if_exists};
use crate::process::process_alive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BlockId {
    Thermal = 1,
    Aging = 2,
    Battery = 3,
}

impl BlockId {
    pub const ALL: [BlockId; 3] = [BlockId::Thermal, BlockId::Aging, BlockId::Battery];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Thermal => "Thermal",
            Self::Aging => "Aging",
            Self::Battery => "Battery",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Thermal => Some(Self::Aging),
            Self::Aging => Some(Self::Battery),
            Self::Battery => None,
        }
    }
}

impl TryFrom<u8> for BlockId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Thermal),
            2 => Ok(Self::Aging),
            3 => Ok(Self::Battery),
            other => Err(format!("block id must be 1, 2 or 3 (got {})", other)),
        }
    }
}

impl From<BlockId> for u8 {
    fn from(id: BlockId) -> Self {
        id.as_u8()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Idle,
    Running,
    Rebooting,
    FinishedPass,
    FinishedFail,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Rebooting => "REBOOTING",
            Self::FinishedPass => "FINISHED_PASS",
            Self::FinishedFail => "FINISHED_FAIL",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::FinishedPass | Self::FinishedFail)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub code: String,
    pub message: String,
}

impl FailureRecord {
    pub fn from_error(err: &RunError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// `step` is the index of the step to execute next. For a `RUNNING` record it
/// is the step that was in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block: BlockId,
    pub step: usize,
    pub cycle: u32,
    pub status: Status,
    /// Consecutive crashes observed at this position.
    #[serde(default)]
    pub crash_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Checkpoint {
    pub fn new(block: BlockId, step: usize, cycle: u32, status: Status) -> Self {
        Self {
            block,
            step,
            cycle,
            status,
            crash_count: 0,
            failure: None,
            plan_digest: None,
            updated_at: None,
        }
    }

    pub fn same_position(&self, other: &Checkpoint) -> bool {
        self.block == other.block && self.step == other.step && self.cycle == other.cycle
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// `None` means no run is in progress.
    pub fn load(&self) -> RunResult<Option<Checkpoint>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint =
            serde_json::from_str(&raw).map_err(|e| RunError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if checkpoint.cycle == 0 {
            return Err(RunError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: "cycle must be >= 1".to_string(),
            });
        }
        Ok(Some(checkpoint))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> RunResult<()> {
        let mut record = checkpoint.clone();
        record.updated_at = Some(Utc::now().to_rfc3339());
        atomic_write_json_pretty(&self.path, &record)?;
        tracing::debug!(
            block = %record.block,
            step = record.step,
            cycle = record.cycle,
            status = %record.status,
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn clear(&self) -> RunResult<bool> {
        remove_if_exists(&self.path)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: String,
}

/// Held for the lifetime of one sequencer instance; the file goes with it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> RunResult<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        match Self::create(path) {
            Err(RunError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<LockRecord>(&raw).ok());
                match holder {
                    Some(record)
                        if record.pid != std::process::id() && process_alive(record.pid) =>
                    {
                        Err(RunError::RunInProgress {
                            path: path.to_path_buf(),
                            pid: record.pid,
                        })
                    }
                    stale => {
                        tracing::warn!(
                            path = %path.display(),
                            pid = stale.map(|r| r.pid),
                            "taking over stale run lock"
                        );
                        remove_if_exists(path)?;
                        Self::create(path)
                    }
                }
            }
            other => other,
        }
    }

    fn create(path: &Path) -> RunResult<Self> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        let mut payload = serde_json::to_vec(&record)?;
        payload.push(b'\n');
        file.write_all(&payload)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashNote {
    pub detected_at: String,
    pub block: BlockId,
    pub step: usize,
    pub cycle: u32,
    pub crash_count: u32,
    pub action: String,
}

impl CrashNote {
    pub fn new(checkpoint: &Checkpoint, crash_count: u32, action: &str) -> Self {
        Self {
            detected_at: Utc::now().to_rfc3339(),
            block: checkpoint.block,
            step: checkpoint.step,
            cycle: checkpoint.cycle,
            crash_count,
            action: action.to_string(),
        }
    }

    pub fn append(&self, path: &Path) -> RunResult<()> {
        append_json_line(path, self)
    }
}

pub fn read_crash_notes(path: &Path) -> RunResult<Vec<CrashNote>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut notes = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        notes.push(serde_json::from_str(line)?);
    }
    Ok(notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn without_timestamp(path: &Path) -> Value {
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json");
        value
            .as_object_mut()
            .expect("object")
            .remove("updated_at");
        value
    }

    #[test]
    fn missing_file_means_no_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(&dir.path().join("runin_state.json"));
        assert!(store.load().expect("load").is_none());
        assert!(!store.clear().expect("clear"));
    }

    #[test]
    fn reload_and_resave_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(&dir.path().join("runin_state.json"));
        let mut cp = Checkpoint::new(BlockId::Aging, 5, 1, Status::Running);
        cp.crash_count = 1;
        store.save(&cp).expect("save");
        let first = without_timestamp(store.path());

        let loaded = store.load().expect("load").expect("present");
        assert!(loaded.same_position(&cp));
        assert_eq!(loaded.status, Status::Running);
        store.save(&loaded).expect("resave");
        assert_eq!(without_timestamp(store.path()), first);
    }

    #[test]
    fn wire_format_uses_numeric_block_and_screaming_status() {
        let cp = Checkpoint::new(BlockId::Battery, 0, 2, Status::FinishedPass);
        let value = serde_json::to_value(&cp).expect("json");
        assert_eq!(value["block"], 3);
        assert_eq!(value["status"], "FINISHED_PASS");
        assert!(value.get("failure").is_none());
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runin_state.json");
        fs::write(&path, "{\"block\": 9, \"step\": 0}").expect("write");
        let err = CheckpointStore::new(&path).load().expect_err("corrupt");
        assert_eq!(err.error_code(), "checkpoint_corrupt");
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime").join("operation.lock");
        let lock = RunLock::acquire(&path).expect("acquire");
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn dead_holder_lock_is_taken_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("operation.lock");
        fs::write(&path, "{\"pid\":4294967290,\"acquired_at\":\"x\"}").expect("write");
        let lock = RunLock::acquire(&path).expect("stale takeover");
        let raw = fs::read_to_string(lock.path()).expect("read");
        assert!(raw.contains(&std::process::id().to_string()));
    }

    #[test]
    fn crash_notes_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crash_notes.jsonl");
        let cp = Checkpoint::new(BlockId::Aging, 5, 1, Status::Running);
        CrashNote::new(&cp, 1, "retry_in_place").append(&path).expect("1");
        CrashNote::new(&cp, 2, "retry_in_place").append(&path).expect("2");
        let notes = read_crash_notes(&path).expect("read");
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].crash_count, 2);
    }
}
