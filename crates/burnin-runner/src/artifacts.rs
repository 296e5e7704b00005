use std::fs;
use std::path::{Path, PathBuf};

use burnin_analysis::Verdict;

use crate::error::RunResult;
use crate::files::{atomic_write_bytes, ensure_dir, remove_if_exists};

/// The per-run result directory: reports, telemetry and the verdict marker.
#[derive(Debug, Clone)]
pub struct ResultDir {
    path: PathBuf,
}

impl ResultDir {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empties the directory for a fresh run.
    pub fn reset(&self) -> RunResult<()> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        ensure_dir(&self.path)
    }

    pub fn clear_markers(&self) -> RunResult<()> {
        for verdict in [Verdict::Pass, Verdict::Fail] {
            remove_if_exists(&self.path.join(verdict.as_str()))?;
        }
        Ok(())
    }

    /// `PASS` and `FAIL` never coexist: the other marker is removed first.
    pub fn write_marker(&self, verdict: Verdict, message: &str) -> RunResult<PathBuf> {
        self.clear_markers()?;
        let path = self.path.join(verdict.as_str());
        atomic_write_bytes(&path, format!("{}\n{}\n", verdict, message).as_bytes())?;
        Ok(path)
    }

    pub fn marker(&self) -> RunResult<Option<(Verdict, String)>> {
        for verdict in [Verdict::Pass, Verdict::Fail] {
            let path = self.path.join(verdict.as_str());
            match fs::read_to_string(&path) {
                Ok(text) => {
                    let message = text.lines().nth(1).unwrap_or_default().to_string();
                    return Ok(Some((verdict, message)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Copies the whole directory to `<root>/result_<stamp>`.
    pub fn backup_to(&self, root: &Path, stamp: &str) -> RunResult<PathBuf> {
        let target_root = root.join(format!("result_{}", stamp));
        ensure_dir(&target_root)?;
        for entry in walkdir::WalkDir::new(&self.path) {
            let entry = entry.map_err(std::io::Error::from)?;
            let rel = match entry.path().strip_prefix(&self.path) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let target = target_root.join(rel);
            if entry.file_type().is_dir() {
                ensure_dir(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    ensure_dir(parent)?;
                }
                fs::copy(entry.path(), &target)?;
            }
        }
        Ok(target_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_mutually_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = ResultDir::new(&dir.path().join("result"));
        results.reset().expect("reset");
        results.write_marker(Verdict::Fail, "cpu_temp out of band").expect("fail");
        results.write_marker(Verdict::Pass, "all blocks passed").expect("pass");
        assert!(!results.path().join("FAIL").exists());
        assert_eq!(
            results.marker().expect("marker"),
            Some((Verdict::Pass, "all blocks passed".to_string()))
        );
        assert_eq!(
            fs::read_to_string(results.path().join("PASS")).expect("read"),
            "PASS\nall blocks passed\n"
        );
    }

    #[test]
    fn reset_clears_previous_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = ResultDir::new(&dir.path().join("result"));
        results.write_marker(Verdict::Pass, "old").expect("pass");
        fs::write(results.path().join("old_report.csv"), "x").expect("write");
        results.reset().expect("reset");
        assert!(results.marker().expect("marker").is_none());
        assert_eq!(fs::read_dir(results.path()).expect("dir").count(), 0);
    }

    #[test]
    fn backup_copies_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = ResultDir::new(&dir.path().join("result"));
        results.reset().expect("reset");
        fs::create_dir_all(results.path().join("telemetry")).expect("mkdir");
        fs::write(results.path().join("telemetry").join("single.csv"), "t\n").expect("write");
        results.write_marker(Verdict::Pass, "ok").expect("marker");
        let copied = results
            .backup_to(&dir.path().join("archive"), "20240501_080000")
            .expect("backup");
        assert!(copied.join("PASS").exists());
        assert!(copied.join("telemetry").join("single.csv").exists());
    }
}
