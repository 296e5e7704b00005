use std::path::PathBuf;

use burnin_analysis::{format_value, AnalysisError, EvaluationItem};
use thiserror::Error;

pub type RunResult<T> = Result<T, RunError>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("command failed: `{command}` (exit code {code})")]
    CommandFailed { command: String, code: i32 },

    #[error("timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        operation: String,
        timeout_ms: u64,
        pid: Option<u32>,
    },

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("telemetry missing: {0}")]
    TelemetryMissing(String),

    #[error("threshold violation: {}", describe_violations(.0))]
    ThresholdViolation(Vec<EvaluationItem>),

    #[error("config missing: {0}")]
    ConfigMissing(String),

    #[error("invalid config: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("checkpoint at {path} is unreadable: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("another run holds {path} (pid {pid})")]
    RunInProgress { path: PathBuf, pid: u32 },

    #[error("battery unavailable: {0}")]
    BatteryUnavailable(String),

    #[error("ec transaction failed: {0}")]
    Ec(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml failure: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl RunError {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CommandFailed { .. } => "command_failed",
            Self::Timeout { .. } => "timeout",
            Self::Aborted(_) => "aborted",
            Self::TelemetryMissing(_) => "telemetry_missing",
            Self::ThresholdViolation(_) => "threshold_violation",
            Self::ConfigMissing(_) => "config_missing",
            Self::InvalidConfig(_) => "invalid_config",
            Self::CheckpointCorrupt { .. } => "checkpoint_corrupt",
            Self::RunInProgress { .. } => "run_in_progress",
            Self::BatteryUnavailable(_) => "battery_unavailable",
            Self::Ec(_) => "ec_failure",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Yaml(_) => "yaml",
            Self::Analysis(AnalysisError::TelemetryMissing(_)) => "telemetry_missing",
            Self::Analysis(_) => "analysis",
        }
    }
}

fn describe_violations(items: &[EvaluationItem]) -> String {
    if items.is_empty() {
        return "no items".to_string();
    }
    items
        .iter()
        .map(|i| {
            format!(
                "{}={} not in [{}, {}]",
                i.item,
                format_value(i.observed),
                i.low,
                i.high
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use burnin_analysis::Verdict;

    #[test]
    fn violation_message_lists_every_item() {
        let items = vec![
            EvaluationItem {
                item: "cpu_temp".into(),
                observed: Some(101.0),
                low: 60.0,
                high: 95.0,
                result: Verdict::Fail,
            },
            EvaluationItem {
                item: "fan_rpm".into(),
                observed: None,
                low: 3000.0,
                high: 6000.0,
                result: Verdict::Fail,
            },
        ];
        let msg = RunError::ThresholdViolation(items).to_string();
        assert!(msg.contains("cpu_temp=101.00 not in [60, 95]"), "{}", msg);
        assert!(msg.contains("fan_rpm=N/A"), "{}", msg);
    }

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(
            RunError::CommandFailed {
                command: "x".into(),
                code: 1
            }
            .error_code(),
            "command_failed"
        );
        assert_eq!(RunError::Aborted("stop".into()).error_code(), "aborted");
        assert!(RunError::Aborted("stop".into()).is_abort());
        assert_eq!(
            RunError::from(AnalysisError::TelemetryMissing("p".into())).error_code(),
            "telemetry_missing"
        );
    }
}
