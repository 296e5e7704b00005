//! Telemetry series storage and windowed threshold evaluation.
//!
//! Nothing in here launches processes or touches hardware: the sampler in
//! `burnin-runner` writes series through [`SeriesWriter`], and the evaluator
//! reads them back as closed [`TelemetrySeries`] values.

mod evaluate;
mod report;
mod series;

use std::path::PathBuf;

use thiserror::Error;

pub use evaluate::{
    evaluate, evaluate_file, evaluate_trailing, mean, EvaluationItem, EvaluationReport, SpecBound,
    StructuralError, Verdict,
};
pub use report::{csv_field, format_value, render_report_csv, REPORT_HEADER};
pub use series::{
    format_timestamp, parse_timestamp, SeriesWriter, TelemetrySample, TelemetrySeries,
    TIMESTAMP_FORMAT,
};

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("telemetry missing: {0}")]
    TelemetryMissing(PathBuf),

    #[error("malformed telemetry at {path}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("sample at {timestamp} precedes previous sample at {previous}")]
    OutOfOrder { timestamp: String, previous: String },
}
