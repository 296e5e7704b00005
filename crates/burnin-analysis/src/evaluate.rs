use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AnalysisError, AnalysisResult, TelemetrySeries};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecBound {
    pub metric: String,
    pub low: f64,
    pub high: f64,
}

impl SpecBound {
    pub fn new(metric: &str, low: f64, high: f64) -> Self {
        Self {
            metric: metric.to_string(),
            low,
            high,
        }
    }

    /// Inclusive on both ends. A missing observation never satisfies a bound.
    pub fn admits(&self, observed: Option<f64>) -> bool {
        match observed {
            Some(v) => v >= self.low && v <= self.high,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn from_bool(passed: bool) -> Self {
        if passed {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationItem {
    pub item: String,
    /// `None` when the trailing window held no samples.
    pub observed: Option<f64>,
    pub low: f64,
    pub high: f64,
    pub result: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StructuralError {
    MissingSeries(PathBuf),
    MissingColumn(String),
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSeries(path) => write!(f, "telemetry log missing: {}", path.display()),
            Self::MissingColumn(column) => write!(f, "configured column missing: {}", column),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub items: Vec<EvaluationItem>,
    pub structural_errors: Vec<StructuralError>,
}

impl EvaluationReport {
    pub fn passed(&self) -> bool {
        self.structural_errors.is_empty() && self.items.iter().all(|i| i.result == Verdict::Pass)
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::from_bool(self.passed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &EvaluationItem> {
        self.items.iter().filter(|i| i.result == Verdict::Fail)
    }

    pub fn push_item(&mut self, item: &str, observed: Option<f64>, low: f64, high: f64) {
        let result = Verdict::from_bool(SpecBound::new(item, low, high).admits(observed));
        self.items.push(EvaluationItem {
            item: item.to_string(),
            observed,
            low,
            high,
            result,
        });
    }

    pub fn missing_series(&self) -> Option<&Path> {
        self.structural_errors.iter().find_map(|e| match e {
            StructuralError::MissingSeries(path) => Some(path.as_path()),
            StructuralError::MissingColumn(_) => None,
        })
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Mean of each bound's metric over `[now - window, ..]`, compared inclusively.
/// Every bound is evaluated; nothing short-circuits.
pub fn evaluate(
    series: &TelemetrySeries,
    bounds: &[SpecBound],
    window: Duration,
    now: DateTime<Utc>,
) -> EvaluationReport {
    let since = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut report = EvaluationReport::default();
    for bound in bounds {
        let observed = match series.values_since(&bound.metric, since) {
            Some(values) => mean(&values),
            None => {
                report
                    .structural_errors
                    .push(StructuralError::MissingColumn(bound.metric.clone()));
                None
            }
        };
        report.push_item(&bound.metric, observed, bound.low, bound.high);
    }
    report
}

/// Window anchored at the last recorded sample, which for a closed series is
/// the moment sampling stopped.
pub fn evaluate_trailing(
    series: &TelemetrySeries,
    bounds: &[SpecBound],
    window: Duration,
) -> EvaluationReport {
    let now = series.last_timestamp().unwrap_or_else(Utc::now);
    evaluate(series, bounds, window, now)
}

/// An absent series file is a structural failure of the report rather than
/// an error, so every bound still shows up as FAIL in the summary.
pub fn evaluate_file(
    path: &Path,
    bounds: &[SpecBound],
    window: Duration,
) -> AnalysisResult<EvaluationReport> {
    match TelemetrySeries::read_from(path) {
        Ok(series) => Ok(evaluate_trailing(&series, bounds, window)),
        Err(AnalysisError::TelemetryMissing(missing)) => {
            let mut report = EvaluationReport::default();
            report
                .structural_errors
                .push(StructuralError::MissingSeries(missing));
            for bound in bounds {
                report.push_item(&bound.metric, None, bound.low, bound.high);
            }
            Ok(report)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TelemetrySample;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().expect("t0")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn empty_series_never_passes() {
        let series = TelemetrySeries::new(vec!["m".to_string()]);
        let report = evaluate(
            &series,
            &[SpecBound::new("m", 0.0, 100.0)],
            Duration::from_secs(120),
            t0(),
        );
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].result, Verdict::Fail);
        assert_eq!(report.items[0].observed, None);
        assert!(!report.passed());
    }

    #[test]
    fn single_sample_inside_band_passes() {
        let mut series = TelemetrySeries::new(vec!["m".to_string()]);
        series
            .push(TelemetrySample::new(t0()).with("m", 50.0))
            .expect("push");
        let report = evaluate(
            &series,
            &[SpecBound::new("m", 40.0, 60.0)],
            Duration::from_secs(120),
            t0(),
        );
        assert!(report.passed());
        assert_eq!(report.items[0].observed, Some(50.0));
    }

    #[test]
    fn only_trailing_window_is_averaged() {
        let mut series = TelemetrySeries::new(vec!["temp".to_string()]);
        for (secs, value) in [(0, 200.0), (100, 80.0), (150, 90.0), (200, 85.0)] {
            series
                .push(TelemetrySample::new(at(secs)).with("temp", value))
                .expect("push");
        }
        let report = evaluate(
            &series,
            &[SpecBound::new("temp", 70.0, 95.0)],
            Duration::from_secs(100),
            at(200),
        );
        assert_eq!(report.items[0].observed, Some(85.0));
        assert!(report.passed());
    }

    #[test]
    fn bounds_are_inclusive() {
        let bound = SpecBound::new("m", 40.0, 60.0);
        assert!(bound.admits(Some(40.0)));
        assert!(bound.admits(Some(60.0)));
        assert!(!bound.admits(Some(60.01)));
        assert!(!bound.admits(None));
    }

    #[test]
    fn collects_every_violation() {
        let mut series = TelemetrySeries::new(vec!["a".into(), "b".into(), "c".into()]);
        series
            .push(
                TelemetrySample::new(t0())
                    .with("a", 1.0)
                    .with("b", 50.0)
                    .with("c", 99.0),
            )
            .expect("push");
        let bounds = [
            SpecBound::new("a", 10.0, 20.0),
            SpecBound::new("b", 0.0, 100.0),
            SpecBound::new("c", 0.0, 10.0),
        ];
        let report = evaluate(&series, &bounds, Duration::from_secs(60), t0());
        let failed: Vec<&str> = report.failures().map(|i| i.item.as_str()).collect();
        assert_eq!(failed, vec!["a", "c"]);
    }

    #[test]
    fn missing_column_is_structural() {
        let mut series = TelemetrySeries::new(vec!["a".into()]);
        series
            .push(TelemetrySample::new(t0()).with("a", 5.0))
            .expect("push");
        let report = evaluate(
            &series,
            &[SpecBound::new("a", 0.0, 10.0), SpecBound::new("gpu_power", 0.0, 10.0)],
            Duration::from_secs(60),
            t0(),
        );
        assert_eq!(
            report.structural_errors,
            vec![StructuralError::MissingColumn("gpu_power".into())]
        );
        assert_eq!(report.items[0].result, Verdict::Pass);
        assert!(!report.passed());
    }

    #[test]
    fn evaluate_file_turns_absent_log_into_failed_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ptat.csv");
        let report = evaluate_file(&path, &[SpecBound::new("m", 0.0, 1.0)], Duration::from_secs(5))
            .expect("report");
        assert_eq!(report.missing_series(), Some(path.as_path()));
        assert_eq!(report.verdict(), Verdict::Fail);
    }
}
