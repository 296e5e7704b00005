use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::{AnalysisError, AnalysisResult};

/// UTC, fixed width, lexically sortable.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl TelemetrySample {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, channel: &str, value: f64) -> Self {
        self.values.insert(channel.to_string(), value);
        self
    }
}

/// Append-only series with a fixed channel list taken from the header row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySeries {
    channels: Vec<String>,
    samples: Vec<TelemetrySample>,
}

impl TelemetrySeries {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            samples: Vec::new(),
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn samples(&self) -> &[TelemetrySample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.timestamp)
    }

    pub fn push(&mut self, sample: TelemetrySample) -> AnalysisResult<()> {
        if let Some(previous) = self.last_timestamp() {
            if sample.timestamp < previous {
                return Err(AnalysisError::OutOfOrder {
                    timestamp: format_timestamp(&sample.timestamp),
                    previous: format_timestamp(&previous),
                });
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Values of `channel` at or after `since`. `None` when the channel is not
    /// part of the series at all.
    pub fn values_since(&self, channel: &str, since: DateTime<Utc>) -> Option<Vec<f64>> {
        if !self.has_channel(channel) {
            return None;
        }
        Some(
            self.samples
                .iter()
                .filter(|s| s.timestamp >= since)
                .filter_map(|s| s.values.get(channel).copied())
                .collect(),
        )
    }

    pub fn read_from(path: &Path) -> AnalysisResult<Self> {
        if !path.exists() {
            return Err(AnalysisError::TelemetryMissing(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Path) -> AnalysisResult<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines
            .next()
            .ok_or_else(|| AnalysisError::TelemetryMissing(origin.to_path_buf()))?;
        let mut columns = header.split(',').map(|c| c.trim().to_string());
        match columns.next() {
            Some(first) if first.eq_ignore_ascii_case("timestamp") => {}
            _ => {
                return Err(malformed(origin, 1, "header must start with `timestamp`"));
            }
        }
        let mut series = Self::new(columns.collect());
        for (idx, line) in lines {
            let line_no = idx + 1;
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != series.channels.len() + 1 {
                return Err(malformed(
                    origin,
                    line_no,
                    &format!(
                        "expected {} fields, found {}",
                        series.channels.len() + 1,
                        fields.len()
                    ),
                ));
            }
            let timestamp = parse_timestamp(fields[0])
                .ok_or_else(|| malformed(origin, line_no, "unparseable timestamp"))?;
            let mut sample = TelemetrySample::new(timestamp);
            for (channel, raw) in series.channels.iter().zip(&fields[1..]) {
                let value: f64 = raw.parse().map_err(|_| {
                    malformed(origin, line_no, &format!("bad value for {}: {}", channel, raw))
                })?;
                sample.values.insert(channel.clone(), value);
            }
            series.push(sample)?;
        }
        Ok(series)
    }
}

fn malformed(path: &Path, line: usize, reason: &str) -> AnalysisError {
    AnalysisError::Malformed {
        path: path.to_path_buf(),
        line,
        reason: reason.to_string(),
    }
}

/// Single-writer sink for a series file. Every row is flushed as it is
/// written so a reader never observes a torn row.
pub struct SeriesWriter {
    path: PathBuf,
    out: BufWriter<fs::File>,
    series: TelemetrySeries,
}

impl SeriesWriter {
    pub fn create(path: &Path, channels: &[String]) -> AnalysisResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(fs::File::create(path)?);
        writeln!(out, "timestamp,{}", channels.join(","))?;
        out.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            series: TelemetrySeries::new(channels.to_vec()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Channels absent from `sample` are written as `0`.
    pub fn append(&mut self, sample: TelemetrySample) -> AnalysisResult<()> {
        let mut row = format_timestamp(&sample.timestamp);
        for channel in self.series.channels() {
            let value = sample.values.get(channel).copied().unwrap_or(0.0);
            row.push(',');
            row.push_str(&value.to_string());
        }
        self.series.push(sample)?;
        writeln!(self.out, "{}", row)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> AnalysisResult<TelemetrySeries> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("ts")
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = format_timestamp(&ts(9));
        let b = format_timestamp(&ts(10));
        assert!(a < b, "{} !< {}", a, b);
        assert_eq!(parse_timestamp(&a), Some(ts(9)));
    }

    #[test]
    fn push_rejects_time_going_backwards() {
        let mut series = TelemetrySeries::new(vec!["fan".to_string()]);
        series
            .push(TelemetrySample::new(ts(5)).with("fan", 1.0))
            .expect("first");
        series
            .push(TelemetrySample::new(ts(5)).with("fan", 2.0))
            .expect("equal timestamps are fine");
        let err = series
            .push(TelemetrySample::new(ts(4)).with("fan", 3.0))
            .expect_err("earlier sample");
        assert!(matches!(err, AnalysisError::OutOfOrder { .. }));
    }

    #[test]
    fn writer_output_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("thermal").join("series.csv");
        let channels = vec!["cpu_temp".to_string(), "fan_rpm".to_string()];
        let mut writer = SeriesWriter::create(&path, &channels).expect("create");
        writer
            .append(TelemetrySample::new(ts(0)).with("cpu_temp", 71.5).with("fan_rpm", 4200.0))
            .expect("row 1");
        writer
            .append(TelemetrySample::new(ts(1)).with("cpu_temp", 72.0))
            .expect("row 2");
        let written = writer.finish().expect("finish");

        let read = TelemetrySeries::read_from(&path).expect("read");
        assert_eq!(read.channels(), channels.as_slice());
        assert_eq!(read.len(), 2);
        assert_eq!(read.samples()[1].values["fan_rpm"], 0.0);
        assert_eq!(written.samples()[0], read.samples()[0]);
    }

    #[test]
    fn read_missing_file_is_telemetry_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = TelemetrySeries::read_from(&dir.path().join("nope.csv")).expect_err("missing");
        assert!(matches!(err, AnalysisError::TelemetryMissing(_)));
    }

    #[test]
    fn parse_reports_line_of_bad_row() {
        let text = "timestamp,a\n2024-01-01T00:00:00.000Z,1\n2024-01-01T00:00:01.000Z,x\n";
        match TelemetrySeries::parse(text, Path::new("s.csv")) {
            Err(AnalysisError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn values_since_distinguishes_missing_channel() {
        let mut series = TelemetrySeries::new(vec!["a".to_string()]);
        series
            .push(TelemetrySample::new(ts(0)).with("a", 1.0))
            .expect("push");
        series
            .push(TelemetrySample::new(ts(10)).with("a", 3.0))
            .expect("push");
        assert_eq!(series.values_since("a", ts(5)), Some(vec![3.0]));
        assert_eq!(series.values_since("b", ts(0)), None);
    }
}
