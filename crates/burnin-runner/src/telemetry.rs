//! Telemetry sources and the background sampler that records them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use burnin_analysis::{AnalysisResult, SeriesWriter, TelemetrySample, TelemetrySeries};
use chrono::{DateTime, Utc};

use crate::config::{EcRegister, MonitorColumn, TelemetrySourceConfig};
use crate::context::EventSink;
use crate::ec::SharedEc;
use crate::error::{RunError, RunResult};

pub trait TelemetrySource: Send {
    fn channels(&self) -> Vec<String>;
    /// One reading per channel. An error costs one sample, not the run.
    fn read(&mut self) -> RunResult<BTreeMap<String, f64>>;
}

pub struct EcTelemetrySource {
    ec: SharedEc,
    registers: Vec<EcRegister>,
}

impl EcTelemetrySource {
    pub fn new(ec: SharedEc, registers: Vec<EcRegister>) -> Self {
        Self { ec, registers }
    }
}

impl TelemetrySource for EcTelemetrySource {
    fn channels(&self) -> Vec<String> {
        self.registers.iter().map(|r| r.name.clone()).collect()
    }

    fn read(&mut self) -> RunResult<BTreeMap<String, f64>> {
        let mut values = BTreeMap::new();
        for register in &self.registers {
            let bytes = self.ec.transact(register.command, &register.payload)?;
            if bytes.is_empty() {
                return Err(RunError::Ec(format!("empty response for {}", register.name)));
            }
            // Little-endian, as the EC lays out multi-byte registers.
            let raw = bytes
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            values.insert(register.name.clone(), raw as f64 * register.scale);
        }
        Ok(values)
    }
}

/// Follows the CSV log a companion monitor writes and takes its newest row.
pub struct MonitorLogSource {
    path: PathBuf,
    columns: Vec<MonitorColumn>,
}

impl MonitorLogSource {
    pub fn new(path: &Path, columns: Vec<MonitorColumn>) -> Self {
        Self {
            path: path.to_path_buf(),
            columns,
        }
    }
}

impl TelemetrySource for MonitorLogSource {
    fn channels(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn read(&mut self) -> RunResult<BTreeMap<String, f64>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunError::TelemetryMissing(self.path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut rows = text.lines().filter(|l| !l.trim().is_empty());
        let header: Vec<&str> = rows
            .next()
            .ok_or_else(|| RunError::TelemetryMissing(self.path.display().to_string()))?
            .split(',')
            .map(str::trim)
            .collect();
        let last: Vec<&str> = rows
            .last()
            .ok_or_else(|| RunError::TelemetryMissing(format!("{} has no rows", self.path.display())))?
            .split(',')
            .map(str::trim)
            .collect();
        let mut values = BTreeMap::new();
        for column in &self.columns {
            let idx = header
                .iter()
                .position(|h| *h == column.column)
                .ok_or_else(|| {
                    RunError::TelemetryMissing(format!(
                        "column `{}` not in {}",
                        column.column,
                        self.path.display()
                    ))
                })?;
            let value = last
                .get(idx)
                .and_then(|raw| raw.parse::<f64>().ok())
                .ok_or_else(|| {
                    RunError::TelemetryMissing(format!("no numeric `{}` in last row", column.column))
                })?;
            values.insert(column.name.clone(), value);
        }
        Ok(values)
    }
}

pub fn source_from_config(
    config: &TelemetrySourceConfig,
    ec: &SharedEc,
) -> Box<dyn TelemetrySource> {
    match config {
        TelemetrySourceConfig::Ec { registers } => {
            Box::new(EcTelemetrySource::new(ec.clone(), registers.clone()))
        }
        TelemetrySourceConfig::MonitorLog { path, columns, .. } => {
            Box::new(MonitorLogSource::new(path, columns.clone()))
        }
    }
}

pub struct Sampler;

impl Sampler {
    /// Creates the series file (header included) before returning, then
    /// samples on a dedicated thread until the handle is stopped.
    pub fn start(
        mut source: Box<dyn TelemetrySource>,
        path: &Path,
        interval: Duration,
        events: Arc<dyn EventSink>,
    ) -> RunResult<SamplerHandle> {
        let channels = source.channels();
        let mut writer = SeriesWriter::create(path, &channels)?;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("telemetry-sampler".to_string())
            .spawn(move || -> AnalysisResult<TelemetrySeries> {
                let mut previous: Option<DateTime<Utc>> = None;
                let mut failures = 0u64;
                loop {
                    let values = match source.read() {
                        Ok(values) => values,
                        Err(err) => {
                            failures += 1;
                            events.log(&format!("Telemetry read failed, recording zeros: {}", err));
                            BTreeMap::new()
                        }
                    };
                    let now = match previous {
                        Some(prev) if Utc::now() < prev => prev,
                        _ => Utc::now(),
                    };
                    let mut sample = TelemetrySample::new(now);
                    for channel in &channels {
                        sample.values.insert(
                            channel.clone(),
                            values.get(channel).copied().unwrap_or(0.0),
                        );
                    }
                    writer.append(sample)?;
                    previous = Some(now);
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                if failures > 0 {
                    tracing::warn!(failures, "telemetry reads failed during sampling");
                }
                writer.finish()
            })?;
        Ok(SamplerHandle {
            path: path.to_path_buf(),
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }
}

pub struct SamplerHandle {
    path: PathBuf,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<AnalysisResult<TelemetrySeries>>>,
}

impl SamplerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the in-flight sample is written and the file is synced.
    pub fn stop(mut self) -> RunResult<TelemetrySeries> {
        self.shutdown()
            .unwrap_or_else(|| Err(RunError::TelemetryMissing(self.path.display().to_string())))
    }

    fn shutdown(&mut self) -> Option<RunResult<TelemetrySeries>> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let join = self.join.take()?;
        Some(match join.join() {
            Ok(result) => result.map_err(RunError::from),
            Err(_) => Err(RunError::TelemetryMissing(format!(
                "sampler for {} panicked",
                self.path.display()
            ))),
        })
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RecordingSink;
    use crate::ec::EcChannel;

    struct Scripted {
        calls: u32,
    }

    impl TelemetrySource for Scripted {
        fn channels(&self) -> Vec<String> {
            vec!["cpu_temp".to_string(), "fan_rpm".to_string()]
        }

        fn read(&mut self) -> RunResult<BTreeMap<String, f64>> {
            self.calls += 1;
            if self.calls == 2 {
                return Err(RunError::Ec("glitch".into()));
            }
            let mut values = BTreeMap::new();
            values.insert("cpu_temp".to_string(), 70.0);
            values.insert("fan_rpm".to_string(), 4000.0);
            Ok(values)
        }
    }

    #[test]
    fn sampler_survives_read_errors_and_flushes_on_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("telemetry").join("single.csv");
        let sink = Arc::new(RecordingSink::new());
        let handle = Sampler::start(
            Box::new(Scripted { calls: 0 }),
            &path,
            Duration::from_millis(20),
            sink.clone(),
        )
        .expect("start");
        thread::sleep(Duration::from_millis(150));
        let series = handle.stop().expect("stop");

        assert!(series.len() >= 3, "only {} samples", series.len());
        assert_eq!(series.samples()[1].values["cpu_temp"], 0.0);
        assert_eq!(series.samples()[2].values["cpu_temp"], 70.0);
        assert!(sink.logs().iter().any(|l| l.contains("glitch")));

        let on_disk = TelemetrySeries::read_from(&path).expect("reload");
        assert_eq!(on_disk.len(), series.len());
        assert_eq!(on_disk.channels(), series.channels());
        let stamps: Vec<_> = on_disk.samples().iter().map(|s| s.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn ec_source_scales_little_endian_registers() {
        struct Fixed;
        impl EcChannel for Fixed {
            fn transact(&mut self, _command: u8, payload: &[u8]) -> RunResult<Vec<u8>> {
                Ok(match payload.first() {
                    Some(0x64) => vec![0x10, 0x00],
                    _ => vec![0x3C],
                })
            }
        }
        let ec = SharedEc::new(Box::new(Fixed));
        let mut source = EcTelemetrySource::new(
            ec,
            vec![
                EcRegister {
                    name: "cpu_temp".into(),
                    command: 0x80,
                    payload: vec![0x60],
                    scale: 1.0,
                },
                EcRegister {
                    name: "fan_rpm".into(),
                    command: 0x80,
                    payload: vec![0x64],
                    scale: 32.0,
                },
            ],
        );
        let values = source.read().expect("read");
        assert_eq!(values["cpu_temp"], 60.0);
        assert_eq!(values["fan_rpm"], 512.0);
    }

    #[test]
    fn monitor_log_uses_newest_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ptat.csv");
        fs::write(
            &path,
            "Time, CPU Temp, Package Power\n00:01, 61.5, 20\n00:02, 63.0, 22.5\n\n",
        )
        .expect("write");
        let mut source = MonitorLogSource::new(
            &path,
            vec![
                MonitorColumn {
                    name: "cpu_temp".into(),
                    column: "CPU Temp".into(),
                },
                MonitorColumn {
                    name: "cpu_power".into(),
                    column: "Package Power".into(),
                },
            ],
        );
        let values = source.read().expect("read");
        assert_eq!(values["cpu_temp"], 63.0);
        assert_eq!(values["cpu_power"], 22.5);
    }

    #[test]
    fn monitor_log_absent_is_telemetry_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut source = MonitorLogSource::new(&dir.path().join("nope.csv"), Vec::new());
        let err = source.read().expect_err("missing");
        assert_eq!(err.error_code(), "telemetry_missing");
    }
}
