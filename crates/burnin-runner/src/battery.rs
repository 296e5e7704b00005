//! Battery gate, band-hold and charge/discharge cycle tests.
//!
//! The hysteresis itself ([`decide`], [`Hysteresis`]) is pure; the
//! [`BatteryController`] wires it to a [`BatteryProbe`] and a [`ChargeDriver`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use burnin_analysis::{
    render_report_csv, EvaluationReport, SeriesWriter, TelemetrySample, Verdict,
};
use chrono::{DateTime, Utc};

use crate::config::{BatteryConfig, BatteryProbeConfig, ToolLaunch};
use crate::context::{CancelFlag, EventSink};
use crate::ec::EcTool;
use crate::error::{RunError, RunResult};
use crate::files::atomic_write_bytes;
use crate::process::{is_running, CommandLine, OutputMode, ProcessManager};

const READ_RETRY: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const DEBUG_TO_DISCHARGE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    pub percent: u8,
    pub current_amps: f64,
    pub ac_online: Option<bool>,
}

pub trait BatteryProbe: Send {
    /// `Ok(None)` means the machine has no battery.
    fn read(&mut self) -> RunResult<Option<BatteryReading>>;
}

/// Reads the battery through shell one-liners (PowerShell/WMI by default).
pub struct CommandBatteryProbe {
    processes: ProcessManager,
    config: BatteryProbeConfig,
}

impl CommandBatteryProbe {
    pub fn new(processes: ProcessManager, config: BatteryProbeConfig) -> Self {
        Self { processes, config }
    }

    fn query(&self, command: &str) -> RunResult<Vec<String>> {
        self.processes.run(
            &CommandLine::shell(command),
            Some(PROBE_TIMEOUT),
            OutputMode::Collect,
        )
    }
}

impl BatteryProbe for CommandBatteryProbe {
    fn read(&mut self) -> RunResult<Option<BatteryReading>> {
        let percent = match interpret_percent(&self.query(&self.config.percent_command)?)? {
            Some(percent) => percent,
            None => return Ok(None),
        };
        let current_amps = match &self.config.current_command {
            Some(command) => match self.query(command) {
                Ok(lines) => parse_current(&lines),
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => {
                    tracing::debug!(error = %err, "charge current query failed");
                    0.0
                }
            },
            None => 0.0,
        };
        let ac_online = match &self.config.ac_command {
            Some(command) => self.query(command).ok().and_then(|l| parse_flag(&l)),
            None => None,
        };
        Ok(Some(BatteryReading {
            percent,
            current_amps,
            ac_online,
        }))
    }
}

pub fn parse_percent(lines: &[String]) -> Option<u8> {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
        .and_then(|l| l.parse::<u8>().ok())
        .filter(|p| *p <= 100)
}

/// Silent output means the machine reports no battery. Output that carries
/// no usable percentage is a read error so the caller can retry it.
pub fn interpret_percent(lines: &[String]) -> RunResult<Option<u8>> {
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Ok(None);
    }
    match parse_percent(lines) {
        Some(percent) => Ok(Some(percent)),
        None => Err(RunError::BatteryUnavailable(format!(
            "unreadable charge level: {:?}",
            lines.join(" | ")
        ))),
    }
}

/// `ChargeRate` (mW) over `Voltage` (mV) when both are listed, otherwise a
/// bare number taken as amps. Anything unreadable is `0.0`.
pub fn parse_current(lines: &[String]) -> f64 {
    let field = |name: &str| {
        lines
            .iter()
            .filter(|l| l.contains(name))
            .filter_map(|l| l.rsplit(':').next())
            .find_map(|v| v.trim().parse::<f64>().ok())
    };
    match (field("ChargeRate"), field("Voltage")) {
        (Some(rate), Some(voltage)) if voltage > 0.0 => rate / voltage,
        (Some(_), _) | (_, Some(_)) => 0.0,
        (None, None) => lines
            .iter()
            .find_map(|l| l.trim().parse::<f64>().ok())
            .unwrap_or(0.0),
    }
}

fn parse_flag(lines: &[String]) -> Option<bool> {
    lines.iter().find_map(|l| match l.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Charge,
    Discharge,
    Hold,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Charge => "charge",
            Self::Discharge => "discharge",
            Self::Hold => "hold",
        })
    }
}

/// `Hold` leaves whatever mode was last commanded in place.
pub fn decide(percent: u8, min: u8, max: u8) -> Decision {
    if percent <= min {
        Decision::Charge
    } else if percent >= max {
        Decision::Discharge
    } else {
        Decision::Hold
    }
}

/// Positive readings only; a non-positive one means the gauge is not
/// reporting charge current yet.
pub fn average_charge_current(samples: &[f64]) -> f64 {
    let positive: Vec<f64> = samples.iter().copied().filter(|a| *a > 0.0).collect();
    if positive.is_empty() {
        return 0.0;
    }
    positive.iter().sum::<f64>() / positive.len() as f64
}

#[derive(Debug, Clone)]
pub struct Hysteresis {
    min: u8,
    max: u8,
    tolerance: u8,
    entered_safe_zone: bool,
    validating: bool,
    commanded: Option<Decision>,
    recorded: Vec<u8>,
}

impl Hysteresis {
    pub fn new(min: u8, max: u8, tolerance: u8) -> Self {
        Self {
            min,
            max,
            tolerance,
            entered_safe_zone: false,
            validating: false,
            commanded: None,
            recorded: Vec::new(),
        }
    }

    /// Feeds one reading. Returns the mode to command, only when it differs
    /// from the mode already in force.
    pub fn observe(&mut self, percent: u8) -> Option<Decision> {
        if !self.entered_safe_zone && (self.min..=self.max).contains(&percent) {
            self.entered_safe_zone = true;
        }
        let command = match decide(percent, self.min, self.max) {
            Decision::Hold => None,
            wanted if self.commanded == Some(wanted) => None,
            wanted => {
                self.commanded = Some(wanted);
                Some(wanted)
            }
        };
        if self.entered_safe_zone
            && !self.validating
            && (percent <= self.min || percent >= self.max)
        {
            self.validating = true;
        }
        if self.validating {
            self.recorded.push(percent);
        }
        command
    }

    pub fn entered_safe_zone(&self) -> bool {
        self.entered_safe_zone
    }

    pub fn is_validating(&self) -> bool {
        self.validating
    }

    pub fn recorded(&self) -> &[u8] {
        &self.recorded
    }

    pub fn limits(&self) -> (u8, u8) {
        (
            self.min.saturating_sub(self.tolerance),
            self.max.saturating_add(self.tolerance),
        )
    }

    pub fn violations(&self) -> Vec<u8> {
        let (lower, upper) = self.limits();
        self.recorded
            .iter()
            .copied()
            .filter(|p| *p < lower || *p > upper)
            .collect()
    }
}

pub trait ChargeDriver: Send {
    fn charge(&mut self) -> RunResult<()>;
    fn discharge(&mut self) -> RunResult<()>;
    /// Stops any load and hands charging back to the EC. Never fails the caller.
    fn release(&mut self) -> bool;
}

/// Drives the EC through the vendor tool with the load/settle protocol the
/// EC needs: stop the load, wait, then switch mode (and the reverse).
pub struct EcChargeDriver {
    ec: EcTool,
    processes: ProcessManager,
    cancel: CancelFlag,
    events: Arc<dyn EventSink>,
    settle: Duration,
    load: Option<ToolLaunch>,
    kill_retries: u32,
}

impl EcChargeDriver {
    pub fn new(
        ec: EcTool,
        processes: ProcessManager,
        cancel: CancelFlag,
        events: Arc<dyn EventSink>,
        config: &BatteryConfig,
        kill_retries: u32,
    ) -> Self {
        Self {
            ec,
            processes,
            cancel,
            events,
            settle: Duration::from_secs(config.settle_delay_sec),
            load: config.discharge_load.clone(),
            kill_retries,
        }
    }

    fn stop_load(&self, processes: &ProcessManager) {
        if let Some(load) = &self.load {
            if let Err(err) = processes.ensure_terminated(&load.process_name, self.kill_retries) {
                self.events
                    .log(&format!("Could not stop {}: {}", load.process_name, err));
            }
        }
    }
}

impl ChargeDriver for EcChargeDriver {
    fn charge(&mut self) -> RunResult<()> {
        self.stop_load(&self.processes);
        self.events.log(&format!(
            "Waiting {}s before enabling charge",
            self.settle.as_secs()
        ));
        self.cancel.sleep(self.settle)?;
        self.ec.battery_auto()
    }

    fn discharge(&mut self) -> RunResult<()> {
        self.ec.battery_debug()?;
        self.cancel.sleep(DEBUG_TO_DISCHARGE)?;
        self.ec.battery_discharge()?;
        let load = match &self.load {
            Some(load) => load,
            None => return Ok(()),
        };
        self.events.log(&format!(
            "Discharge commanded, starting {} in {}s",
            load.process_name,
            self.settle.as_secs()
        ));
        self.cancel.sleep(self.settle)?;
        if is_running(&load.process_name) {
            tracing::debug!(tool = %load.process_name, "discharge load already running");
            return Ok(());
        }
        if let Err(err) = self.processes.run_detached(load) {
            if err.is_abort() {
                return Err(err);
            }
            self.events
                .log(&format!("Could not start {}: {}", load.process_name, err));
        }
        Ok(())
    }

    fn release(&mut self) -> bool {
        let quiet = self.processes.uncancellable();
        self.stop_load(&quiet);
        self.ec.restore_auto_modes()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatterySample {
    pub timestamp: DateTime<Utc>,
    pub percent: u8,
    pub current_amps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryTest {
    Hold,
    Cycle,
}

impl BatteryTest {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Hold => "battery_hold",
            Self::Cycle => "battery_cycle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatteryOutcome {
    pub test: BatteryTest,
    pub report: EvaluationReport,
    pub message: String,
    pub samples: Vec<BatterySample>,
}

impl BatteryOutcome {
    pub fn verdict(&self) -> Verdict {
        self.report.verdict()
    }

    /// `<label>_samples.csv` and `<label>_report.csv` under `dir`.
    pub fn write_artifacts(&self, dir: &Path, label: &str) -> RunResult<PathBuf> {
        let channels = vec!["percent".to_string(), "current_a".to_string()];
        let mut writer = SeriesWriter::create(&dir.join(format!("{}_samples.csv", label)), &channels)?;
        for s in &self.samples {
            writer.append(
                TelemetrySample::new(s.timestamp)
                    .with("percent", f64::from(s.percent))
                    .with("current_a", s.current_amps),
            )?;
        }
        writer.finish()?;
        let report_path = dir.join(format!("{}_report.csv", label));
        atomic_write_bytes(&report_path, render_report_csv(&self.report).as_bytes())?;
        Ok(report_path)
    }

    pub fn into_result(self) -> RunResult<BatteryOutcome> {
        if self.report.passed() {
            Ok(self)
        } else {
            Err(RunError::ThresholdViolation(
                self.report.failures().cloned().collect(),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Reached(u8),
    NoBattery,
}

pub struct BatteryController {
    config: BatteryConfig,
    probe: Box<dyn BatteryProbe>,
    driver: Box<dyn ChargeDriver>,
    cancel: CancelFlag,
    events: Arc<dyn EventSink>,
    read_retry: Duration,
    interval: Duration,
    stage_limit: Duration,
}

impl BatteryController {
    pub fn new(
        config: BatteryConfig,
        probe: Box<dyn BatteryProbe>,
        driver: Box<dyn ChargeDriver>,
        cancel: CancelFlag,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let interval = Duration::from_secs(config.check_interval_sec);
        let stage_limit = Duration::from_secs(config.stage_timeout_min * 60);
        Self {
            config,
            probe,
            driver,
            cancel,
            events,
            read_retry: READ_RETRY,
            interval,
            stage_limit,
        }
    }

    /// Shortens the waits; for tests and dry runs.
    pub fn with_timing(mut self, interval: Duration, read_retry: Duration) -> Self {
        self.interval = interval;
        self.read_retry = read_retry;
        self
    }

    pub fn with_stage_limit(mut self, limit: Duration) -> Self {
        self.stage_limit = limit;
        self
    }

    fn log(&self, message: &str) {
        self.events.log(message);
    }

    /// Read failures are logged and retried until `deadline`, after which
    /// `Ok(None)` is returned. A missing battery is fatal here.
    fn read_until(&mut self, deadline: Instant) -> RunResult<Option<BatteryReading>> {
        loop {
            self.cancel.checkpoint()?;
            match self.probe.read() {
                Ok(Some(reading)) => return Ok(Some(reading)),
                Ok(None) => {
                    return Err(RunError::BatteryUnavailable(
                        "no battery reported".to_string(),
                    ))
                }
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => self.log(&format!("Battery read failed, retrying: {}", err)),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.cancel.sleep(self.read_retry.min(remaining))?;
        }
    }

    fn apply(&mut self, decision: Decision, percent: u8) -> RunResult<()> {
        match decision {
            Decision::Charge => {
                self.log(&format!("Battery {}% <= min {}%, charging", percent, self.config.min_percent));
                self.driver.charge()
            }
            Decision::Discharge => {
                self.log(&format!("Battery {}% >= max {}%, discharging", percent, self.config.max_percent));
                self.driver.discharge()
            }
            Decision::Hold => Ok(()),
        }
    }

    /// Keeps the charge inside the band for `duration`, validating every
    /// reading after the first boundary touch. Releases the driver on exit.
    pub fn hold(&mut self, duration: Duration) -> RunResult<BatteryOutcome> {
        let result = self.hold_inner(duration);
        if !self.driver.release() {
            self.log("Restoring automatic charge mode failed");
        }
        result
    }

    fn hold_inner(&mut self, duration: Duration) -> RunResult<BatteryOutcome> {
        let mut band = Hysteresis::new(
            self.config.min_percent,
            self.config.max_percent,
            self.config.tolerance_margin,
        );
        self.log(&format!(
            "Battery hold: {}%..{}% for {} min",
            self.config.min_percent,
            self.config.max_percent,
            duration.as_secs() / 60
        ));
        let mut samples = Vec::new();
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            let reading = match self.read_until(deadline)? {
                Some(reading) => reading,
                None => {
                    self.log("Hold time elapsed while battery reads were failing");
                    break;
                }
            };
            let was_inside = band.entered_safe_zone();
            let was_validating = band.is_validating();
            let command = band.observe(reading.percent);
            if !was_inside && band.entered_safe_zone() {
                self.log(&format!("Battery {}% inside band", reading.percent));
            }
            if let Some(decision) = command {
                self.apply(decision, reading.percent)?;
            }
            if !was_validating && band.is_validating() {
                self.log(&format!(
                    "Boundary reached at {}%, validation started",
                    reading.percent
                ));
            }
            samples.push(BatterySample {
                timestamp: Utc::now(),
                percent: reading.percent,
                current_amps: reading.current_amps,
            });
            self.cancel.sleep(self.interval.min(deadline.saturating_duration_since(Instant::now())))?;
        }

        let (lower, upper) = band.limits();
        let recorded = band.recorded();
        let mut report = EvaluationReport::default();
        let lowest = recorded.iter().min().map(|p| f64::from(*p));
        let highest = recorded.iter().max().map(|p| f64::from(*p));
        report.push_item("battery_percent_min", lowest, f64::from(lower), f64::from(upper));
        report.push_item("battery_percent_max", highest, f64::from(lower), f64::from(upper));
        let violations = band.violations();
        let message = if recorded.is_empty() {
            "No data recorded.".to_string()
        } else if violations.is_empty() {
            format!("Tested {} points.", recorded.len())
        } else {
            format!("Found {} violations: {:?}", violations.len(), violations)
        };
        self.log(&message);
        Ok(BatteryOutcome {
            test: BatteryTest::Hold,
            report,
            message,
            samples,
        })
    }

    /// One full charge/discharge round trip. Charge current is averaged over
    /// the charge stage and checked against the target.
    pub fn cycle(&mut self) -> RunResult<BatteryOutcome> {
        let result = self.cycle_inner();
        if !self.driver.release() {
            self.log("Restoring automatic charge mode failed");
        }
        result
    }

    fn cycle_inner(&mut self) -> RunResult<BatteryOutcome> {
        let (min, max) = (self.config.min_percent, self.config.max_percent);
        let limit = self.stage_limit;
        let initial = match self.read_until(Instant::now() + limit)? {
            Some(reading) => reading.percent,
            None => return Err(stage_timeout("initial battery reading".to_string(), limit)),
        };
        self.log(&format!("Initial battery {}%", initial));
        let stages: Vec<(Decision, u8)> = if initial > max {
            vec![(Decision::Discharge, min), (Decision::Charge, max)]
        } else if initial < max {
            vec![(Decision::Charge, max), (Decision::Discharge, min)]
        } else {
            vec![(Decision::Discharge, min)]
        };

        let mut samples = Vec::new();
        let mut currents = Vec::new();
        for (direction, target) in stages {
            self.stage(direction, target, &mut samples, &mut currents)?;
        }

        let target = self.config.target_charge_current_amps;
        let average = average_charge_current(&currents);
        let mut report = EvaluationReport::default();
        report.push_item("avg_charge_current_a", Some(average), target, f64::INFINITY);
        let message = format!(
            "Avg current {:.2}A {} {}A over {} readings",
            average,
            if report.passed() { ">=" } else { "<" },
            target,
            currents.len()
        );
        self.log(&message);
        Ok(BatteryOutcome {
            test: BatteryTest::Cycle,
            report,
            message,
            samples,
        })
    }

    fn stage(
        &mut self,
        direction: Decision,
        target: u8,
        samples: &mut Vec<BatterySample>,
        currents: &mut Vec<f64>,
    ) -> RunResult<()> {
        self.log(&format!("Stage: {} to {}%", direction, target));
        let limit = self.stage_limit;
        let deadline = Instant::now() + limit;
        match direction {
            Decision::Charge => self.driver.charge()?,
            Decision::Discharge => self.driver.discharge()?,
            Decision::Hold => return Ok(()),
        }
        let operation = || format!("{} stage to {}%", direction, target);
        loop {
            if Instant::now() >= deadline {
                return Err(stage_timeout(operation(), limit));
            }
            let reading = match self.read_until(deadline)? {
                Some(reading) => reading,
                None => return Err(stage_timeout(operation(), limit)),
            };
            self.log(&format!(
                "Battery {}% | {:.3}A",
                reading.percent, reading.current_amps
            ));
            samples.push(BatterySample {
                timestamp: Utc::now(),
                percent: reading.percent,
                current_amps: reading.current_amps,
            });
            let reached = match direction {
                Decision::Charge => {
                    currents.push(reading.current_amps);
                    reading.percent >= target
                }
                _ => reading.percent <= target,
            };
            if reached {
                self.log(&format!("Target {}% reached", target));
                return Ok(());
            }
            self.cancel.sleep(self.interval)?;
        }
    }
}

fn stage_timeout(operation: String, limit: Duration) -> RunError {
    RunError::Timeout {
        operation,
        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        pid: None,
    }
}

/// Blocks until the charge reaches `threshold`. A machine without a battery
/// passes straight through.
pub fn wait_for_threshold(
    probe: &mut dyn BatteryProbe,
    threshold: u8,
    poll: Duration,
    timeout: Option<Duration>,
    cancel: &CancelFlag,
    events: &dyn EventSink,
) -> RunResult<GateOutcome> {
    let started = Instant::now();
    events.log(&format!("Waiting for battery >= {}%", threshold));
    loop {
        cancel.checkpoint()?;
        match probe.read() {
            Ok(None) => {
                events.log("No battery detected, skipping battery gate");
                return Ok(GateOutcome::NoBattery);
            }
            Ok(Some(reading)) => {
                let state = match reading.ac_online {
                    Some(true) => "Charging",
                    Some(false) => "Discharging",
                    None => "unknown power",
                };
                events.log(&format!(
                    "Battery {}% ({}) / target {}%",
                    reading.percent, state, threshold
                ));
                if reading.percent >= threshold {
                    events.log("Battery threshold reached");
                    return Ok(GateOutcome::Reached(reading.percent));
                }
                if reading.ac_online == Some(false) {
                    events.log("WARNING: AC adapter not plugged in");
                }
            }
            Err(err) if err.is_abort() => return Err(err),
            Err(err) => events.log(&format!("Battery read failed: {}", err)),
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                return Err(RunError::Timeout {
                    operation: format!("battery gate to {}%", threshold),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    pid: None,
                });
            }
        }
        cancel.sleep(poll)?;
    }
}
