use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burnin_analysis::SpecBound;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::checkpoint::BlockId;
use crate::error::{RunError, RunResult};

/// The resolved test plan. Read-only for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub run: RunSettings,
    pub blocks: Vec<Block>,
    /// Test mode -> acceptance bands.
    #[serde(default)]
    pub bounds: BTreeMap<String, Vec<SpecBound>>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub battery: Option<BatteryConfig>,
    #[serde(default)]
    pub ec: EcConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub state_dir: PathBuf,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default = "default_total_cycles")]
    pub total_cycles: u32,
    #[serde(default)]
    pub crash_policy: CrashPolicy,
    #[serde(default = "default_crash_retry_limit")]
    pub crash_retry_limit: u32,
    #[serde(default)]
    pub reboot: RebootConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPolicy {
    #[default]
    RetryInPlace,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebootConfig {
    #[serde(default = "default_reboot_command")]
    pub command: String,
    /// Registers the runner to start again after the reboot.
    #[serde(default)]
    pub autostart_command: Option<String>,
    #[serde(default = "default_reboot_timeout_sec")]
    pub timeout_sec: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            command: default_reboot_command(),
            autostart_command: None,
            timeout_sec: default_reboot_timeout_sec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pre: Vec<Hook>,
    #[serde(default)]
    pub post: Vec<Hook>,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Hook {
    Command {
        command: String,
        #[serde(default)]
        timeout_sec: Option<u64>,
    },
    Reboot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    /// The step is expected to end the process (sleep, reboot).
    #[serde(default)]
    pub interrupts: bool,
    /// After the command returns the machine is going down; stop here.
    #[serde(default)]
    pub awaits_restart: bool,
}

impl StepSpec {
    pub fn command(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Command {
                command: command.to_string(),
                capture_output: false,
                timeout_sec: None,
            },
            interrupts: false,
            awaits_restart: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Command {
        command: String,
        #[serde(default)]
        capture_output: bool,
        #[serde(default)]
        timeout_sec: Option<u64>,
    },
    Stress(StressSpec),
    BatteryGate {
        threshold_percent: u8,
        #[serde(default = "default_gate_poll_sec")]
        poll_sec: u64,
        #[serde(default)]
        timeout_min: Option<u64>,
    },
    BatteryHold {
        duration_min: u64,
    },
    BatteryCycle,
    /// Registers auto-start and restarts the machine; the run continues at
    /// the next step after boot.
    Reboot,
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Stress(_) => "stress",
            Self::BatteryGate { .. } => "battery_gate",
            Self::BatteryHold { .. } => "battery_hold",
            Self::BatteryCycle => "battery_cycle",
            Self::Reboot => "reboot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressSpec {
    /// Selects the bounds table entry.
    pub mode: String,
    pub duration_sec: u64,
    #[serde(default = "default_window_sec")]
    pub window_sec: u64,
    /// Runs to completion before the tools start (fan presets and the like).
    #[serde(default)]
    pub prepare: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolLaunch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolLaunch {
    pub process_name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_sample_interval_sec")]
    pub interval_sec: u64,
    #[serde(default)]
    pub source: Option<TelemetrySourceConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_sample_interval_sec(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetrySourceConfig {
    Ec {
        registers: Vec<EcRegister>,
    },
    MonitorLog {
        path: PathBuf,
        columns: Vec<MonitorColumn>,
        /// Companion monitor started alongside the stress tools.
        #[serde(default)]
        launch: Option<ToolLaunch>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcRegister {
    pub name: String,
    pub command: u8,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorColumn {
    pub name: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub min_percent: u8,
    pub max_percent: u8,
    pub check_interval_sec: u64,
    pub target_charge_current_amps: f64,
    #[serde(default = "default_tolerance")]
    pub tolerance_margin: u8,
    /// The EC rejects mode changes issued too soon after a load change.
    #[serde(default = "default_settle_sec")]
    pub settle_delay_sec: u64,
    #[serde(default = "default_stage_timeout_min")]
    pub stage_timeout_min: u64,
    #[serde(default)]
    pub probe: BatteryProbeConfig,
    #[serde(default)]
    pub discharge_load: Option<ToolLaunch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryProbeConfig {
    pub percent_command: String,
    #[serde(default)]
    pub current_command: Option<String>,
    /// Prints whether external power is connected (`True`/`False` or `1`/`0`).
    #[serde(default)]
    pub ac_command: Option<String>,
}

impl Default for BatteryProbeConfig {
    fn default() -> Self {
        Self {
            percent_command:
                "powershell -NoProfile -Command \"(Get-CimInstance Win32_Battery).EstimatedChargeRemaining\""
                    .to_string(),
            current_command: Some(
                "powershell -NoProfile -Command \"Get-WmiObject -Namespace root/wmi -Class BatteryStatus | Select-Object ChargeRate, Voltage | Format-List\""
                    .to_string(),
            ),
            ac_command: Some(
                "powershell -NoProfile -Command \"(Get-CimInstance -Namespace root/wmi -ClassName BatteryStatus).PowerOnline\""
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcConfig {
    #[serde(default = "default_ec_tool")]
    pub tool: String,
    #[serde(default = "default_ec_timeout_sec")]
    pub command_timeout_sec: u64,
    #[serde(default = "default_ec_retries")]
    pub retries: u32,
    #[serde(default = "default_ec_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_read_args")]
    pub read_args: Vec<String>,
    #[serde(default = "default_battery_auto")]
    pub battery_auto: Vec<String>,
    #[serde(default = "default_battery_debug")]
    pub battery_debug: Vec<String>,
    #[serde(default = "default_battery_discharge")]
    pub battery_discharge: Vec<String>,
    #[serde(default = "default_fan_auto")]
    pub fan_auto: Option<Vec<String>>,
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            tool: default_ec_tool(),
            command_timeout_sec: default_ec_timeout_sec(),
            retries: default_ec_retries(),
            retry_backoff_ms: default_ec_backoff_ms(),
            read_args: default_read_args(),
            battery_auto: default_battery_auto(),
            battery_debug: default_battery_debug(),
            battery_discharge: default_battery_discharge(),
            fan_auto: default_fan_auto(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeardownConfig {
    #[serde(default)]
    pub kill_processes: Vec<String>,
    #[serde(default = "default_kill_retries")]
    pub kill_retries: u32,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            kill_processes: Vec::new(),
            kill_retries: default_kill_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default)]
    pub result_dir: Option<PathBuf>,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_total_cycles() -> u32 {
    1
}
fn default_crash_retry_limit() -> u32 {
    2
}
fn default_reboot_command() -> String {
    if cfg!(windows) {
        "shutdown /r /t 0 /f".to_string()
    } else {
        "systemctl reboot".to_string()
    }
}
fn default_reboot_timeout_sec() -> u64 {
    60
}
fn default_gate_poll_sec() -> u64 {
    5
}
fn default_window_sec() -> u64 {
    120
}
fn default_sample_interval_sec() -> u64 {
    1
}
fn default_scale() -> f64 {
    1.0
}
fn default_tolerance() -> u8 {
    2
}
fn default_settle_sec() -> u64 {
    5
}
fn default_stage_timeout_min() -> u64 {
    240
}
fn default_ec_tool() -> String {
    "DiagECtool.exe".to_string()
}
fn default_ec_timeout_sec() -> u64 {
    15
}
fn default_ec_retries() -> u32 {
    5
}
fn default_ec_backoff_ms() -> u64 {
    1000
}
fn default_kill_retries() -> u32 {
    3
}
fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
fn default_read_args() -> Vec<String> {
    args(&["ec", "--read"])
}
fn default_battery_auto() -> Vec<String> {
    args(&["battery", "--mode", "auto"])
}
fn default_battery_debug() -> Vec<String> {
    args(&["battery", "--mode", "debug"])
}
fn default_battery_discharge() -> Vec<String> {
    args(&["battery", "--discharge"])
}
fn default_fan_auto() -> Option<Vec<String>> {
    Some(args(&["fan", "--mode", "auto"]))
}

impl PlanConfig {
    pub fn load(path: &Path) -> RunResult<Self> {
        if !path.exists() {
            return Err(RunError::ConfigMissing(format!(
                "plan file not found: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> RunResult<Self> {
        let plan: Self = serde_yaml::from_str(raw)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reports every problem at once rather than the first one found.
    pub fn validate(&self) -> RunResult<()> {
        let mut problems = Vec::new();
        if self.run.total_cycles == 0 {
            problems.push("/run/total_cycles must be >= 1".to_string());
        }
        if self.blocks.is_empty() {
            problems.push("/blocks must list at least one block".to_string());
        }
        for pair in self.blocks.windows(2) {
            if pair[0].id >= pair[1].id {
                problems.push(format!(
                    "/blocks must be in ascending id order without repeats ({} then {})",
                    pair[0].id, pair[1].id
                ));
            }
        }
        for (mode, bounds) in &self.bounds {
            for bound in bounds {
                if bound.low > bound.high {
                    problems.push(format!(
                        "/bounds/{}/{}: low {} exceeds high {}",
                        mode, bound.metric, bound.low, bound.high
                    ));
                }
            }
        }
        if self.telemetry.interval_sec == 0 {
            problems.push("/telemetry/interval_sec must be > 0".to_string());
        }
        if let Some(battery) = &self.battery {
            if battery.min_percent > battery.max_percent {
                problems.push(format!(
                    "/battery: min_percent {} exceeds max_percent {}",
                    battery.min_percent, battery.max_percent
                ));
            }
            if battery.max_percent > 100 {
                problems.push("/battery/max_percent must be <= 100".to_string());
            }
            if battery.check_interval_sec == 0 {
                problems.push("/battery/check_interval_sec must be > 0".to_string());
            }
        }
        for block in &self.blocks {
            if block.pre.iter().any(|h| matches!(h, Hook::Reboot)) {
                problems.push(format!(
                    "/blocks/{}/pre: reboot hooks are only allowed in post",
                    block.id
                ));
            }
            for (idx, step) in block.steps.iter().enumerate() {
                let at = format!("/blocks/{}/steps/{}", block.id, idx);
                self.validate_step(&at, step, &mut problems);
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RunError::InvalidConfig(problems))
        }
    }

    fn validate_step(&self, at: &str, step: &StepSpec, problems: &mut Vec<String>) {
        if step.name.trim().is_empty() {
            problems.push(format!("{}/name is empty", at));
        }
        if step.awaits_restart && !step.interrupts {
            problems.push(format!("{}: awaits_restart requires interrupts", at));
        }
        match &step.action {
            StepAction::Command { command, .. } => {
                if command.trim().is_empty() {
                    problems.push(format!("{}/command is empty", at));
                }
            }
            StepAction::Stress(spec) => {
                if !self.bounds.contains_key(&spec.mode) {
                    problems.push(format!("{}: no bounds for test mode `{}`", at, spec.mode));
                }
                if spec.duration_sec == 0 || spec.window_sec == 0 {
                    problems.push(format!("{}: duration_sec and window_sec must be > 0", at));
                }
                if self.telemetry.source.is_none() {
                    problems.push(format!("{}: stress step needs /telemetry/source", at));
                }
            }
            StepAction::BatteryGate {
                threshold_percent, ..
            } => {
                if *threshold_percent > 100 {
                    problems.push(format!("{}/threshold_percent must be <= 100", at));
                }
            }
            StepAction::BatteryHold { .. } | StepAction::BatteryCycle => {
                if self.battery.is_none() {
                    problems.push(format!("{}: battery step needs /battery", at));
                }
            }
            StepAction::Reboot => {}
        }
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn bounds_for(&self, mode: &str) -> RunResult<&[SpecBound]> {
        self.bounds
            .get(mode)
            .map(Vec::as_slice)
            .ok_or_else(|| RunError::ConfigMissing(format!("bounds for test mode `{}`", mode)))
    }

    pub fn battery(&self) -> RunResult<&BatteryConfig> {
        self.battery
            .as_ref()
            .ok_or_else(|| RunError::ConfigMissing("battery section".to_string()))
    }

    /// Stable across runs for an unchanged plan.
    pub fn digest(&self) -> RunResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }
}

pub const TEMPLATE: &str = r#"# Run-in plan. Relative commands run from run.workdir (defaults to this file's folder).
run:
  state_dir: 'C:\runin'
  total_cycles: 1
  crash_policy: retry_in_place
  crash_retry_limit: 2
  reboot:
    command: 'shutdown /r /t 0 /f'
    autostart_command: 'reg add HKCU\Software\Microsoft\Windows\CurrentVersion\RunOnce /v ODM_RunIn /t REG_SZ /d "C:\runin\burnin.exe run --config C:\runin\plan.yaml" /f'

blocks:
  - id: 1
    name: Thermal
    enabled: true
    post:
      - kind: reboot
    steps:
      - name: Battery gate
        kind: battery_gate
        threshold_percent: 80
        poll_sec: 5
      - name: Single stress
        kind: stress
        mode: single
        duration_sec: 1800
        window_sec: 120
        tools:
          - process_name: prime95.exe
            program: '.\Prime95\prime95.exe'
            args: ['-t', '-small', '-A16']
            cwd: '.\Prime95'
      - name: Fan max speed
        kind: command
        command: 'call .\RI\Thermal_Fan.bat'
      - name: Reboot before dual stress
        kind: reboot
      - name: Dual stress
        kind: stress
        mode: dual
        duration_sec: 1800
        window_sec: 120
        prepare: 'call .\RI\Thermal_Prepare.bat'
        tools:
          - process_name: prime95.exe
            program: '.\Prime95\prime95.exe'
            args: ['-t', '-small', '-A16']
            cwd: '.\Prime95'
          - process_name: FurMark.exe
            program: '.\FurMark\FurMark.exe'
            args: ['/nogui', '/width=1280', '/height=720', '/max_time=1800000']
  - id: 2
    name: Aging
    enabled: true
    steps:
      - { name: Battery info, kind: command, command: 'call .\RI\BatteryInfo.bat', capture_output: true }
      - { name: Battery, kind: command, command: 'call .\RI\Battery.bat' }
      - { name: Turn on/off, kind: command, command: 'call .\RI\TurnOnOff.bat' }
      - { name: Camera, kind: command, command: 'call .\RI\RICamera.bat' }
      - { name: Cold boot, kind: command, command: 'call .\RI\ColdBoot.bat', interrupts: true, awaits_restart: true }
      - { name: RTC wake, kind: command, command: 'call .\RI\RTC.bat', interrupts: true, awaits_restart: true }
      - { name: Memory, kind: command, command: 'call .\RI\Memory.bat' }
      - { name: Storage, kind: command, command: 'call .\RI\HDD_CMD.bat', capture_output: true }
      - { name: 3DMark, kind: command, command: 'call .\RI\3DMark.bat' }
      - { name: Fan speed, kind: command, command: 'call .\RI\SetFanSpeed.bat' }
      - { name: S3 sleep, kind: command, command: 'call .\RI\S3sleeptest.bat', interrupts: true }
      - { name: S4 hibernate, kind: command, command: 'call .\RI\S4sleeptest.bat', interrupts: true }
      - { name: Driver check, kind: command, command: 'call .\RI\CheckDriver.bat', capture_output: true }
      - { name: BT/WiFi, kind: command, command: 'call .\RI\BTWIFI.bat', capture_output: true }
  - id: 3
    name: Battery
    enabled: true
    steps:
      - name: Battery hold
        kind: battery_hold
        duration_min: 60

bounds:
  single:
    - { metric: cpu_temp, low: 40, high: 95 }
    - { metric: cpu_power, low: 15, high: 65 }
    - { metric: fan_rpm, low: 2500, high: 6500 }
  dual:
    - { metric: cpu_temp, low: 40, high: 98 }
    - { metric: cpu_power, low: 10, high: 55 }
    - { metric: fan_rpm, low: 3500, high: 7000 }

telemetry:
  interval_sec: 1
  source:
    kind: ec
    registers:
      - { name: cpu_temp, command: 128, payload: [0x60] }
      - { name: cpu_power, command: 128, payload: [0x62], scale: 0.5 }
      - { name: fan_rpm, command: 128, payload: [0x64], scale: 32.0 }

battery:
  min_percent: 40
  max_percent: 60
  check_interval_sec: 60
  target_charge_current_amps: 2.0
  tolerance_margin: 2
  settle_delay_sec: 5
  discharge_load:
    process_name: prime95.exe
    program: '.\Prime95\prime95.exe'
    args: ['-t', '-small', '-A16']
    cwd: '.\Prime95'

ec:
  tool: DiagECtool.exe
  command_timeout_sec: 15
  retries: 5

teardown:
  kill_processes: [prime95.exe, FurMark.exe]
  kill_retries: 3

artifacts:
  backup_dir: 'C:\Diag\Thermal'
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_and_validates() {
        let plan = PlanConfig::from_yaml_str(TEMPLATE).expect("template must be valid");
        assert_eq!(plan.blocks.len(), 3);
        let aging = plan.block(BlockId::Aging).expect("aging");
        assert_eq!(aging.steps.len(), 14);
        assert!(aging.steps[4].interrupts && aging.steps[4].awaits_restart);
        assert!(aging.steps[10].interrupts && !aging.steps[10].awaits_restart);
        assert_eq!(plan.bounds_for("dual").expect("dual").len(), 3);
        assert_eq!(plan.run.crash_policy, CrashPolicy::RetryInPlace);
        match &plan.blocks[0].steps[1].action {
            StepAction::Stress(spec) => assert_eq!(spec.tools[0].process_name, "prime95.exe"),
            other => panic!("expected stress, got {:?}", other),
        }
    }

    #[test]
    fn validation_reports_all_problems() {
        let raw = r#"
run:
  state_dir: /tmp/x
  total_cycles: 0
blocks:
  - id: 2
    name: Aging
    steps:
      - { name: '', kind: command, command: '' }
  - id: 1
    name: Thermal
    steps:
      - { name: s, kind: stress, mode: nope, duration_sec: 0 }
      - { name: b, kind: battery_cycle }
bounds:
  single:
    - { metric: m, low: 5, high: 1 }
battery:
  min_percent: 70
  max_percent: 30
  check_interval_sec: 10
  target_charge_current_amps: 1.0
"#;
        let err = PlanConfig::from_yaml_str(raw).expect_err("invalid");
        let msg = err.to_string();
        for needle in [
            "total_cycles",
            "ascending",
            "low 5 exceeds high 1",
            "min_percent 70 exceeds max_percent 30",
            "/blocks/2/steps/0/name is empty",
            "/blocks/2/steps/0/command is empty",
            "no bounds for test mode `nope`",
            "duration_sec and window_sec",
            "needs /telemetry/source",
        ] {
            assert!(msg.contains(needle), "missing `{}` in: {}", needle, msg);
        }
        assert!(!msg.contains("needs /battery"), "{}", msg);
    }

    #[test]
    fn missing_plan_file_is_config_missing() {
        let err = PlanConfig::load(Path::new("/definitely/not/here.yaml")).expect_err("missing");
        assert_eq!(err.error_code(), "config_missing");
    }

    #[test]
    fn bounds_lookup_names_missing_mode() {
        let plan = PlanConfig::from_yaml_str(TEMPLATE).expect("template");
        let err = plan.bounds_for("triple").expect_err("absent");
        assert!(err.to_string().contains("triple"));
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let plan = PlanConfig::from_yaml_str(TEMPLATE).expect("template");
        let again = PlanConfig::from_yaml_str(TEMPLATE).expect("template");
        assert_eq!(plan.digest().expect("d1"), again.digest().expect("d2"));
        let mut changed = plan.clone();
        changed.run.total_cycles = 3;
        assert_ne!(plan.digest().expect("d1"), changed.digest().expect("d3"));
    }
}
