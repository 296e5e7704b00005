//! Embedded-controller access.
//!
//! Callers only see [`EcChannel::transact`]. One transaction is in flight at a
//! time: [`SharedEc`] serialises every caller behind a mutex, and each
//! implementation does its own bounded ready/done polling internally.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EcConfig;
use crate::error::{RunError, RunResult};
use crate::process::{CommandLine, OutputMode, ProcessManager, RetryPolicy};

pub const EC_READ: u8 = 0x80;
pub const EC_WRITE: u8 = 0x81;

pub trait EcChannel: Send {
    fn transact(&mut self, command: u8, payload: &[u8]) -> RunResult<Vec<u8>>;
}

#[derive(Clone)]
pub struct SharedEc(Arc<Mutex<Box<dyn EcChannel>>>);

impl SharedEc {
    pub fn new(channel: Box<dyn EcChannel>) -> Self {
        Self(Arc::new(Mutex::new(channel)))
    }

    pub fn transact(&self, command: u8, payload: &[u8]) -> RunResult<Vec<u8>> {
        let mut channel = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channel.transact(command, payload)
    }
}

/// Raw byte port access. Kept abstract; the platform driver lives outside
/// this crate.
pub trait PortIo: Send {
    fn inb(&mut self, port: u16) -> u8;
    fn outb(&mut self, port: u16, value: u8);
}

const STATUS_OBF: u8 = 0x01;
const STATUS_IBF: u8 = 0x02;

#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_micros(50),
            timeout: Duration::from_millis(300),
        }
    }
}

/// The ACPI-style command/status + data port handshake.
pub struct PolledEcChannel<P> {
    io: P,
    command_port: u16,
    data_port: u16,
    timing: PollTiming,
}

impl<P: PortIo> PolledEcChannel<P> {
    pub fn new(io: P) -> Self {
        Self {
            io,
            command_port: 0x66,
            data_port: 0x62,
            timing: PollTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: PollTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn into_inner(self) -> P {
        self.io
    }

    fn wait_status(&mut self, what: &str, ready: impl Fn(u8) -> bool) -> RunResult<()> {
        let deadline = Instant::now() + self.timing.timeout;
        loop {
            if ready(self.io.inb(self.command_port)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RunError::Ec(format!(
                    "{} not signalled within {}ms",
                    what,
                    self.timing.timeout.as_millis()
                )));
            }
            thread::sleep(self.timing.interval);
        }
    }

    fn write_command(&mut self, command: u8) -> RunResult<()> {
        self.wait_status("input buffer empty", |s| s & STATUS_IBF == 0)?;
        self.io.outb(self.command_port, command);
        Ok(())
    }

    fn write_data(&mut self, value: u8) -> RunResult<()> {
        self.wait_status("input buffer empty", |s| s & STATUS_IBF == 0)?;
        self.io.outb(self.data_port, value);
        Ok(())
    }

    fn read_data(&mut self) -> RunResult<u8> {
        self.wait_status("output buffer full", |s| s & STATUS_OBF != 0)?;
        Ok(self.io.inb(self.data_port))
    }
}

fn response_len(command: u8) -> usize {
    match command {
        EC_READ => 1,
        _ => 0,
    }
}

impl<P: PortIo> EcChannel for PolledEcChannel<P> {
    fn transact(&mut self, command: u8, payload: &[u8]) -> RunResult<Vec<u8>> {
        self.write_command(command)?;
        for byte in payload {
            self.write_data(*byte)?;
        }
        let mut response = Vec::with_capacity(response_len(command));
        for _ in 0..response_len(command) {
            response.push(self.read_data()?);
        }
        Ok(response)
    }
}

/// Transactions through the vendor diagnostic tool: the command byte and
/// payload go on the command line, the response comes back as hex on the last
/// line of stdout.
pub struct ToolEcChannel {
    processes: ProcessManager,
    config: EcConfig,
}

impl ToolEcChannel {
    pub fn new(processes: ProcessManager, config: EcConfig) -> Self {
        Self { processes, config }
    }
}

impl EcChannel for ToolEcChannel {
    fn transact(&mut self, command: u8, payload: &[u8]) -> RunResult<Vec<u8>> {
        let mut args = self.config.read_args.clone();
        args.push(format!("0x{:02X}", command));
        args.extend(payload.iter().map(|b| format!("0x{:02X}", b)));
        let line = CommandLine::program(&self.config.tool, &args);
        let out = self
            .processes
            .run_with_retry(&line, RetryPolicy::from_ec(&self.config), OutputMode::Collect)?;
        let last = out
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| RunError::Ec(format!("`{}` printed nothing", line)))?;
        parse_hex_bytes(last)
    }
}

pub fn parse_hex_bytes(line: &str) -> RunResult<Vec<u8>> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(|token| {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            u8::from_str_radix(digits, 16)
                .map_err(|_| RunError::Ec(format!("unexpected EC response token `{}`", token)))
        })
        .collect()
}

/// Battery and fan mode commands through the vendor tool.
#[derive(Clone)]
pub struct EcTool {
    processes: ProcessManager,
    config: EcConfig,
}

impl EcTool {
    pub fn new(processes: ProcessManager, config: EcConfig) -> Self {
        Self { processes, config }
    }

    fn line(&self, args: &[String]) -> CommandLine {
        CommandLine::program(&self.config.tool, args)
    }

    fn issue(&self, what: &str, args: &[String]) -> RunResult<()> {
        self.processes
            .run_with_retry(
                &self.line(args),
                RetryPolicy::from_ec(&self.config),
                OutputMode::Collect,
            )
            .map_err(|err| match err {
                RunError::Aborted(_) => err,
                other => RunError::Ec(format!("{} failed: {}", what, other)),
            })?;
        tracing::info!(command = what, "ec mode set");
        Ok(())
    }

    pub fn battery_auto(&self) -> RunResult<()> {
        self.issue("battery auto mode", &self.config.battery_auto)
    }

    pub fn battery_debug(&self) -> RunResult<()> {
        self.issue("battery debug mode", &self.config.battery_debug)
    }

    pub fn battery_discharge(&self) -> RunResult<()> {
        self.issue("battery discharge", &self.config.battery_discharge)
    }

    /// Best effort; returns whether every command went through.
    pub fn restore_auto_modes(&self) -> bool {
        let policy = RetryPolicy::from_ec(&self.config);
        let mut ok = self
            .processes
            .run_soft(&self.line(&self.config.battery_auto), policy);
        if let Some(fan) = &self.config.fan_auto {
            ok &= self.processes.run_soft(&self.line(fan), policy);
        }
        ok
    }
}
