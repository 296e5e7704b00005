//! Launching, waiting on and killing external tools.
//!
//! At most one foreground child is owned at a time ([`ProcessManager::run`]).
//! Companion tools started with [`ProcessManager::run_detached`] are reaped by
//! a background thread and afterwards referred to by process name only.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::config::{EcConfig, ToolLaunch};
use crate::context::{CancelFlag, EventSink, RunContext};
use crate::error::{RunError, RunResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const KILL_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Interpreted by `cmd /C` on Windows and `sh -c` elsewhere.
    Shell(String),
    Program { program: String, args: Vec<String> },
}

impl CommandLine {
    pub fn shell(command: &str) -> Self {
        Self::Shell(command.to_string())
    }

    pub fn program(program: &str, args: &[String]) -> Self {
        Self::Program {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }

    fn build(&self, workdir: Option<&Path>) -> Command {
        let mut cmd = match self {
            Self::Shell(line) => shell_command(line),
            Self::Program { program, args } => {
                let mut cmd = Command::new(resolve_program(program, workdir));
                cmd.args(args);
                cmd
            }
        };
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Program { program, args } if args.is_empty() => f.write_str(program),
            Self::Program { program, args } => write!(f, "{} {}", program, args.join(" ")),
        }
    }
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    use std::os::windows::process::CommandExt;
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").raw_arg(line);
    cmd
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

/// Relative paths with a directory part (`.\Prime95\prime95.exe`) are taken
/// relative to the plan's working directory; bare names go through `PATH`.
fn resolve_program(program: &str, workdir: Option<&Path>) -> PathBuf {
    let path = Path::new(program);
    match workdir {
        Some(dir) if path.is_relative() && path.components().count() > 1 => dir.join(path),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The child owns the console; nothing is captured.
    Inherit,
    /// Stdout lines are forwarded to the event sink as they arrive.
    Stream,
    /// Stdout lines are collected for the caller only.
    Collect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn once(timeout: Option<Duration>) -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
            timeout,
        }
    }

    pub fn from_ec(ec: &EcConfig) -> Self {
        Self {
            attempts: ec.retries.max(1),
            backoff: Duration::from_millis(ec.retry_backoff_ms),
            timeout: Some(Duration::from_secs(ec.command_timeout_sec)),
        }
    }
}

enum Stream {
    Out(String),
    Err(String),
}

#[derive(Clone)]
pub struct ProcessManager {
    events: Arc<dyn EventSink>,
    cancel: CancelFlag,
    workdir: Option<PathBuf>,
}

impl ProcessManager {
    pub fn new(events: Arc<dyn EventSink>, cancel: CancelFlag, workdir: Option<PathBuf>) -> Self {
        Self {
            events,
            cancel,
            workdir,
        }
    }

    pub fn from_context(ctx: &RunContext) -> Self {
        Self::new(
            ctx.events.clone(),
            ctx.cancel.clone(),
            ctx.config.run.workdir.clone(),
        )
    }

    /// Same sink and working directory but deaf to the stop flag, for
    /// teardown work that has to run after an abort.
    pub fn uncancellable(&self) -> Self {
        Self {
            cancel: CancelFlag::new(),
            ..self.clone()
        }
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn run_and_wait(
        &self,
        command: &str,
        timeout: Option<Duration>,
        capture_output: bool,
    ) -> RunResult<()> {
        let mode = if capture_output {
            OutputMode::Stream
        } else {
            OutputMode::Inherit
        };
        self.run(&CommandLine::shell(command), timeout, mode)
            .map(|_| ())
    }

    /// Runs one foreground child to completion and returns its stdout lines
    /// (empty for [`OutputMode::Inherit`]). Output is drained while waiting.
    pub fn run(
        &self,
        line: &CommandLine,
        timeout: Option<Duration>,
        mode: OutputMode,
    ) -> RunResult<Vec<String>> {
        self.cancel.checkpoint()?;
        let rendered = line.to_string();
        let mut cmd = line.build(self.workdir.as_deref());
        cmd.stdin(Stdio::null());
        if mode == OutputMode::Inherit {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        tracing::debug!(command = %rendered, ?timeout, "spawning");
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone(), Stream::Out);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx.clone(), Stream::Err);
        }
        drop(tx);

        let started = Instant::now();
        let mut lines = Vec::new();
        let status = loop {
            self.drain(&rx, &mut lines, mode, &rendered, Duration::ZERO);
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if self.cancel.is_cancelled() {
                kill_tree(&mut child);
                self.events
                    .log(&format!("Stop requested, killed `{}` (pid {})", rendered, pid));
                return Err(RunError::Aborted(format!(
                    "stop requested while running `{}`",
                    rendered
                )));
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    kill_tree(&mut child);
                    self.drain(&rx, &mut lines, mode, &rendered, DRAIN_GRACE);
                    self.events.log(&format!(
                        "Timed out after {}s, killed `{}` (pid {})",
                        limit.as_secs(),
                        rendered,
                        pid
                    ));
                    return Err(RunError::Timeout {
                        operation: rendered,
                        timeout_ms: saturating_ms(limit),
                        pid: Some(pid),
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        };
        self.drain(&rx, &mut lines, mode, &rendered, DRAIN_GRACE);

        if status.success() {
            Ok(lines)
        } else {
            let code = status.code().unwrap_or(-1);
            tracing::debug!(command = %rendered, code, "command failed");
            Err(RunError::CommandFailed {
                command: rendered,
                code,
            })
        }
    }

    /// With a zero `grace` only already-buffered lines are taken. Otherwise
    /// waits until both pipes close or nothing arrives for `grace`; a
    /// grandchild holding the pipe open must not stall the caller.
    fn drain(
        &self,
        rx: &Receiver<Stream>,
        lines: &mut Vec<String>,
        mode: OutputMode,
        rendered: &str,
        grace: Duration,
    ) {
        loop {
            let next = if grace.is_zero() {
                rx.try_recv().map_err(|_| RecvTimeoutError::Timeout)
            } else {
                rx.recv_timeout(grace)
            };
            match next {
                Ok(Stream::Out(line)) => {
                    if mode == OutputMode::Stream {
                        self.events.log(&line);
                    }
                    lines.push(line);
                }
                Ok(Stream::Err(line)) => {
                    tracing::warn!(target: "burnin::stderr", command = rendered, "{}", line);
                }
                Err(_) => return,
            }
        }
    }

    pub fn run_with_retry(
        &self,
        line: &CommandLine,
        policy: RetryPolicy,
        mode: OutputMode,
    ) -> RunResult<Vec<String>> {
        let attempts = policy.attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.run(line, policy.timeout, mode) {
                Ok(lines) => return Ok(lines),
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        command = %line,
                        attempt,
                        attempts,
                        error = %err,
                        "command attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        self.cancel.sleep(policy.backoff)?;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RunError::CommandFailed {
            command: line.to_string(),
            code: -1,
        }))
    }

    /// Teardown flavour: ignores the stop flag and only logs when retries run out.
    pub fn run_soft(&self, line: &CommandLine, policy: RetryPolicy) -> bool {
        match self
            .uncancellable()
            .run_with_retry(line, policy, OutputMode::Collect)
        {
            Ok(_) => true,
            Err(err) => {
                self.events
                    .log(&format!("Cleanup command `{}` failed: {}", line, err));
                false
            }
        }
    }

    /// Fire-and-forget launch of a companion tool. Returns its pid.
    pub fn run_detached(&self, tool: &ToolLaunch) -> RunResult<u32> {
        self.cancel.checkpoint()?;
        let workdir = self.workdir.as_deref();
        let mut cmd = Command::new(resolve_program(&tool.program, workdir));
        cmd.args(&tool.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match (&tool.cwd, workdir) {
            (Some(cwd), Some(base)) if cwd.is_relative() => {
                cmd.current_dir(base.join(cwd));
            }
            (Some(cwd), _) => {
                cmd.current_dir(cwd);
            }
            (None, Some(base)) => {
                cmd.current_dir(base);
            }
            (None, None) => {}
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
            cmd.creation_flags(CREATE_NEW_CONSOLE);
        }
        let mut child = cmd.spawn()?;
        let pid = child.id();
        thread::Builder::new()
            .name(format!("reap-{}", tool.process_name))
            .spawn(move || {
                let _ = child.wait();
            })?;
        self.events
            .log(&format!("Started {} (pid {})", tool.process_name, pid));
        Ok(pid)
    }

    /// Kills every process called `name`. `retries` is the number of kill
    /// passes and at least one is always made; a final pass only checks.
    /// Finding nothing to kill is success.
    pub fn ensure_terminated(&self, name: &str, retries: u32) -> RunResult<()> {
        let wanted = normalize_name(name);
        let passes = retries.max(1);
        let mut system = System::new();
        for attempt in 0..=passes {
            system.refresh_processes(ProcessesToUpdate::All, true);
            let mut survivors = Vec::new();
            for (pid, process) in system.processes() {
                if normalize_name(&process.name().to_string_lossy()) == wanted {
                    survivors.push(pid.as_u32());
                    if attempt < passes {
                        let _ = process.kill();
                    }
                }
            }
            if survivors.is_empty() {
                if attempt > 0 {
                    self.events.log(&format!("{} terminated", name));
                }
                return Ok(());
            }
            if attempt == passes {
                return Err(RunError::Timeout {
                    operation: format!("terminate {}", name),
                    timeout_ms: saturating_ms(KILL_SETTLE) * u64::from(passes),
                    pid: survivors.first().copied(),
                });
            }
            tracing::debug!(name, attempt, pids = ?survivors, "kill issued");
            thread::sleep(KILL_SETTLE);
        }
        Ok(())
    }
}

pub fn is_running(name: &str) -> bool {
    let wanted = normalize_name(name);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .values()
        .any(|p| normalize_name(&p.name().to_string_lossy()) == wanted)
}

pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

fn spawn_reader<R>(pipe: R, tx: Sender<Stream>, wrap: fn(String) -> Stream)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(wrap(line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Kills the child and everything it started, then reaps it.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid as NixPid;
        if let Ok(pgid) = i32::try_from(child.id()) {
            let _ = killpg(NixPid::from_raw(pgid), Signal::SIGKILL);
        }
    }
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &child.id().to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn saturating_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::{Event, RecordingSink};

    fn manager() -> (ProcessManager, Arc<RecordingSink>, CancelFlag) {
        let sink = Arc::new(RecordingSink::new());
        let cancel = CancelFlag::new();
        (
            ProcessManager::new(sink.clone(), cancel.clone(), None),
            sink,
            cancel,
        )
    }

    #[test]
    fn nonzero_exit_is_command_failed_with_code() {
        let (pm, _, _) = manager();
        let err = pm
            .run_and_wait("exit 1", Some(Duration::from_secs(10)), false)
            .expect_err("exit 1");
        match err {
            RunError::CommandFailed { code, command } => {
                assert_eq!(code, 1);
                assert_eq!(command, "exit 1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let (pm, _, _) = manager();
        let started = Instant::now();
        let err = pm
            .run_and_wait("sleep 5", Some(Duration::from_secs(1)), false)
            .expect_err("timeout");
        assert!(started.elapsed() < Duration::from_secs(4));
        let pid = match err {
            RunError::Timeout { pid, timeout_ms, .. } => {
                assert_eq!(timeout_ms, 1000);
                pid.expect("pid recorded")
            }
            other => panic!("unexpected {:?}", other),
        };
        let probe = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert!(probe.is_err(), "child {} still exists", pid);
    }

    #[test]
    fn streamed_lines_arrive_in_order() {
        let (pm, sink, _) = manager();
        let lines = pm
            .run(
                &CommandLine::shell("echo one; echo two; echo three >&2; echo four"),
                Some(Duration::from_secs(10)),
                OutputMode::Stream,
            )
            .expect("run");
        assert_eq!(lines, vec!["one", "two", "four"]);
        assert_eq!(
            sink.events(),
            vec![
                Event::Log("one".into()),
                Event::Log("two".into()),
                Event::Log("four".into())
            ]
        );
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let (pm, _, _) = manager();
        let lines = pm
            .run(
                &CommandLine::shell("i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done"),
                Some(Duration::from_secs(30)),
                OutputMode::Collect,
            )
            .expect("run");
        assert_eq!(lines.len(), 20000);
        assert_eq!(lines[19999], "line19999");
    }

    #[test]
    fn stop_request_kills_and_aborts() {
        let (pm, _, cancel) = manager();
        let remote = cancel.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });
        let started = Instant::now();
        let err = pm
            .run_and_wait("sleep 30", None, false)
            .expect_err("aborted");
        stopper.join().expect("join");
        assert!(err.is_abort());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn retries_stop_after_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("attempts");
        let (pm, _, _) = manager();
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(10),
            timeout: Some(Duration::from_secs(5)),
        };
        let line = CommandLine::shell(&format!("echo x >> '{}'; exit 3", marker.display()));
        let err = pm
            .run_with_retry(&line, policy, OutputMode::Collect)
            .expect_err("all attempts fail");
        assert_eq!(err.error_code(), "command_failed");
        let text = std::fs::read_to_string(&marker).expect("marker");
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn soft_run_ignores_stop_and_swallows_failure() {
        let (pm, sink, cancel) = manager();
        cancel.cancel();
        assert!(pm.run_soft(&CommandLine::shell("true"), RetryPolicy::once(None)));
        assert!(!pm.run_soft(&CommandLine::shell("exit 2"), RetryPolicy::once(None)));
        assert!(sink.logs().iter().any(|l| l.contains("Cleanup command")));
    }

    #[test]
    fn terminating_an_absent_process_succeeds() {
        let (pm, _, _) = manager();
        pm.ensure_terminated("burnin-no-such-tool.exe", 2)
            .expect("absent is fine");
        assert!(!is_running("burnin-no-such-tool"));
    }

    #[test]
    fn detached_tool_runs_independently() {
        let (pm, _, _) = manager();
        let tool = ToolLaunch {
            process_name: "sleep".into(),
            program: "sleep".into(),
            args: vec!["30".into()],
            cwd: None,
        };
        let pid = pm.run_detached(&tool).expect("launch");
        assert!(process_alive(pid));
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .expect("kill");
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!process_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn zero_retries_still_kills_once() {
        let Some(sleep) = ["/bin/sleep", "/usr/bin/sleep"]
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
        else {
            return;
        };
        // A private copy so the name matches nothing else on the machine.
        let dir = tempfile::tempdir().expect("tempdir");
        let program = dir.path().join("bsleep-once");
        std::fs::copy(sleep, &program).expect("copy sleep");
        let (pm, _, _) = manager();
        let tool = ToolLaunch {
            process_name: "bsleep-once".into(),
            program: program.to_string_lossy().into_owned(),
            args: vec!["30".into()],
            cwd: None,
        };
        let pid = pm.run_detached(&tool).expect("launch");
        assert!(process_alive(pid));

        pm.ensure_terminated("bsleep-once", 0).expect("terminated");
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!process_alive(pid));
    }

    #[test]
    fn program_paths_resolve_against_workdir() {
        let base = Path::new("/opt/runin");
        assert_eq!(
            resolve_program("./Prime95/prime95", Some(base)),
            base.join("./Prime95/prime95")
        );
        assert_eq!(resolve_program("sleep", Some(base)), PathBuf::from("sleep"));
        assert_eq!(normalize_name("Prime95.EXE"), "prime95");
    }
}
