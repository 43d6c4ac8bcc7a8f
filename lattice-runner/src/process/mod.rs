// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The local process supervisor.
//!
//! Wraps a child process: starts it with pipes or a pty, frames its output
//! per [`OutputMode`], emits stream and termination events on an
//! [`EventSource`], and terminates it with an escalating signal ladder.

mod unix;

use crate::{
    errors::HostError,
    events::{EventSource, ProcessEvent},
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{
    os::fd::OwnedFd,
    process::Stdio,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    io::AsyncWriteExt,
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::watch,
};
use tracing::debug;

/// Grace period between the steps of the termination ladder.
pub const ESCALATION_GRACE: Duration = Duration::from_secs(10);

/// How a supervised process's output is handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// One stream event per read buffer.
    Raw,
    /// Accumulate until `\n`; one event per complete line, newline included.
    #[default]
    Lines,
    /// Output is discarded. Used for uninteresting processes.
    Ignore,
}

impl OutputMode {
    /// The wire name of this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputMode::Raw => "raw",
            OutputMode::Lines => "lines",
            OutputMode::Ignore => "ignore",
        }
    }
}

/// Error returned while parsing an [`OutputMode`] from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized output mode: {0:?} (known modes: raw, lines, ignore)")]
pub struct OutputModeParseError(pub String);

impl FromStr for OutputMode {
    type Err = OutputModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(OutputMode::Raw),
            "lines" => Ok(OutputMode::Lines),
            "ignore" => Ok(OutputMode::Ignore),
            other => Err(OutputModeParseError(other.to_owned())),
        }
    }
}

/// A command line: an explicit argv or a string split by shell rules.
#[derive(Clone, Debug)]
pub enum CommandLine {
    /// An explicit argument vector; the first element is the executable.
    Argv(Vec<String>),
    /// A single string, shell-split before use.
    Shell(String),
}

impl CommandLine {
    /// Resolves to an argv, shell-splitting if necessary.
    pub fn into_argv(self) -> Result<Vec<String>, HostError> {
        let argv = match self {
            CommandLine::Argv(argv) => argv,
            CommandLine::Shell(line) => shell_words::split(&line)
                .map_err(|err| HostError::new("prepareProcess", err))?,
        };
        if argv.is_empty() {
            return Err(HostError::new("prepareProcess", "empty command line"));
        }
        Ok(argv)
    }
}

/// How a process run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited; signal deaths report code 0.
    Exited(i32),
    /// The process could not be run at all.
    Failed(String),
}

/// A clonable completion signal that fires once, when the process has
/// terminated and its `ProcessEnded` event has been emitted.
#[derive(Clone, Debug)]
pub struct Completion {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl Completion {
    /// Waits for termination.
    pub async fn wait(&mut self) -> ExitOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone().unwrap_or(ExitOutcome::Exited(0)),
            // The sender is gone without ever completing; treat as a
            // supervisor failure rather than hanging forever.
            Err(_) => ExitOutcome::Failed("process supervisor went away".to_owned()),
        }
    }

    /// Waits for termination and returns the exit code, mapping start
    /// failures to a host error.
    pub async fn wait_exit_code(&mut self) -> Result<i32, HostError> {
        match self.wait().await {
            ExitOutcome::Exited(code) => Ok(code),
            ExitOutcome::Failed(message) => Err(HostError::new("prepareProcess", message)),
        }
    }

    /// Whether the completion already fired.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// The sending half of a [`Completion`]. Only the first call wins.
#[derive(Clone, Debug)]
pub struct CompletionSender {
    tx: Arc<watch::Sender<Option<ExitOutcome>>>,
}

impl CompletionSender {
    /// Fires the completion. Later calls are ignored.
    pub fn complete(&self, outcome: ExitOutcome) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        });
    }
}

/// Creates a linked completion pair.
pub fn completion_pair() -> (CompletionSender, Completion) {
    let (tx, rx) = watch::channel(None);
    (CompletionSender { tx: Arc::new(tx) }, Completion { rx })
}

/// Everything needed to start a child: name, argv, working directory,
/// environment and output handling.
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    /// The name output events are attributed to, usually `node.procname`.
    pub name: String,
    argv: Vec<String>,
    cwd: Utf8PathBuf,
    env: IndexMap<String, String>,
    output: OutputMode,
}

impl ProcessSpec {
    /// Builds a spec. The working directory must exist.
    pub fn new(
        name: impl Into<String>,
        cmdline: CommandLine,
        cwd: Utf8PathBuf,
        output: OutputMode,
    ) -> Result<Self, HostError> {
        let name = name.into();
        let argv = cmdline.into_argv()?;
        if !cwd.is_dir() {
            return Err(HostError::new(
                "prepareProcess",
                format!("work directory `{cwd}` for process `{name}` does not exist"),
            ));
        }
        Ok(Self {
            name,
            argv,
            cwd,
            env: std::env::vars().collect(),
            output,
        })
    }

    /// Adds an environment variable, expanding `$NAME` and `${NAME}`
    /// references against the current map first. Because the expanded value
    /// is inserted before the next call, later additions see it.
    pub fn add_env(&mut self, key: impl Into<String>, value: &str) {
        let mut value = value.to_owned();
        for (name, existing) in &self.env {
            value = value
                .replace(&format!("${{{name}}}"), existing)
                .replace(&format!("${name}"), existing);
        }
        self.env.insert(key.into(), value);
    }

    /// The argv this spec will run.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// One environment value, after expansion.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

enum StdinSink {
    Pipe(tokio::process::ChildStdin),
    Pty(tokio::fs::File),
}

enum ProcState {
    Prepared {
        stdin_buf: Vec<u8>,
        close_requested: bool,
        completion_tx: CompletionSender,
    },
    Running {
        stdin: Option<StdinSink>,
        use_pty: bool,
    },
    Finished,
}

/// A supervised local child process.
///
/// Created in the prepared state; [`start`](LocalProcess::start) spawns the
/// child and the supervisor task. Stream and termination events are emitted
/// on [`events`](LocalProcess::events).
pub struct LocalProcess {
    spec: Mutex<ProcessSpec>,
    events: Arc<EventSource>,
    state: Arc<tokio::sync::Mutex<ProcState>>,
    completion: Completion,
    pid: Mutex<Option<i32>>,
}

impl LocalProcess {
    /// Creates a prepared process and its completion signal.
    pub fn new(spec: ProcessSpec) -> (Arc<Self>, Completion) {
        let (completion_tx, completion) = completion_pair();
        let process = Arc::new(Self {
            spec: Mutex::new(spec),
            events: Arc::new(EventSource::new()),
            state: Arc::new(tokio::sync::Mutex::new(ProcState::Prepared {
                stdin_buf: Vec::new(),
                close_requested: false,
                completion_tx,
            })),
            completion: completion.clone(),
            pid: Mutex::new(None),
        });
        (process, completion)
    }

    /// The event source this process emits on.
    pub fn events(&self) -> &Arc<EventSource> {
        &self.events
    }

    /// The process name.
    pub fn name(&self) -> String {
        self.spec.lock().expect("spec lock poisoned").name.clone()
    }

    /// The completion signal.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// The child's pid, once started.
    pub fn pid(&self) -> Option<i32> {
        *self.pid.lock().expect("pid lock poisoned")
    }

    /// Adds an environment variable. Only valid before start.
    pub async fn add_env(&self, key: &str, value: &str) -> Result<(), HostError> {
        let state = self.state.lock().await;
        if !matches!(*state, ProcState::Prepared { .. }) {
            return Err(HostError::new("proc_env", "process already started"));
        }
        self.spec
            .lock()
            .expect("spec lock poisoned")
            .add_env(key, value);
        Ok(())
    }

    /// Starts the child, with a pty if requested.
    pub async fn start(&self, use_pty: bool) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        let (stdin_buf, close_requested, completion_tx) = match &mut *state {
            ProcState::Prepared {
                stdin_buf,
                close_requested,
                completion_tx,
            } => (
                std::mem::take(stdin_buf),
                *close_requested,
                completion_tx.clone(),
            ),
            _ => return Err(HostError::new("startProcess", "process already started")),
        };

        let spec = self.spec.lock().expect("spec lock poisoned").clone();
        let executable = resolve_executable(&spec)?;
        debug!(name = %spec.name, %executable, "starting process");

        let mut command = Command::new(executable.as_std_path());
        command
            .args(&spec.argv[1..])
            .current_dir(spec.cwd.as_std_path())
            .env_clear()
            .envs(&spec.env)
            .kill_on_drop(false);

        let (child, streams, stdin) = if use_pty {
            let (master, slave) = unix::open_pty()
                .map_err(|err| HostError::new("startProcess", err))?;
            let stdin_slave = clone_fd(&slave)?;
            let stdout_slave = clone_fd(&slave)?;
            command
                .stdin(Stdio::from(stdin_slave))
                .stdout(Stdio::from(stdout_slave))
                .stderr(Stdio::from(slave));
            let child = command
                .spawn()
                .map_err(|err| HostError::new("startProcess", err))?;
            let writer_fd = clone_fd(&master)?;
            let reader = tokio::fs::File::from_std(std::fs::File::from(master));
            let writer = tokio::fs::File::from_std(std::fs::File::from(writer_fd));
            (
                child,
                ChildStreams::Pty { master: reader },
                StdinSink::Pty(writer),
            )
        } else {
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let mut child = command
                .spawn()
                .map_err(|err| HostError::new("startProcess", err))?;
            let stdout = child.stdout.take().expect("stdout was piped");
            let stderr = child.stderr.take().expect("stderr was piped");
            let stdin = child.stdin.take().expect("stdin was piped");
            (
                child,
                ChildStreams::Pipes { stdout, stderr },
                StdinSink::Pipe(stdin),
            )
        };

        let pid = child.id().map(|pid| pid as i32);
        *self.pid.lock().expect("pid lock poisoned") = pid;

        let mut stdin = Some(stdin);
        if !stdin_buf.is_empty() {
            if let Some(sink) = &mut stdin {
                write_stdin(sink, &stdin_buf).await;
            }
        }
        if close_requested {
            close_stdin_sink(&mut stdin, use_pty).await;
        }

        *state = ProcState::Running { stdin, use_pty };
        drop(state);

        tokio::spawn(supervise(
            child,
            streams,
            spec.output,
            Arc::clone(&self.events),
            completion_tx,
            Arc::clone(&self.state),
        ));
        Ok(())
    }

    /// Writes to the child's standard input. Before start the data is
    /// buffered; after termination it is silently dropped.
    pub async fn write(&self, data: &[u8]) {
        let mut state = self.state.lock().await;
        match &mut *state {
            ProcState::Prepared { stdin_buf, .. } => stdin_buf.extend_from_slice(data),
            ProcState::Running {
                stdin: Some(sink), ..
            } => write_stdin(sink, data).await,
            _ => {}
        }
    }

    /// Closes the child's standard input. Before start the close is
    /// deferred until just after the spawn.
    pub async fn close_stdin(&self) {
        let mut state = self.state.lock().await;
        match &mut *state {
            ProcState::Prepared {
                close_requested, ..
            } => *close_requested = true,
            ProcState::Running { stdin, use_pty } => {
                let use_pty = *use_pty;
                close_stdin_sink(stdin, use_pty).await;
            }
            ProcState::Finished => {}
        }
    }

    /// Kills the child outright with SIGKILL. Used for last-resort cleanup;
    /// orderly termination goes through [`stop`](LocalProcess::stop).
    pub fn kill(&self) {
        if let Some(pid) = self.pid() {
            unix::send_signal(pid, unix::SIGKILL);
        }
    }

    /// Begins orderly termination: SIGINT now, SIGTERM after
    /// [`ESCALATION_GRACE`], SIGKILL after another. Returns the completion
    /// signal; a race with natural exit is tolerated.
    pub fn stop(&self) -> Completion {
        let completion = self.completion.clone();
        if let Some(pid) = self.pid() {
            if !completion.is_done() {
                tokio::spawn(escalate(pid, self.completion.clone()));
            }
        }
        completion
    }
}

fn clone_fd(fd: &OwnedFd) -> Result<OwnedFd, HostError> {
    fd.try_clone()
        .map_err(|err| HostError::new("startProcess", err))
}

async fn write_stdin(sink: &mut StdinSink, data: &[u8]) {
    // Write errors mean the child already went away; the contract is to
    // drop such writes silently.
    let _ = match sink {
        StdinSink::Pipe(stdin) => stdin.write_all(data).await,
        StdinSink::Pty(master) => master.write_all(data).await,
    };
}

async fn close_stdin_sink(stdin: &mut Option<StdinSink>, use_pty: bool) {
    if use_pty {
        if let Some(sink) = stdin {
            // EOT on the pty line; the slave side sees end-of-input.
            write_stdin(sink, b"\x04").await;
        }
    }
    *stdin = None;
}

enum ChildStreams {
    Pipes {
        stdout: ChildStdout,
        stderr: ChildStderr,
    },
    Pty {
        master: tokio::fs::File,
    },
}

async fn supervise(
    mut child: Child,
    streams: ChildStreams,
    mode: OutputMode,
    events: Arc<EventSource>,
    completion_tx: CompletionSender,
    state: Arc<tokio::sync::Mutex<ProcState>>,
) {
    match streams {
        ChildStreams::Pipes {
            mut stdout,
            mut stderr,
        } => {
            let mut out_buf = vec![0u8; 8192];
            let mut err_buf = vec![0u8; 8192];
            let mut out_done = false;
            let mut err_done = false;
            let mut out_framer = LineFramer::default();
            let mut err_framer = LineFramer::default();
            loop {
                tokio::select! {
                    read = stdout.read(&mut out_buf), if !out_done => {
                        match read {
                            Ok(0) | Err(_) => out_done = true,
                            Ok(n) => emit_chunk(&events, mode, false, &mut out_framer, &out_buf[..n]),
                        }
                    }
                    read = stderr.read(&mut err_buf), if !err_done => {
                        match read {
                            Ok(0) | Err(_) => err_done = true,
                            Ok(n) => emit_chunk(&events, mode, true, &mut err_framer, &err_buf[..n]),
                        }
                    }
                    else => break,
                }
            }
        }
        ChildStreams::Pty { mut master } => {
            let mut buf = vec![0u8; 8192];
            let mut framer = LineFramer::default();
            loop {
                match master.read(&mut buf).await {
                    // A read error on a pty master means the slave side
                    // closed; that is the pty's end-of-file.
                    Ok(0) | Err(_) => break,
                    Ok(n) => emit_chunk(&events, mode, false, &mut framer, &buf[..n]),
                }
            }
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(0),
        Err(_) => 0,
    };

    events.emit(ProcessEvent::Ended { exit_code });
    completion_tx.complete(ExitOutcome::Exited(exit_code));
    *state.lock().await = ProcState::Finished;
}

fn emit_chunk(
    events: &EventSource,
    mode: OutputMode,
    is_err: bool,
    framer: &mut LineFramer,
    chunk: &[u8],
) {
    let make = |data: String| {
        if is_err {
            ProcessEvent::Err { data }
        } else {
            ProcessEvent::Out { data }
        }
    };
    match mode {
        OutputMode::Ignore => {}
        OutputMode::Raw => {
            events.emit(make(String::from_utf8_lossy(chunk).into_owned()));
        }
        OutputMode::Lines => {
            for line in framer.push(chunk) {
                events.emit(make(line));
            }
        }
    }
}

async fn escalate(pid: i32, mut completion: Completion) {
    for signal in [unix::SIGINT, unix::SIGTERM, unix::SIGKILL] {
        unix::send_signal(pid, signal);
        tokio::select! {
            _ = completion.wait() => return,
            () = tokio::time::sleep(ESCALATION_GRACE) => {}
        }
    }
}

/// Accumulates bytes and yields complete lines, newline included.
/// A trailing fragment without a newline is never yielded.
#[derive(Default)]
pub(crate) struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=idx).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Resolves the executable: absolute paths as-is, `.`-prefixed paths
/// relative to the working directory, anything else through `PATH`.
fn resolve_executable(spec: &ProcessSpec) -> Result<Utf8PathBuf, HostError> {
    let exec_name = &spec.argv[0];
    let not_found = || {
        HostError::new(
            "startProcess",
            format!("no such executable file: {exec_name}"),
        )
    };

    if exec_name.starts_with('/') {
        let path = Utf8PathBuf::from(exec_name);
        if path.exists() {
            return Ok(path);
        }
        return Err(not_found());
    }
    if exec_name.starts_with('.') {
        let path = spec.cwd.join(exec_name);
        if path.exists() {
            return Ok(path);
        }
        return Err(not_found());
    }
    if let Some(path_var) = spec.env("PATH") {
        for dir in path_var.split(':') {
            let candidate = Utf8Path::new(dir).join(exec_name.as_str());
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(not_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventClass, EventMatcher};
    use camino::Utf8PathBuf;
    use tokio::sync::mpsc::unbounded_channel;

    fn tmp_cwd() -> Utf8PathBuf {
        Utf8PathBuf::from("/tmp")
    }

    fn spec(cmdline: &str, output: OutputMode) -> ProcessSpec {
        ProcessSpec::new(
            "test.proc",
            CommandLine::Shell(cmdline.to_owned()),
            tmp_cwd(),
            output,
        )
        .expect("spec builds")
    }

    #[test]
    fn line_framer_frames_lines() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.push(b"par"), Vec::<String>::new());
        assert_eq!(framer.push(b"tial\nnext"), vec!["partial\n".to_owned()]);
        assert_eq!(
            framer.push(b"\nlast\n"),
            vec!["next\n".to_owned(), "last\n".to_owned()]
        );
    }

    #[test]
    fn env_expansion_sees_earlier_additions() {
        let mut spec = spec("true", OutputMode::Lines);
        spec.add_env("LATTICE_A", "alpha");
        spec.add_env("LATTICE_B", "${LATTICE_A}/beta");
        spec.add_env("LATTICE_C", "$LATTICE_B/gamma");
        assert_eq!(spec.env("LATTICE_B"), Some("alpha/beta"));
        assert_eq!(spec.env("LATTICE_C"), Some("alpha/beta/gamma"));
    }

    #[test]
    fn missing_cwd_is_rejected() {
        let err = ProcessSpec::new(
            "p",
            CommandLine::Argv(vec!["true".to_owned()]),
            Utf8PathBuf::from("/definitely/not/here"),
            OutputMode::Lines,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unknown_executable_is_rejected() {
        let spec = spec("lattice-no-such-binary-here", OutputMode::Lines);
        assert!(resolve_executable(&spec).is_err());
    }

    #[tokio::test]
    async fn echo_emits_lines_and_ends() {
        let (process, mut completion) = LocalProcess::new(spec("echo hello", OutputMode::Lines));
        let (tx, mut rx) = unbounded_channel();
        process
            .events()
            .add_hook(EventMatcher::new(EventClass::StreamOut), tx);

        process.start(false).await.expect("starts");
        assert_eq!(completion.wait().await, ExitOutcome::Exited(0));
        assert_eq!(
            rx.recv().await,
            Some(ProcessEvent::Out {
                data: "hello\n".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn ended_event_carries_exit_code() {
        let (process, mut completion) =
            LocalProcess::new(spec("sh -c 'exit 3'", OutputMode::Ignore));
        let (tx, mut rx) = unbounded_channel();
        process
            .events()
            .add_hook(EventMatcher::new(EventClass::ProcessEnded), tx);

        process.start(false).await.expect("starts");
        assert_eq!(completion.wait().await, ExitOutcome::Exited(3));
        assert_eq!(rx.recv().await, Some(ProcessEvent::Ended { exit_code: 3 }));
    }

    #[tokio::test]
    async fn stdin_written_before_start_is_delivered() {
        let (process, mut completion) = LocalProcess::new(spec("cat", OutputMode::Lines));
        let (tx, mut rx) = unbounded_channel();
        process
            .events()
            .add_hook(EventMatcher::new(EventClass::StreamOut), tx);

        process.write(b"buffered line\n").await;
        process.close_stdin().await;
        process.start(false).await.expect("starts");

        assert_eq!(completion.wait().await, ExitOutcome::Exited(0));
        assert_eq!(
            rx.recv().await,
            Some(ProcessEvent::Out {
                data: "buffered line\n".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_child() {
        let (process, _completion) = LocalProcess::new(spec("sleep 600", OutputMode::Ignore));
        process.start(false).await.expect("starts");
        let mut completion = process.stop();
        // SIGINT arrives promptly; no escalation needed for sleep.
        let outcome = completion.wait().await;
        assert!(matches!(outcome, ExitOutcome::Exited(_)));
    }

    #[tokio::test]
    async fn writes_after_termination_are_dropped() {
        let (process, mut completion) = LocalProcess::new(spec("true", OutputMode::Ignore));
        process.start(false).await.expect("starts");
        completion.wait().await;
        // Must not error or panic.
        process.write(b"too late\n").await;
    }
}
