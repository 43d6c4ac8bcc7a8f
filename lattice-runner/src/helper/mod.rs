// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The helper-side implementation of the remote protocol.
//!
//! The helper reads requests line by line on standard input, executes file
//! and process operations, and writes replies on standard output. Every
//! process output unit and lifecycle event is appended to `event.log` in
//! the working directory as `timestamp:jobid:channel:repr(data)`. The
//! `lattice-helper` binary wraps [`run_stdio`]; tests drive [`serve`] over
//! in-process pipes.

mod monitor;

use crate::{
    host::fsops,
    protocol::{Reply, Request, Value, wire::JobId},
};
use monitor::ProcessMonitor;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc::{UnboundedSender, unbounded_channel},
};
use tracing::warn;

/// Options for a helper instance.
#[derive(Clone, Debug)]
pub struct HelperOptions {
    /// Whether `set_work_dir` chdirs the whole process. The standalone
    /// binary does; embedded instances (tests) must not, and instead
    /// resolve relative paths against the working directory explicitly.
    pub chdir: bool,
}

impl Default for HelperOptions {
    fn default() -> Self {
        Self { chdir: true }
    }
}

/// Runs the helper over standard input and output. This is the entire body
/// of the `lattice-helper` binary.
pub async fn run_stdio() -> io::Result<()> {
    serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        HelperOptions::default(),
    )
    .await
}

/// Runs the helper over arbitrary byte streams.
pub async fn serve<R, W>(input: R, output: W, options: HelperOptions) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, mut reply_rx) = unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = reply_rx.recv().await {
            if output.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if output.write_all(b"\n").await.is_err() {
                break;
            }
            if output.flush().await.is_err() {
                break;
            }
        }
    });

    let mut helper = Helper::new(reply_tx, options);
    helper.send_hello();

    let mut lines = BufReader::new(input).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if helper.dispatch(&line).await.is_break() {
            break;
        }
    }

    helper.cleanup();
    drop(helper);
    // Give in-flight monitor tasks a moment to drain their replies.
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
    Ok(())
}

/// Shared, mutex-guarded handle to the helper's `event.log`.
pub(crate) struct EventLog {
    file: Mutex<Option<std::fs::File>>,
}

impl EventLog {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            file: Mutex::new(None),
        })
    }

    fn open(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        *self.file.lock().expect("event log lock poisoned") = Some(file);
        Ok(())
    }

    pub(crate) fn append(&self, job: JobId, channel: &str, data: &str) {
        use std::io::Write;
        let timestamp = chrono::Utc::now().timestamp();
        let mut guard = self.file.lock().expect("event log lock poisoned");
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "{timestamp}:{job}:{channel}:{}\n",
                Value::str(data.to_owned())
            );
            if file.write_all(line.as_bytes()).is_err() {
                warn!(%job, "unable to write to event.log");
            }
        }
    }

    fn close(&self) {
        *self.file.lock().expect("event log lock poisoned") = None;
    }
}

struct Helper {
    reply_tx: UnboundedSender<String>,
    options: HelperOptions,
    work_dir: Option<PathBuf>,
    jobs: HashMap<JobId, Arc<ProcessMonitor>>,
    event_log: Arc<EventLog>,
}

impl Helper {
    fn new(reply_tx: UnboundedSender<String>, options: HelperOptions) -> Self {
        Self {
            reply_tx,
            options,
            work_dir: None,
            jobs: HashMap::new(),
            event_log: EventLog::new(),
        }
    }

    fn reply(&self, reply: Reply) {
        let _ = self.reply_tx.send(reply.render());
    }

    fn send_hello(&self) {
        let info = system_info();
        self.reply(Reply::Hello {
            hostname: info.hostname,
            system: info.system,
            release: info.release,
            version: info.version,
            machine: info.machine,
            separator: std::path::MAIN_SEPARATOR_STR.to_owned(),
        });
    }

    fn done(&self, job: JobId) {
        self.reply(Reply::Done { job, retcode: None });
    }

    fn failed(&self, job: JobId, message: impl ToString) {
        self.reply(Reply::Failed {
            job,
            message: Some(message.to_string()),
        });
    }

    fn cmd_error(&self, message: impl Into<String>) {
        self.reply(Reply::CmdError {
            message: message.into(),
        });
    }

    /// Resolves a path against the working directory. With `chdir` enabled
    /// the OS already does this; the explicit form keeps embedded instances
    /// honest.
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            return path.to_owned();
        }
        match &self.work_dir {
            Some(work_dir) => work_dir.join(path),
            None => path.to_owned(),
        }
    }

    async fn dispatch(&mut self, line: &str) -> std::ops::ControlFlow<()> {
        let (request, parse_errors) = match Request::parse(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.cmd_error(err.to_string());
                return std::ops::ControlFlow::Continue(());
            }
        };
        for err in parse_errors {
            self.cmd_error(format!("parser error: {err}"));
        }

        match request {
            Request::SetWorkDir { job, path } => self.set_work_dir(job, &path),
            Request::List { job, path } => self.list(job, &path).await,
            Request::Remove { job, path } => {
                let path = self.resolve(&path);
                self.fs_op(job, move || fsops::recursive_remove(&path)).await;
            }
            Request::Copy {
                job,
                src,
                dest,
                ignore,
            } => {
                let src = self.resolve(&src);
                let dest = self.resolve(&dest);
                self.fs_op(job, move || {
                    fsops::recursive_copy(&src, &dest, ignore.as_deref())
                })
                .await;
            }
            Request::Append { job, path, data } => {
                let path = self.resolve(&path);
                self.fs_op(job, move || fsops::append_to_file(&path, &data))
                    .await;
            }
            Request::MakeDirs { job, path } => {
                let path = self.resolve(&path);
                self.fs_op(job, move || fsops::make_dirs(&path)).await;
            }
            Request::Utime {
                job,
                path,
                atime,
                mtime,
            } => {
                let path = self.resolve(&path);
                self.fs_op(job, move || fsops::set_file_times(&path, atime, mtime))
                    .await;
            }
            Request::ProcPrepare {
                job,
                output_mode,
                cmdline,
            } => {
                let monitor = ProcessMonitor::new(
                    job,
                    cmdline,
                    output_mode,
                    self.reply_tx.clone(),
                    Arc::clone(&self.event_log),
                );
                self.jobs.insert(job, monitor);
                // No reply until the process terminates.
            }
            Request::ProcCwd { job, cwd } => {
                if let Some(monitor) = self.job(job) {
                    monitor.set_cwd(cwd);
                }
            }
            Request::ProcEnv { job, name, value } => {
                if let Some(monitor) = self.job(job) {
                    monitor.add_env(name, value);
                }
            }
            Request::ProcStart {
                job,
                use_pty,
                use_shell,
            } => {
                if let Some(monitor) = self.job(job) {
                    let work_dir = self.work_dir.clone();
                    monitor.start(use_pty, use_shell, work_dir).await;
                }
            }
            Request::ProcWrite { job, data } => {
                if let Some(monitor) = self.job(job) {
                    monitor.write(data.as_bytes()).await;
                }
            }
            Request::ProcCloseStdin { job } => {
                if let Some(monitor) = self.job(job) {
                    monitor.close_stdin().await;
                }
            }
            Request::ProcStop { job } => {
                if let Some(monitor) = self.job(job) {
                    monitor.stop();
                }
            }
            Request::ProcAddHook {
                job,
                stream,
                hook_id,
                pattern,
            } => {
                if let Some(monitor) = self.job(job) {
                    match monitor.add_hook(stream, hook_id, &pattern) {
                        Ok(()) => self.reply(Reply::HookAdded { job, hook_id }),
                        Err(err) => self.cmd_error(format!("bad hook pattern: {err}")),
                    }
                }
            }
            Request::ProcDropHook { job, hook_id } => {
                if let Some(monitor) = self.job(job) {
                    monitor.drop_hook(hook_id);
                    self.reply(Reply::HookDropped { job, hook_id });
                }
            }
            Request::TearDown { job } => {
                for monitor in self.jobs.values() {
                    monitor.kill();
                }
                self.event_log.close();
                self.done(job);
                return std::ops::ControlFlow::Break(());
            }
        }
        std::ops::ControlFlow::Continue(())
    }

    fn job(&self, job: JobId) -> Option<Arc<ProcessMonitor>> {
        let monitor = self.jobs.get(&job).cloned();
        if monitor.is_none() {
            self.cmd_error(format!("unknown job id {job}"));
        }
        monitor
    }

    fn set_work_dir(&mut self, job: JobId, path: &str) {
        let path = PathBuf::from(path);
        if path.exists() {
            self.failed(
                job,
                format!("working directory {} already exists", path.display()),
            );
            return;
        }
        if let Err(err) = std::fs::create_dir_all(&path) {
            self.failed(job, err);
            return;
        }
        if self.options.chdir {
            if let Err(err) = std::env::set_current_dir(&path) {
                self.failed(job, err);
                return;
            }
        }
        if let Err(err) = self.event_log.open(&path.join("event.log")) {
            self.failed(job, err);
            return;
        }
        self.work_dir = Some(path);
        self.done(job);
    }

    async fn list(&self, job: JobId, path: &str) {
        let root = self.resolve(path);
        let listed = tokio::task::spawn_blocking(move || fsops::recursive_list(&root)).await;
        match listed {
            Ok(Ok(entries)) => {
                for entry in entries {
                    let reply = match entry.kind {
                        crate::host::FileKind::File => Reply::ListFile {
                            job,
                            path: entry.path,
                            atime: entry.atime,
                            mtime: entry.mtime,
                            ctime: entry.ctime,
                        },
                        crate::host::FileKind::Dir => Reply::ListDir {
                            job,
                            path: entry.path,
                            atime: entry.atime,
                            mtime: entry.mtime,
                            ctime: entry.ctime,
                        },
                    };
                    self.reply(reply);
                }
                self.done(job);
            }
            Ok(Err(err)) => self.failed(job, err),
            Err(_) => self.failed(job, "filesystem worker panicked"),
        }
    }

    async fn fs_op<F>(&self, job: JobId, f: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        match tokio::task::spawn_blocking(f).await {
            Ok(Ok(())) => self.done(job),
            Ok(Err(err)) => self.failed(job, err),
            Err(_) => self.failed(job, "filesystem worker panicked"),
        }
    }

    fn cleanup(&mut self) {
        for monitor in self.jobs.values() {
            monitor.kill();
        }
        self.event_log.close();
    }
}

struct SystemInfo {
    hostname: String,
    system: String,
    release: String,
    version: String,
    machine: String,
}

fn system_info() -> SystemInfo {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } == 0 {
        SystemInfo {
            hostname: c_chars_to_string(&uts.nodename),
            system: c_chars_to_string(&uts.sysname),
            release: c_chars_to_string(&uts.release),
            version: c_chars_to_string(&uts.version),
            machine: c_chars_to_string(&uts.machine),
        }
    } else {
        SystemInfo {
            hostname: "unknown".to_owned(),
            system: "unknown".to_owned(),
            release: String::new(),
            version: String::new(),
            machine: String::new(),
        }
    }
}

fn c_chars_to_string(chars: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
