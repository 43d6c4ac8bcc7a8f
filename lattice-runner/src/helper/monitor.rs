// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-job process supervision inside the helper.

use super::EventLog;
use crate::{
    events::ProcessEvent,
    process::{CommandLine, LocalProcess, OutputMode, ProcessSpec},
    protocol::{Reply, StreamKind, wire::JobId},
};
use camino::Utf8PathBuf;
use regex::Regex;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc::UnboundedSender;

struct HelperHook {
    stream: StreamKind,
    pattern: Regex,
}

#[derive(Default)]
struct Pending {
    stdin_buf: Vec<u8>,
    close_requested: bool,
}

/// One `proc_prepare` job: collects cwd/env mutations until `proc_start`,
/// then supervises the child, logging its output to `event.log`, matching
/// hooks, and sending the terminal `done` reply.
pub(super) struct ProcessMonitor {
    job: JobId,
    cmdline: Vec<String>,
    output_mode: OutputMode,
    cwd: Mutex<Option<String>>,
    env: Mutex<Vec<(String, String)>>,
    hooks: Arc<Mutex<HashMap<u64, HelperHook>>>,
    pending: Mutex<Pending>,
    process: Mutex<Option<Arc<LocalProcess>>>,
    reply_tx: UnboundedSender<String>,
    event_log: Arc<EventLog>,
}

impl ProcessMonitor {
    pub(super) fn new(
        job: JobId,
        cmdline: Vec<String>,
        output_mode: OutputMode,
        reply_tx: UnboundedSender<String>,
        event_log: Arc<EventLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job,
            cmdline,
            output_mode,
            cwd: Mutex::new(None),
            env: Mutex::new(Vec::new()),
            hooks: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(Pending::default()),
            process: Mutex::new(None),
            reply_tx,
            event_log,
        })
    }

    fn reply(&self, reply: Reply) {
        let _ = self.reply_tx.send(reply.render());
    }

    pub(super) fn set_cwd(&self, cwd: String) {
        *self.cwd.lock().expect("cwd lock poisoned") = Some(cwd);
    }

    pub(super) fn add_env(&self, name: String, value: String) {
        self.env
            .lock()
            .expect("env lock poisoned")
            .push((name, value));
    }

    pub(super) fn add_hook(
        &self,
        stream: StreamKind,
        hook_id: u64,
        pattern: &str,
    ) -> Result<(), regex::Error> {
        let pattern = Regex::new(pattern)?;
        self.hooks
            .lock()
            .expect("hooks lock poisoned")
            .insert(hook_id, HelperHook { stream, pattern });
        Ok(())
    }

    pub(super) fn drop_hook(&self, hook_id: u64) {
        self.hooks
            .lock()
            .expect("hooks lock poisoned")
            .remove(&hook_id);
    }

    pub(super) async fn start(
        self: &Arc<Self>,
        use_pty: bool,
        use_shell: bool,
        work_dir: Option<PathBuf>,
    ) {
        let argv = if use_shell {
            vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                self.cmdline.join(" "),
            ]
        } else {
            self.cmdline.clone()
        };

        let configured = self.cwd.lock().expect("cwd lock poisoned").clone();
        let cwd: PathBuf = match (configured, &work_dir) {
            (Some(path), _) if std::path::Path::new(&path).is_absolute() => PathBuf::from(path),
            (Some(path), Some(work_dir)) => work_dir.join(path),
            (Some(path), None) => PathBuf::from(path),
            (None, Some(work_dir)) => work_dir.clone(),
            (None, None) => PathBuf::from("."),
        };
        let cwd = match Utf8PathBuf::from_path_buf(cwd) {
            Ok(cwd) => cwd,
            Err(path) => {
                self.reply(Reply::Failed {
                    job: self.job,
                    message: Some(format!("non-UTF-8 working directory: {}", path.display())),
                });
                return;
            }
        };

        let spec = ProcessSpec::new(
            format!("job-{}", self.job),
            CommandLine::Argv(argv),
            cwd,
            self.output_mode,
        );
        let mut spec = match spec {
            Ok(spec) => spec,
            Err(err) => {
                self.reply(Reply::Failed {
                    job: self.job,
                    message: Some(err.to_string()),
                });
                return;
            }
        };
        for (name, value) in self.env.lock().expect("env lock poisoned").drain(..) {
            spec.add_env(name, &value);
        }

        let (process, _completion) = LocalProcess::new(spec);

        // An observer sees events in the supervisor's context, so log
        // writes and hook-match replies land before the terminal `done`.
        let weak = Arc::downgrade(self);
        process.events().add_observer(move |event| {
            let Some(monitor) = weak.upgrade() else {
                return;
            };
            match event {
                ProcessEvent::Out { data } | ProcessEvent::Err { data } => {
                    monitor.event_log.append(monitor.job, event.channel(), data);
                    monitor.match_hooks(event, data);
                }
                ProcessEvent::Ended { exit_code } => {
                    monitor
                        .event_log
                        .append(monitor.job, "info", &format!("exited with {exit_code}"));
                    monitor.reply(Reply::Done {
                        job: monitor.job,
                        retcode: Some(i64::from(*exit_code)),
                    });
                }
            }
        });

        if let Err(err) = process.start(use_pty).await {
            self.reply(Reply::Failed {
                job: self.job,
                message: Some(err.to_string()),
            });
            return;
        }

        let pid = process.pid().unwrap_or(0);
        self.reply(Reply::ProcPid {
            job: self.job,
            pid: i64::from(pid),
        });
        self.event_log
            .append(self.job, "info", &format!("started pid {pid}"));

        // Flush writes that arrived before the start.
        let (buffered, close_requested) = self.take_pending();
        if !buffered.is_empty() {
            process.write(&buffered).await;
        }
        if close_requested {
            process.close_stdin().await;
        }

        *self.process.lock().expect("process lock poisoned") = Some(process);
    }

    fn take_pending(&self) -> (Vec<u8>, bool) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let buffered = std::mem::take(&mut pending.stdin_buf);
        let close_requested = pending.close_requested;
        (buffered, close_requested)
    }

    fn match_hooks(&self, event: &ProcessEvent, data: &str) {
        let event_stream = match event {
            ProcessEvent::Out { .. } => StreamKind::Out,
            ProcessEvent::Err { .. } => StreamKind::Err,
            ProcessEvent::Ended { .. } => return,
        };
        let hooks = self.hooks.lock().expect("hooks lock poisoned");
        for (hook_id, hook) in hooks.iter() {
            if hook.stream == event_stream && hook.pattern.is_match(data) {
                self.reply(Reply::HookMatched {
                    job: self.job,
                    hook_id: *hook_id,
                    data: data.to_owned(),
                });
            }
        }
    }

    pub(super) async fn write(&self, data: &[u8]) {
        let process = self.process.lock().expect("process lock poisoned").clone();
        match process {
            Some(process) => process.write(data).await,
            None => self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .stdin_buf
                .extend_from_slice(data),
        }
    }

    pub(super) async fn close_stdin(&self) {
        let process = self.process.lock().expect("process lock poisoned").clone();
        match process {
            Some(process) => process.close_stdin().await,
            None => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .close_requested = true;
            }
        }
    }

    /// Orderly stop; the process's own `done` reply follows when it exits.
    pub(super) fn stop(&self) {
        if let Some(process) = self.process.lock().expect("process lock poisoned").as_ref() {
            process.stop();
        }
    }

    /// Last-resort kill used at teardown.
    pub(super) fn kill(&self) {
        if let Some(process) = self.process.lock().expect("process lock poisoned").as_ref() {
            process.kill();
        }
    }
}
