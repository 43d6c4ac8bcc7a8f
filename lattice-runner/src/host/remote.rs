// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A machine reached over SSH as a controlled host.
//!
//! The session drives the system `ssh` client through `tokio::process`:
//! one exec channel runs the uploaded helper program and carries the line
//! protocol of [`crate::protocol`]; short-lived `cat` exec channels move
//! files in 64 KiB chunks. Job ids are allocated monotonically per session
//! and each is retired by exactly one `done` or `failed` reply.

use crate::{
    component::{BuildContext, CapabilityHandle, Component, ComponentClass, ComponentContext, Suite},
    errors::{HostError, NodeFailure},
    events::{EventClass, EventMatcher, EventSource, HookId, ProcessEvent},
    graph::{Capability, NestedDef, NodeKind},
    host::{
        CONTROLLED_HOST, ControlledHost, ControlledProcess, FileKind, ListEntry, ProcessOptions,
        TRANSFER_CHUNK_SIZE,
    },
    process::{
        CommandLine, Completion, CompletionSender, ExitOutcome, completion_pair,
    },
    protocol::{Reply, Request, StreamKind, wire::JobId},
    runner::RunnerHandle,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{
        mpsc::{UnboundedSender, unbounded_channel},
        oneshot,
    },
};
use tracing::{debug, warn};

/// The first port `temp_port` hands out on a remote host.
const FIRST_TEMP_PORT: u16 = 32768;

/// Where the helper program lands on the remote machine, relative to the
/// user's home directory.
const HELPER_TARGET_NAME: &str = ".lattice-helper";

/// How to reach the remote machine.
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// Login user.
    pub user: String,
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
}

impl SshConfig {
    fn command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, self.host))
            .arg("--");
        command
    }
}

struct RemoteInfo {
    hostname: String,
    separator: String,
    abs_work_dir: String,
    helper_path: String,
}

enum PendingJob {
    /// A plain file operation; resolves with the retcode.
    Plain(oneshot::Sender<Result<i64, String>>),
    /// A directory listing; entries accumulate until `done`.
    List(oneshot::Sender<Result<Vec<ListEntry>, String>>),
    /// A process job; `done` resolves the process completion instead.
    Proc,
}

/// One SSH session: helper channel, job bookkeeping, and the
/// [`ControlledHost`] surface on top of them.
pub struct RemoteSession {
    self_weak: Weak<RemoteSession>,
    node_name: String,
    ssh: SshConfig,
    work_dir_cfg: String,
    handle: RunnerHandle,
    job_counter: AtomicU64,
    hook_counter: AtomicU64,
    request_tx: Mutex<Option<UnboundedSender<String>>>,
    hello_tx: Mutex<Option<oneshot::Sender<Reply>>>,
    info: Mutex<Option<RemoteInfo>>,
    pending_jobs: Mutex<HashMap<JobId, PendingJob>>,
    pending_procs: Mutex<HashMap<JobId, Arc<RemoteProcess>>>,
    pending_lists: Mutex<HashMap<JobId, Vec<ListEntry>>>,
    completed_procs: Mutex<HashMap<JobId, String>>,
    helper_child: tokio::sync::Mutex<Option<Child>>,
    temp_dir_counter: Mutex<u32>,
    temp_port: Mutex<u16>,
}

impl RemoteSession {
    /// Creates a disconnected session.
    pub fn new(
        node_name: impl Into<String>,
        ssh: SshConfig,
        work_dir: impl Into<String>,
        handle: RunnerHandle,
    ) -> Arc<Self> {
        let node_name = node_name.into();
        let work_dir = work_dir.into();
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            node_name,
            ssh,
            work_dir_cfg: work_dir,
            handle,
            job_counter: AtomicU64::new(0),
            hook_counter: AtomicU64::new(0),
            request_tx: Mutex::new(None),
            hello_tx: Mutex::new(None),
            info: Mutex::new(None),
            pending_jobs: Mutex::new(HashMap::new()),
            pending_procs: Mutex::new(HashMap::new()),
            pending_lists: Mutex::new(HashMap::new()),
            completed_procs: Mutex::new(HashMap::new()),
            helper_child: tokio::sync::Mutex::new(None),
            temp_dir_counter: Mutex::new(0),
            temp_port: Mutex::new(FIRST_TEMP_PORT),
        })
    }

    /// Connects: discovers the home directory, uploads the helper, execs
    /// it, waits for `hello` and initializes the working directory.
    pub async fn connect(self: &Arc<Self>) -> Result<(), HostError> {
        let home = self.exec_capture("pwd").await?.trim().to_owned();
        if home.is_empty() {
            return Err(HostError::new("connect", "unable to discover home directory"));
        }

        let abs_work_dir = if self.work_dir_cfg.starts_with('/') {
            self.work_dir_cfg.clone()
        } else {
            format!("{home}/{}", self.work_dir_cfg)
        };
        let helper_path = format!("{home}/{HELPER_TARGET_NAME}");

        let helper_source = self.helper_source()?;
        self.upload_via_cat(&helper_source, &helper_path, true)
            .await?;

        // Fresh exec channel for the helper itself.
        let mut child = self
            .ssh
            .command()
            .arg(&helper_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| HostError::new("connect", err))?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let (hello_tx, hello_rx) = oneshot::channel();
        *self.hello_tx.lock().expect("hello lock poisoned") = Some(hello_tx);

        let (request_tx, mut request_rx) = unbounded_channel::<String>();
        *self.request_tx.lock().expect("request lock poisoned") = Some(request_tx);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = request_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(session) = session.upgrade() else { break };
                match Reply::parse(&line) {
                    Ok((reply, parse_errors)) => {
                        for err in parse_errors {
                            session.handle.log(format!("WARNING: {err}"));
                        }
                        session.process_reply(reply);
                    }
                    Err(err) => session.handle.log(format!("WARNING: {err}")),
                }
            }
        });

        *self.helper_child.lock().await = Some(child);

        let hello = hello_rx
            .await
            .map_err(|_| HostError::new("connect", "helper exited before hello"))?;
        let Reply::Hello {
            hostname,
            separator,
            system,
            release,
            machine,
            ..
        } = hello
        else {
            return Err(HostError::new("connect", "unexpected first reply"));
        };
        debug!(
            node = self.node_name.as_str(),
            hostname, system, release, machine, "remote helper started"
        );
        *self.info.lock().expect("info lock poisoned") = Some(RemoteInfo {
            hostname,
            separator,
            abs_work_dir: abs_work_dir.clone(),
            helper_path,
        });

        self.run_job(|job| Request::SetWorkDir {
            job,
            path: abs_work_dir,
        })
        .await?;
        Ok(())
    }

    /// Tears down the helper, downloads and rewrites its event log, and
    /// removes the remote working directory.
    pub async fn teardown(&self) -> Result<(), HostError> {
        self.run_job(|job| Request::TearDown { job }).await?;

        let info = self.info_snapshot()?;
        let remote_log = format!("{}{}event.log", info.abs_work_dir, info.separator);
        let raw_path = self
            .handle
            .tmp_dir()
            .join(format!("{}-event.log.raw", self.node_name));
        self.download_via_cat(&remote_log, &raw_path).await?;

        let rewritten_path = self
            .handle
            .tmp_dir()
            .join(format!("{}-event.log", self.node_name));
        self.rewrite_event_log(&raw_path, &rewritten_path)?;
        let _ = std::fs::remove_file(raw_path.as_std_path());
        self.handle
            .register_host_log(&self.node_name, rewritten_path);

        // The helper is gone; remove its working directory over a plain
        // exec channel.
        self.exec_capture(&format!("rm -rf {}", shell_quote(&info.abs_work_dir)))
            .await?;

        if let Some(mut child) = self.helper_child.lock().await.take() {
            let _ = child.wait().await;
        }
        *self.request_tx.lock().expect("request lock poisoned") = None;
        Ok(())
    }

    /// Rewrites each downloaded record's job id into the originating node
    /// name, using the job-id → name table kept while processes ran.
    fn rewrite_event_log(&self, raw: &Utf8Path, out: &Utf8Path) -> Result<(), HostError> {
        use std::fmt::Write;

        let contents = std::fs::read_to_string(raw.as_std_path())
            .map_err(|err| HostError::new("downloadFile", err))?;
        // Snapshot the two name tables separately; the reply path locks
        // them in the other order.
        let completed: HashMap<JobId, String> = self
            .completed_procs
            .lock()
            .expect("proc lock poisoned")
            .clone();
        let pending: HashMap<JobId, String> = self
            .pending_procs
            .lock()
            .expect("proc lock poisoned")
            .iter()
            .map(|(job, proc)| (*job, proc.name.clone()))
            .collect();
        let mut rewritten = String::with_capacity(contents.len());
        for line in contents.lines() {
            let mut parts = line.splitn(4, ':');
            let (Some(timestamp), Some(jobid), Some(channel), Some(rest)) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                continue;
            };
            let name = match jobid.parse::<u64>() {
                Ok(0) => self.node_name.clone(),
                Ok(id) => {
                    let job = JobId(id);
                    if let Some(name) = completed.get(&job) {
                        name.clone()
                    } else if let Some(name) = pending.get(&job) {
                        warn!(name = name.as_str(), "proc still pending");
                        name.clone()
                    } else {
                        warn!(job = id, "no proc name for job");
                        "(unknown)".to_owned()
                    }
                }
                Err(_) => "(unknown)".to_owned(),
            };
            let _ = writeln!(rewritten, "{timestamp}:{name}:{channel}:{rest}");
        }
        std::fs::write(out.as_std_path(), rewritten)
            .map_err(|err| HostError::new("downloadFile", err))
    }

    fn helper_source(&self) -> Result<Utf8PathBuf, HostError> {
        if let Some(value) = self.handle.config("helper_path") {
            if let Some(path) = value.as_str() {
                return Ok(Utf8PathBuf::from(path));
            }
        }
        let exe = std::env::current_exe().map_err(|err| HostError::new("connect", err))?;
        let exe = Utf8PathBuf::from_path_buf(exe)
            .map_err(|_| HostError::new("connect", "non-UTF-8 executable path"))?;
        let sibling = exe
            .parent()
            .map(|dir| dir.join("lattice-helper"))
            .filter(|path| path.exists());
        sibling.ok_or_else(|| {
            HostError::new(
                "connect",
                "no helper binary found; set `helper_path` in the run config",
            )
        })
    }

    fn info_snapshot(&self) -> Result<RemoteInfo, HostError> {
        let info = self.info.lock().expect("info lock poisoned");
        match info.as_ref() {
            Some(info) => Ok(RemoteInfo {
                hostname: info.hostname.clone(),
                separator: info.separator.clone(),
                abs_work_dir: info.abs_work_dir.clone(),
                helper_path: info.helper_path.clone(),
            }),
            None => Err(HostError::new("connect", "session is not connected")),
        }
    }

    fn next_job(&self) -> JobId {
        JobId(self.job_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn send_request(&self, request: &Request) -> Result<(), HostError> {
        let tx = self.request_tx.lock().expect("request lock poisoned");
        let tx = tx
            .as_ref()
            .ok_or_else(|| HostError::new(request.command(), "session is closed"))?;
        tx.send(request.render())
            .map_err(|_| HostError::new(request.command(), "session is closed"))
    }

    /// Sends a job-carrying request and waits for its terminal reply.
    async fn run_job(
        &self,
        make: impl FnOnce(JobId) -> Request,
    ) -> Result<i64, HostError> {
        let job = self.next_job();
        let request = make(job);
        let op = request.command();
        let (tx, rx) = oneshot::channel();
        self.pending_jobs
            .lock()
            .expect("job lock poisoned")
            .insert(job, PendingJob::Plain(tx));
        if let Err(err) = self.send_request(&request) {
            self.pending_jobs
                .lock()
                .expect("job lock poisoned")
                .remove(&job);
            return Err(err);
        }
        match rx.await {
            Ok(Ok(retcode)) => Ok(retcode),
            Ok(Err(message)) => Err(HostError::new(op, message)),
            Err(_) => Err(HostError::new(op, "session closed before reply")),
        }
    }

    fn process_reply(self: &Arc<Self>, reply: Reply) {
        match reply {
            Reply::Hello { .. } => {
                if let Some(tx) = self.hello_tx.lock().expect("hello lock poisoned").take() {
                    let _ = tx.send(reply);
                }
            }
            Reply::Done { job, retcode } => self.retire_job(job, Ok(retcode.unwrap_or(0))),
            Reply::Failed { job, message } => {
                self.retire_job(job, Err(message.unwrap_or_else(|| "failed".to_owned())));
            }
            Reply::CmdError { message } => {
                self.handle.log(format!("command error: {message}"));
            }
            Reply::ProcPid { job, pid } => {
                if let Some(proc) = self.proc_for(job, "proc_pid") {
                    *proc.pid.lock().expect("pid lock poisoned") = Some(pid);
                }
            }
            Reply::HookAdded { job, hook_id } => {
                debug!(%job, hook_id, "remote hook installed");
            }
            Reply::HookDropped { job, hook_id } => {
                debug!(%job, hook_id, "remote hook dropped");
            }
            Reply::HookMatched { job, hook_id, data } => {
                if let Some(proc) = self.proc_for(job, "hook_matched") {
                    proc.trigger_hook(hook_id, data);
                }
            }
            Reply::ListFile {
                job,
                path,
                atime,
                mtime,
                ctime,
            } => self.push_list_entry(job, FileKind::File, path, atime, mtime, ctime),
            Reply::ListDir {
                job,
                path,
                atime,
                mtime,
                ctime,
            } => self.push_list_entry(job, FileKind::Dir, path, atime, mtime, ctime),
        }
    }

    fn retire_job(&self, job: JobId, result: Result<i64, String>) {
        let pending = self
            .pending_jobs
            .lock()
            .expect("job lock poisoned")
            .remove(&job);
        match pending {
            Some(PendingJob::Plain(tx)) => {
                let _ = tx.send(result);
            }
            Some(PendingJob::List(tx)) => {
                let entries = self
                    .pending_lists
                    .lock()
                    .expect("list lock poisoned")
                    .remove(&job)
                    .unwrap_or_default();
                let _ = tx.send(result.map(|_| entries));
            }
            Some(PendingJob::Proc) => {
                let proc = self
                    .pending_procs
                    .lock()
                    .expect("proc lock poisoned")
                    .remove(&job);
                if let Some(proc) = proc {
                    self.completed_procs
                        .lock()
                        .expect("proc lock poisoned")
                        .insert(job, proc.name.clone());
                    let outcome = match result {
                        Ok(retcode) => {
                            proc.events.emit(ProcessEvent::Ended {
                                exit_code: retcode as i32,
                            });
                            ExitOutcome::Exited(retcode as i32)
                        }
                        Err(message) => ExitOutcome::Failed(message),
                    };
                    proc.completion_tx.complete(outcome);
                }
            }
            None => {
                self.handle.log(format!(
                    "remote helper sent a terminal reply for unknown job {job}"
                ));
            }
        }
    }

    fn proc_for(&self, job: JobId, what: &str) -> Option<Arc<RemoteProcess>> {
        let proc = self
            .pending_procs
            .lock()
            .expect("proc lock poisoned")
            .get(&job)
            .cloned();
        if proc.is_none() {
            self.handle.log(format!(
                "remote helper sent '{what}' for unknown process {job}"
            ));
        }
        proc
    }

    fn push_list_entry(
        &self,
        job: JobId,
        kind: FileKind,
        path: String,
        atime: i64,
        mtime: i64,
        ctime: i64,
    ) {
        let mut lists = self.pending_lists.lock().expect("list lock poisoned");
        match lists.get_mut(&job) {
            Some(entries) => entries.push(ListEntry {
                kind,
                path,
                atime,
                mtime,
                ctime,
            }),
            None => {
                self.handle
                    .log(format!("remote helper sent a list entry for unknown job {job}"));
            }
        }
    }

    /// Runs a command on a plain exec channel and reports whether it
    /// exited successfully.
    async fn exec_status(&self, op: &'static str, command: &str) -> Result<bool, HostError> {
        let status = self
            .ssh
            .command()
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|err| HostError::new(op, err))?;
        Ok(status.success())
    }

    async fn exec_capture(&self, command: &str) -> Result<String, HostError> {
        let output = self
            .ssh
            .command()
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| HostError::new("connect", err))?;
        if !output.status.success() {
            return Err(HostError::new(
                "connect",
                format!(
                    "remote command `{command}` failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn upload_via_cat(
        &self,
        src: &Utf8Path,
        dest: &str,
        executable: bool,
    ) -> Result<(), HostError> {
        let chmod = if executable {
            format!(" && chmod +x {}", shell_quote(dest))
        } else {
            String::new()
        };
        let mut child = self
            .ssh
            .command()
            .arg(format!("cat > {}{chmod}", shell_quote(dest)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| HostError::new("uploadFile", err))?;
        let mut stdin = child.stdin.take().expect("stdin was piped");

        let mut input = tokio::fs::File::open(src.as_std_path())
            .await
            .map_err(|err| HostError::new("uploadFile", err))?;
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        loop {
            let n = input
                .read(&mut buf)
                .await
                .map_err(|err| HostError::new("uploadFile", err))?;
            if n == 0 {
                break;
            }
            stdin
                .write_all(&buf[..n])
                .await
                .map_err(|err| HostError::new("uploadFile", err))?;
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| HostError::new("uploadFile", err))?;
        if !output.status.success() {
            return Err(HostError::new(
                "uploadFile",
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(())
    }

    async fn download_via_cat(&self, src: &str, dest: &Utf8Path) -> Result<(), HostError> {
        let mut child = self
            .ssh
            .command()
            .arg(format!("cat {}", shell_quote(src)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| HostError::new("downloadFile", err))?;
        let mut stdout = child.stdout.take().expect("stdout was piped");

        let mut output_file = tokio::fs::File::create(dest.as_std_path())
            .await
            .map_err(|err| HostError::new("downloadFile", err))?;
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|err| HostError::new("downloadFile", err))?;
            if n == 0 {
                break;
            }
            output_file
                .write_all(&buf[..n])
                .await
                .map_err(|err| HostError::new("downloadFile", err))?;
        }
        output_file
            .flush()
            .await
            .map_err(|err| HostError::new("downloadFile", err))?;

        let status = child
            .wait()
            .await
            .map_err(|err| HostError::new("downloadFile", err))?;
        if !status.success() {
            return Err(HostError::new("downloadFile", "remote read failed"));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlledHost for RemoteSession {
    fn host_name(&self) -> String {
        self.info
            .lock()
            .expect("info lock poisoned")
            .as_ref()
            .map(|info| info.hostname.clone())
            .unwrap_or_else(|| self.node_name.clone())
    }

    fn temp_dir(&self, desc: &str) -> String {
        let (work_dir, separator) = match self.info.lock().expect("info lock poisoned").as_ref() {
            Some(info) => (info.abs_work_dir.clone(), info.separator.clone()),
            None => (self.work_dir_cfg.clone(), "/".to_owned()),
        };
        let mut counter = self.temp_dir_counter.lock().expect("counter lock poisoned");
        *counter += 1;
        format!("{work_dir}{separator}{desc}-{:04}", *counter)
    }

    async fn temp_port(&self) -> Result<u16, HostError> {
        let info = self.info_snapshot()?;
        loop {
            let candidate = {
                let mut port = self.temp_port.lock().expect("port lock poisoned");
                let candidate = *port;
                *port += 1;
                candidate
            };
            // Probe on the remote side: the uploaded helper binds the
            // port and exits 0 iff it is free.
            let free = self
                .exec_status(
                    "tempPort",
                    &format!(
                        "{} --probe-port {candidate}",
                        shell_quote(&info.helper_path)
                    ),
                )
                .await?;
            if free {
                return Ok(candidate);
            }
        }
    }

    fn join_path(&self, parts: &[&str]) -> String {
        let separator = self
            .info
            .lock()
            .expect("info lock poisoned")
            .as_ref()
            .map(|info| info.separator.clone())
            .unwrap_or_else(|| "/".to_owned());
        parts.join(&separator)
    }

    async fn recursive_list(&self, root: &str) -> Result<Vec<ListEntry>, HostError> {
        let job = self.next_job();
        let (tx, rx) = oneshot::channel();
        {
            let mut jobs = self.pending_jobs.lock().expect("job lock poisoned");
            jobs.insert(job, PendingJob::List(tx));
        }
        self.pending_lists
            .lock()
            .expect("list lock poisoned")
            .insert(job, Vec::new());
        self.send_request(&Request::List {
            job,
            path: root.to_owned(),
        })?;
        match rx.await {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(message)) => Err(HostError::new("recursiveList", message)),
            Err(_) => Err(HostError::new("recursiveList", "session closed before reply")),
        }
    }

    async fn recursive_remove(&self, path: &str) -> Result<(), HostError> {
        self.run_job(|job| Request::Remove {
            job,
            path: path.to_owned(),
        })
        .await
        .map(|_| ())
    }

    async fn recursive_copy(
        &self,
        src: &str,
        dest: &str,
        ignore: Option<&str>,
    ) -> Result<(), HostError> {
        self.run_job(|job| Request::Copy {
            job,
            src: src.to_owned(),
            dest: dest.to_owned(),
            ignore: ignore.map(str::to_owned),
        })
        .await
        .map(|_| ())
    }

    async fn append_to_file(&self, path: &str, data: &str) -> Result<(), HostError> {
        self.run_job(|job| Request::Append {
            job,
            path: path.to_owned(),
            data: data.to_owned(),
        })
        .await
        .map(|_| ())
    }

    async fn make_directory(&self, path: &str) -> Result<(), HostError> {
        self.run_job(|job| Request::MakeDirs {
            job,
            path: path.to_owned(),
        })
        .await
        .map(|_| ())
    }

    async fn utime(&self, path: &str, atime: i64, mtime: i64) -> Result<(), HostError> {
        self.run_job(|job| Request::Utime {
            job,
            path: path.to_owned(),
            atime,
            mtime,
        })
        .await
        .map(|_| ())
    }

    async fn upload_file(&self, src: &Utf8Path, dest: &str) -> Result<(), HostError> {
        self.upload_via_cat(src, dest, false).await
    }

    async fn download_file(&self, src: &str, dest: &Utf8Path) -> Result<(), HostError> {
        self.download_via_cat(src, dest).await
    }

    async fn prepare_process(
        &self,
        name: &str,
        cmdline: CommandLine,
        options: ProcessOptions,
    ) -> Result<(Arc<dyn ControlledProcess>, Completion), HostError> {
        let argv = cmdline.into_argv()?;
        let job = self.next_job();
        self.pending_jobs
            .lock()
            .expect("job lock poisoned")
            .insert(job, PendingJob::Proc);

        self.send_request(&Request::ProcPrepare {
            job,
            output_mode: options.output,
            cmdline: argv,
        })?;
        if let Some(cwd) = options.cwd {
            self.send_request(&Request::ProcCwd { job, cwd })?;
        }

        let (completion_tx, completion) = completion_pair();
        let proc = Arc::new(RemoteProcess {
            session: self.self_weak.clone(),
            name: name.to_owned(),
            job,
            pid: Mutex::new(None),
            events: Arc::new(EventSource::new()),
            hooks_by_remote: Mutex::new(HashMap::new()),
            completion_tx,
            completion: completion.clone(),
        });
        self.pending_procs
            .lock()
            .expect("proc lock poisoned")
            .insert(job, Arc::clone(&proc));
        Ok((proc as Arc<dyn ControlledProcess>, completion))
    }
}

/// A process running under the remote helper. Hooks have a second
/// identity, the remote hook id, tracked inside the helper; matching
/// happens remotely and `hook_matched` replies are routed back to the
/// locally installed hook.
pub struct RemoteProcess {
    session: Weak<RemoteSession>,
    name: String,
    job: JobId,
    pid: Mutex<Option<i64>>,
    events: Arc<EventSource>,
    hooks_by_remote: Mutex<HashMap<u64, (HookId, StreamKind)>>,
    completion_tx: CompletionSender,
    completion: Completion,
}

impl RemoteProcess {
    fn session(&self) -> Result<Arc<RemoteSession>, HostError> {
        self.session
            .upgrade()
            .ok_or_else(|| HostError::new("prepareProcess", "session is closed"))
    }

    /// The pid reported by the helper, if the process started.
    pub fn pid(&self) -> Option<i64> {
        *self.pid.lock().expect("pid lock poisoned")
    }

    /// Routes a remote match to the locally installed hook. May be called
    /// for hooks already removed locally (network delay); those matches
    /// are dropped.
    fn trigger_hook(&self, remote_id: u64, data: String) {
        let hooks = self.hooks_by_remote.lock().expect("hook lock poisoned");
        if let Some((local_id, stream)) = hooks.get(&remote_id) {
            let event = match stream {
                StreamKind::Out => ProcessEvent::Out { data },
                StreamKind::Err => ProcessEvent::Err { data },
            };
            self.events.fire_hook(*local_id, event);
        }
    }
}

#[async_trait]
impl ControlledProcess for RemoteProcess {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn events(&self) -> &Arc<EventSource> {
        &self.events
    }

    async fn add_hook(
        &self,
        matcher: EventMatcher,
        sender: tokio::sync::mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<HookId, HostError> {
        match matcher.class() {
            // Termination is observed locally: the session emits `Ended`
            // when the helper retires the job.
            EventClass::ProcessEnded => Ok(self.events.add_hook(matcher, sender)),
            EventClass::StreamOut | EventClass::StreamErr => {
                let stream = if matcher.class() == EventClass::StreamOut {
                    StreamKind::Out
                } else {
                    StreamKind::Err
                };
                let pattern = matcher.pattern().unwrap_or("").to_owned();
                let session = self.session()?;
                let local_id = self.events.add_hook(matcher, sender);
                let remote_id = session.hook_counter.fetch_add(1, Ordering::Relaxed) + 1;
                self.hooks_by_remote
                    .lock()
                    .expect("hook lock poisoned")
                    .insert(remote_id, (local_id, stream));
                session.send_request(&Request::ProcAddHook {
                    job: self.job,
                    stream,
                    hook_id: remote_id,
                    pattern,
                })?;
                Ok(local_id)
            }
            EventClass::AnyStream => Err(HostError::new(
                "addHook",
                "remote hooks apply to exactly one stream",
            )),
        }
    }

    async fn remove_hook(&self, id: HookId) -> Result<(), HostError> {
        let remote_id = {
            let mut hooks = self.hooks_by_remote.lock().expect("hook lock poisoned");
            let remote_id = hooks
                .iter()
                .find(|(_, (local, _))| *local == id)
                .map(|(remote, _)| *remote);
            if let Some(remote_id) = remote_id {
                hooks.remove(&remote_id);
            }
            remote_id
        };
        self.events
            .remove_hook(id)
            .map_err(|err| HostError::new("removeHook", err))?;
        if let Some(remote_id) = remote_id {
            let session = self.session()?;
            session.send_request(&Request::ProcDropHook {
                job: self.job,
                hook_id: remote_id,
            })?;
        }
        Ok(())
    }

    async fn add_env(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.session()?.send_request(&Request::ProcEnv {
            job: self.job,
            name: key.to_owned(),
            value: value.to_owned(),
        })
    }

    async fn start(&self, use_pty: bool) -> Result<(), HostError> {
        self.session()?.send_request(&Request::ProcStart {
            job: self.job,
            use_pty,
            use_shell: false,
        })
    }

    async fn write(&self, data: &[u8]) -> Result<(), HostError> {
        self.session()?.send_request(&Request::ProcWrite {
            job: self.job,
            data: String::from_utf8_lossy(data).into_owned(),
        })
    }

    async fn close_stdin(&self) -> Result<(), HostError> {
        self.session()?
            .send_request(&Request::ProcCloseStdin { job: self.job })
    }

    fn stop(&self) -> Completion {
        if let Ok(session) = self.session() {
            let _ = session.send_request(&Request::ProcStop { job: self.job });
        }
        self.completion.clone()
    }

    fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

/// A suite connecting to one remote machine over SSH. Arguments:
/// `(user, host, port, workdir)`.
pub struct RemoteHostSuite {
    session: Arc<RemoteSession>,
}

impl RemoteHostSuite {
    /// The session, for direct host access.
    pub fn session(&self) -> Arc<RemoteSession> {
        Arc::clone(&self.session)
    }
}

#[async_trait]
impl Suite for RemoteHostSuite {
    async fn set_up(&self, _cx: &ComponentContext) -> Result<Option<NestedDef>, NodeFailure> {
        self.session.connect().await?;
        Ok(None)
    }

    async fn tear_down(&self, _cx: &ComponentContext) -> Result<(), NodeFailure> {
        self.session.teardown().await?;
        Ok(())
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == CONTROLLED_HOST).then(|| {
            let host: Arc<dyn ControlledHost> = self.session();
            Arc::new(host) as CapabilityHandle
        })
    }
}

/// Class for [`RemoteHostSuite`].
pub struct RemoteHostClass;

impl ComponentClass for RemoteHostClass {
    fn name(&self) -> &'static str {
        "RemoteHost"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Suite
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![CONTROLLED_HOST]
    }

    fn arg_count(&self) -> usize {
        4
    }

    fn build(&self, cx: BuildContext) -> Result<Component, NodeFailure> {
        let user = cx.arg_str(0)?.to_owned();
        let host = cx.arg_str(1)?.to_owned();
        let port = u16::try_from(cx.arg_int(2)?)
            .map_err(|_| NodeFailure::Harness(format!("invalid port for `{}`", cx.name)))?;
        let work_dir = cx.arg_str(3)?.to_owned();
        let session = RemoteSession::new(
            cx.name.clone(),
            SshConfig { user, host, port },
            work_dir,
            cx.handle.clone(),
        );
        Ok(Component::Suite(Arc::new(RemoteHostSuite { session })))
    }
}

/// Minimal single-quote shell quoting for paths embedded in exec-channel
/// command strings.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
