// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The local machine as a controlled host.

use crate::{
    component::{BuildContext, CapabilityHandle, Component, ComponentClass, Suite},
    errors::{HostError, NodeFailure},
    events::{EventMatcher, EventSource, HookId, ProcessEvent},
    graph::{Capability, NodeKind},
    host::{
        CONTROLLED_HOST, ControlledHost, ControlledProcess, ListEntry, ProcessOptions,
        TRANSFER_CHUNK_SIZE, fsops,
    },
    process::{CommandLine, Completion, LocalProcess, ProcessSpec},
    runner::RunnerHandle,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    net::TcpListener,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc::UnboundedSender,
};

/// The first port [`ControlledHost::temp_port`] hands out.
const FIRST_TEMP_PORT: u16 = 32768;

/// The local machine. Temp directories are vended under the runner's
/// per-run working directory; processes are supervised by
/// [`LocalProcess`].
pub struct LocalHost {
    handle: RunnerHandle,
    temp_dir_counter: Mutex<u32>,
    temp_port: Mutex<u16>,
}

impl LocalHost {
    /// Creates a host bound to one run.
    pub fn new(handle: RunnerHandle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            temp_dir_counter: Mutex::new(0),
            temp_port: Mutex::new(FIRST_TEMP_PORT),
        })
    }

    fn tmp_dir(&self) -> Utf8PathBuf {
        self.handle.tmp_dir().to_owned()
    }
}

async fn blocking_fs_op<T, F>(op: &'static str, f: F) -> Result<T, HostError>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|err| HostError::new(op, err)),
        Err(_) => Err(HostError::new(op, "filesystem worker panicked")),
    }
}

#[async_trait]
impl ControlledHost for LocalHost {
    fn host_name(&self) -> String {
        "localhost".to_owned()
    }

    fn temp_dir(&self, desc: &str) -> String {
        let mut counter = self.temp_dir_counter.lock().expect("counter lock poisoned");
        *counter += 1;
        self.tmp_dir()
            .join(format!("{desc}-{:04}", *counter))
            .into_string()
    }

    async fn temp_port(&self) -> Result<u16, HostError> {
        let mut port = self.temp_port.lock().expect("port lock poisoned");
        loop {
            let candidate = *port;
            *port += 1;
            // Probe that the port is actually free before vending it.
            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                return Ok(candidate);
            }
        }
    }

    fn join_path(&self, parts: &[&str]) -> String {
        parts.join(std::path::MAIN_SEPARATOR_STR)
    }

    async fn recursive_list(&self, root: &str) -> Result<Vec<ListEntry>, HostError> {
        let root = PathBuf::from(root);
        blocking_fs_op("recursiveList", move || fsops::recursive_list(&root)).await
    }

    async fn recursive_remove(&self, path: &str) -> Result<(), HostError> {
        let path = PathBuf::from(path);
        blocking_fs_op("recursiveRemove", move || fsops::recursive_remove(&path)).await
    }

    async fn recursive_copy(
        &self,
        src: &str,
        dest: &str,
        ignore: Option<&str>,
    ) -> Result<(), HostError> {
        let src = PathBuf::from(src);
        let dest = PathBuf::from(dest);
        let ignore = ignore.map(str::to_owned);
        blocking_fs_op("recursiveCopy", move || {
            fsops::recursive_copy(&src, &dest, ignore.as_deref())
        })
        .await
    }

    async fn append_to_file(&self, path: &str, data: &str) -> Result<(), HostError> {
        let path = PathBuf::from(path);
        let data = data.to_owned();
        blocking_fs_op("appendToFile", move || {
            fsops::append_to_file(&path, &data)
        })
        .await
    }

    async fn make_directory(&self, path: &str) -> Result<(), HostError> {
        let path = PathBuf::from(path);
        blocking_fs_op("makeDirectory", move || fsops::make_dirs(&path)).await
    }

    async fn utime(&self, path: &str, atime: i64, mtime: i64) -> Result<(), HostError> {
        let path = PathBuf::from(path);
        blocking_fs_op("utime", move || {
            fsops::set_file_times(&path, atime, mtime)
        })
        .await
    }

    async fn upload_file(&self, src: &Utf8Path, dest: &str) -> Result<(), HostError> {
        copy_chunked("uploadFile", src.as_std_path(), Path::new(dest)).await
    }

    async fn download_file(&self, src: &str, dest: &Utf8Path) -> Result<(), HostError> {
        copy_chunked("downloadFile", Path::new(src), dest.as_std_path()).await
    }

    async fn prepare_process(
        &self,
        name: &str,
        cmdline: CommandLine,
        options: ProcessOptions,
    ) -> Result<(Arc<dyn ControlledProcess>, Completion), HostError> {
        let cwd = options
            .cwd
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| self.tmp_dir());
        let spec = ProcessSpec::new(name, cmdline, cwd, options.output)?;
        let (process, completion) = LocalProcess::new(spec);

        // Every stream event is appended to this host's event log under the
        // process name, synchronously with emission.
        let handle = self.handle.clone();
        let proc_name = name.to_owned();
        process.events().add_observer(move |event| {
            if let Some(data) = event.data() {
                handle.evlog_append(&proc_name, event.channel(), data);
            }
        });

        Ok((
            Arc::new(LocalControlledProcess { process }) as Arc<dyn ControlledProcess>,
            completion,
        ))
    }
}

/// Streams one file into another in fixed-size chunks.
async fn copy_chunked(op: &'static str, src: &Path, dest: &Path) -> Result<(), HostError> {
    let mut input = tokio::fs::File::open(src)
        .await
        .map_err(|err| HostError::new(op, err))?;
    let mut output = tokio::fs::File::create(dest)
        .await
        .map_err(|err| HostError::new(op, err))?;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    loop {
        let n = input
            .read(&mut buf)
            .await
            .map_err(|err| HostError::new(op, err))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buf[..n])
            .await
            .map_err(|err| HostError::new(op, err))?;
    }
    output
        .flush()
        .await
        .map_err(|err| HostError::new(op, err))
}

struct LocalControlledProcess {
    process: Arc<LocalProcess>,
}

#[async_trait]
impl ControlledProcess for LocalControlledProcess {
    fn name(&self) -> String {
        self.process.name()
    }

    fn events(&self) -> &Arc<EventSource> {
        self.process.events()
    }

    async fn add_hook(
        &self,
        matcher: EventMatcher,
        sender: UnboundedSender<ProcessEvent>,
    ) -> Result<HookId, HostError> {
        Ok(self.process.events().add_hook(matcher, sender))
    }

    async fn remove_hook(&self, id: HookId) -> Result<(), HostError> {
        self.process
            .events()
            .remove_hook(id)
            .map_err(|err| HostError::new("removeHook", err))
    }

    async fn add_env(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.process.add_env(key, value).await
    }

    async fn start(&self, use_pty: bool) -> Result<(), HostError> {
        self.process.start(use_pty).await
    }

    async fn write(&self, data: &[u8]) -> Result<(), HostError> {
        self.process.write(data).await;
        Ok(())
    }

    async fn close_stdin(&self) -> Result<(), HostError> {
        self.process.close_stdin().await;
        Ok(())
    }

    fn stop(&self) -> Completion {
        self.process.stop()
    }

    fn completion(&self) -> Completion {
        self.process.completion()
    }
}

/// The implicit root suite: the machine the run was started from. Declared
/// `running` before the first scheduler turn; satisfies `IControlledHost`
/// needs of top-level nodes.
pub struct LocalHostSuite {
    host: Arc<LocalHost>,
}

impl LocalHostSuite {
    /// The host this suite wraps.
    pub fn host(&self) -> Arc<LocalHost> {
        Arc::clone(&self.host)
    }
}

#[async_trait]
impl Suite for LocalHostSuite {
    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == CONTROLLED_HOST).then(|| {
            let host: Arc<dyn ControlledHost> = self.host();
            Arc::new(host) as CapabilityHandle
        })
    }
}

/// Class for [`LocalHostSuite`].
pub struct LocalHostClass;

impl ComponentClass for LocalHostClass {
    fn name(&self) -> &'static str {
        "LocalHost"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Suite
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![CONTROLLED_HOST]
    }

    fn build(&self, cx: BuildContext) -> Result<Component, NodeFailure> {
        Ok(Component::Suite(Arc::new(LocalHostSuite {
            host: LocalHost::new(cx.handle),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Runner, RunnerOpts};

    #[tokio::test]
    async fn temp_dirs_and_ports_vend_monotonically() {
        let guard = camino_tempfile::tempdir().expect("tempdir");
        let runner =
            Runner::new(RunnerOpts::new(guard.path().join("tmp"))).expect("runner builds");
        let host = LocalHost::new(runner.handle());

        let first_dir = host.temp_dir("scratch");
        let second_dir = host.temp_dir("scratch");
        assert!(first_dir.ends_with("scratch-0001"), "{first_dir}");
        assert!(second_dir.ends_with("scratch-0002"), "{second_dir}");

        let first = host.temp_port().await.expect("a free port");
        let second = host.temp_port().await.expect("a free port");
        assert!(second > first, "ports vend monotonically");

        // If the next candidate can be occupied, the probe skips it.
        if let Ok(_occupied) = TcpListener::bind(("127.0.0.1", second + 1)) {
            let third = host.temp_port().await.expect("a free port");
            assert!(third > second + 1, "occupied candidate is skipped");
        }
    }
}
