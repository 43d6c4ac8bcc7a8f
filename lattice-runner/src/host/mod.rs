// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controlled-host abstraction.
//!
//! A controlled host is a machine, local or remote, on which the runtime
//! performs filesystem operations and launches supervised processes through
//! one uniform capability surface. [`local::LocalHost`] implements it
//! directly; [`remote::RemoteSession`] implements it over the helper
//! protocol of [`crate::protocol`].

pub(crate) mod fsops;
pub mod local;
pub mod remote;

use crate::{
    errors::HostError,
    events::{EventMatcher, EventSource, HookId, ProcessEvent},
    graph::Capability,
    process::{CommandLine, Completion, OutputMode},
};
use async_trait::async_trait;
use camino::Utf8Path;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

/// The capability every controlled host declares.
pub const CONTROLLED_HOST: Capability = Capability::new("IControlledHost");

/// The capability declared by directory suites (see [`crate::basics`]).
pub const DIRECTORY: Capability = Capability::new("IDirectory");

/// File transfers move data in chunks of this size.
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// Entry kind in a recursive listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// A regular file (or anything that is not a directory).
    File,
    /// A directory.
    Dir,
}

/// One entry of a recursive listing: kind, path relative to the listed
/// root (no leading separator), and the three stat times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    /// File or directory.
    pub kind: FileKind,
    /// Relative path.
    pub path: String,
    /// Access time, seconds since epoch.
    pub atime: i64,
    /// Modification time, seconds since epoch.
    pub mtime: i64,
    /// Change time, seconds since epoch.
    pub ctime: i64,
}

/// Options for preparing a process on a host.
#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    /// Working directory; defaults to the host's per-run working directory.
    pub cwd: Option<String>,
    /// Output framing.
    pub output: OutputMode,
}

/// A process prepared on a controlled host, local or remote.
#[async_trait]
pub trait ControlledProcess: Send + Sync {
    /// The name the process's output is attributed to.
    fn name(&self) -> String;

    /// The local event source this process emits on.
    fn events(&self) -> &Arc<EventSource>;

    /// Installs a hook. On remote processes this also installs the pattern
    /// on the helper side, so patterns there are regular expressions.
    async fn add_hook(
        &self,
        matcher: EventMatcher,
        sender: UnboundedSender<ProcessEvent>,
    ) -> Result<HookId, HostError>;

    /// Removes a hook. Late matches for already-removed hooks may still be
    /// delivered and are dropped.
    async fn remove_hook(&self, id: HookId) -> Result<(), HostError>;

    /// Adds an environment variable; only valid before start.
    async fn add_env(&self, key: &str, value: &str) -> Result<(), HostError>;

    /// Starts the process.
    async fn start(&self, use_pty: bool) -> Result<(), HostError>;

    /// Writes to standard input. Writes to a terminated process are
    /// silently dropped.
    async fn write(&self, data: &[u8]) -> Result<(), HostError>;

    /// Closes standard input.
    async fn close_stdin(&self) -> Result<(), HostError>;

    /// Begins orderly termination and returns the completion signal.
    fn stop(&self) -> Completion;

    /// The completion signal.
    fn completion(&self) -> Completion;
}

/// The uniform capability surface of a controlled host.
#[async_trait]
pub trait ControlledHost: Send + Sync {
    /// Stable identifier, used to tag log records.
    fn host_name(&self) -> String;

    /// An absolute path unique within this host's working directory for
    /// this run. The directory is not created.
    fn temp_dir(&self, desc: &str) -> String;

    /// A free TCP port, vended monotonically from 32768. Candidates that
    /// fail the host's freedom probe are skipped.
    async fn temp_port(&self) -> Result<u16, HostError>;

    /// Joins path parts with the host's native separator.
    fn join_path(&self, parts: &[&str]) -> String;

    /// Recursively lists a directory.
    async fn recursive_list(&self, root: &str) -> Result<Vec<ListEntry>, HostError>;

    /// Idempotently removes a file or tree.
    async fn recursive_remove(&self, path: &str) -> Result<(), HostError>;

    /// Copies a file or tree; `ignore` is a semicolon-joined list of name
    /// globs to omit.
    async fn recursive_copy(
        &self,
        src: &str,
        dest: &str,
        ignore: Option<&str>,
    ) -> Result<(), HostError>;

    /// Appends data to a file.
    async fn append_to_file(&self, path: &str, data: &str) -> Result<(), HostError>;

    /// Creates a directory and any missing parents.
    async fn make_directory(&self, path: &str) -> Result<(), HostError>;

    /// Adjusts a file's access and modification times.
    async fn utime(&self, path: &str, atime: i64, mtime: i64) -> Result<(), HostError>;

    /// Uploads a local file to the host, in 64 KiB chunks.
    async fn upload_file(&self, src: &Utf8Path, dest: &str) -> Result<(), HostError>;

    /// Downloads a file from the host, in 64 KiB chunks.
    async fn download_file(&self, src: &str, dest: &Utf8Path) -> Result<(), HostError>;

    /// Prepares a process. The completion signal fires once the process
    /// has terminated.
    async fn prepare_process(
        &self,
        name: &str,
        cmdline: CommandLine,
        options: ProcessOptions,
    ) -> Result<(Arc<dyn ControlledProcess>, Completion), HostError>;
}

/// Installs a hook on a controlled process, waits for the first match, then
/// removes the hook again.
pub async fn wait_for_process(
    process: &dyn ControlledProcess,
    matcher: EventMatcher,
) -> Result<ProcessEvent, HostError> {
    let (tx, mut rx) = unbounded_channel();
    let id = process.add_hook(matcher, tx).await?;
    let event = rx.recv().await;
    let _ = process.remove_hook(id).await;
    event.ok_or_else(|| HostError::new("waitFor", "event source closed"))
}
