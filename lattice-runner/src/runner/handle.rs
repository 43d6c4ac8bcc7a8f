// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The borrowed handle components get into the runner.

use super::internal_events::SchedulerEvent;
use crate::logmux::EventLogSink;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// The run's configuration mapping.
pub type RunConfig = IndexMap<String, serde_json::Value>;

/// Mutable tables shared between the runner and component tasks. The
/// runner owns one of these per run; there is no process-wide state.
pub(crate) struct RunnerShared {
    pub(crate) tmp_dir: Utf8PathBuf,
    pub(crate) config: Mutex<RunConfig>,
    pub(crate) evlog: Mutex<Option<EventLogSink>>,
    pub(crate) host_logs: Mutex<IndexMap<String, Utf8PathBuf>>,
}

/// A clonable handle components use to reach the runner: logging, the
/// per-run working directory, configuration lookups, and the event log.
#[derive(Clone)]
pub struct RunnerHandle {
    pub(crate) tx: UnboundedSender<SchedulerEvent>,
    pub(crate) shared: Arc<RunnerShared>,
}

impl RunnerHandle {
    /// Reports a line through the reporter, serialized with scheduler
    /// state changes.
    pub fn log(&self, msg: impl Into<String>) {
        let _ = self.tx.send(SchedulerEvent::Log(msg.into()));
    }

    /// The run's temporary working directory (exists for the whole run).
    pub fn tmp_dir(&self) -> &Utf8Path {
        &self.shared.tmp_dir
    }

    /// Looks up a value in the run's config mapping.
    pub fn config(&self, name: &str) -> Option<serde_json::Value> {
        self.shared
            .config
            .lock()
            .expect("config lock poisoned")
            .get(name)
            .cloned()
    }

    /// Appends a record to the local host's event log, mirroring the raw
    /// payload into the report directory.
    pub fn evlog_append(&self, source: &str, channel: &str, data: &str) {
        let mut sink = self.shared.evlog.lock().expect("event log lock poisoned");
        if let Some(sink) = sink.as_mut() {
            sink.append(source, channel, data);
        }
    }

    /// Registers a downloaded per-host event log for the final merge.
    pub fn register_host_log(&self, source: &str, path: Utf8PathBuf) {
        self.shared
            .host_logs
            .lock()
            .expect("host log lock poisoned")
            .insert(source.to_owned(), path);
    }
}
