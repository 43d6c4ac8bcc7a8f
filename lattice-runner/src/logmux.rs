// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event-log records and the timestamped merge of per-host logs.
//!
//! During a run every host appends records to its own
//! `<host>-event.log` under the tmp directory; at the end the files are
//! merged into `<reportDir>/event.log` in non-decreasing timestamp order,
//! and non-local records additionally stream their decoded payloads into
//! per-source channel files.

use crate::protocol::{Value, parse_args};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader, Lines, Write},
};
use tracing::warn;

/// One event-log record: `timestamp:source:channel:repr(payload)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventLogRecord {
    /// Seconds since epoch.
    pub timestamp: i64,
    /// The node name the record belongs to (`localhost` for host-local
    /// records).
    pub source: String,
    /// One of `out`, `err`, `info`.
    pub channel: String,
    /// The raw payload field, still in its repr form.
    pub payload: String,
}

impl EventLogRecord {
    /// Renders the record as one log line, newline included.
    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}:{}\n",
            self.timestamp, self.source, self.channel, self.payload
        )
    }

    /// Parses one log line. The payload keeps its repr form; decode it
    /// with [`EventLogRecord::decoded_payload`] when needed.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let mut parts = line.splitn(4, ':');
        let timestamp = parts.next()?.parse::<i64>().ok()?;
        let source = parts.next()?.to_owned();
        let channel = parts.next()?.to_owned();
        let payload = parts.next()?.to_owned();
        Some(Self {
            timestamp,
            source,
            channel,
            payload,
        })
    }

    /// Decodes the repr payload back into the raw string it carries.
    pub fn decoded_payload(&self) -> Option<String> {
        let parsed = parse_args(&self.payload);
        match parsed.values.as_slice() {
            [Value::Str(s)] => Some(s.clone()),
            _ => None,
        }
    }
}

/// Appends records for the local host and mirrors local stream payloads
/// into per-source report files as the run progresses.
pub(crate) struct EventLogSink {
    log: File,
    report_dir: Option<Utf8PathBuf>,
    report_files: HashMap<String, File>,
}

impl EventLogSink {
    /// Opens `<tmp_dir>/localhost-event.log` for appending.
    pub(crate) fn new(tmp_dir: &Utf8Path, report_dir: Option<Utf8PathBuf>) -> io::Result<Self> {
        let log = File::create(local_log_path(tmp_dir).as_std_path())?;
        Ok(Self {
            log,
            report_dir,
            report_files: HashMap::new(),
        })
    }

    /// Appends one record, stamped now.
    pub(crate) fn append(&mut self, source: &str, channel: &str, data: &str) {
        let record = EventLogRecord {
            timestamp: chrono::Utc::now().timestamp(),
            source: source.to_owned(),
            channel: channel.to_owned(),
            payload: Value::str(data.to_owned()).to_string(),
        };
        if self.log.write_all(record.render().as_bytes()).is_err() {
            warn!(source, "unable to write to the event log");
        }

        // Local records stream their raw payload into the report directory
        // right away; no timestamps in these files.
        if let Some(report_dir) = self.report_dir.clone() {
            let filename = format!("{source}.{channel}");
            let file = match self.report_files.entry(filename.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    match File::create(report_dir.join(&filename).as_std_path()) {
                        Ok(file) => entry.insert(file),
                        Err(err) => {
                            warn!(source, %err, "unable to open report output file");
                            return;
                        }
                    }
                }
            };
            if file.write_all(data.as_bytes()).is_err() {
                warn!(source, "unable to write to the report outputs");
            }
        }
    }
}

/// Path of the local host's event log within the run's tmp directory.
pub(crate) fn local_log_path(tmp_dir: &Utf8Path) -> Utf8PathBuf {
    tmp_dir.join("localhost-event.log")
}

struct LogCursor {
    host: String,
    lines: Lines<BufReader<File>>,
    head: EventLogRecord,
}

impl LogCursor {
    fn advance(&mut self) -> Option<EventLogRecord> {
        for line in self.lines.by_ref() {
            let Ok(line) = line else { return None };
            if let Some(record) = EventLogRecord::parse(&line) {
                return Some(record);
            }
        }
        None
    }
}

/// Merges the per-host event logs into `<report_dir>/event.log`, in
/// non-decreasing timestamp order (stable across hosts for equal stamps).
/// Records from non-local hosts additionally append their decoded payload
/// to `<source>.<channel>` files in the report directory.
pub(crate) fn merge_logs(
    host_logs: &IndexMap<String, Utf8PathBuf>,
    report_dir: &Utf8Path,
) -> io::Result<()> {
    let mut cursors = Vec::new();
    for (host, path) in host_logs {
        let file = match File::open(path.as_std_path()) {
            Ok(file) => file,
            Err(err) => {
                warn!(host = host.as_str(), %err, "skipping unreadable host log");
                continue;
            }
        };
        let mut cursor = LogCursor {
            host: host.clone(),
            lines: BufReader::new(file).lines(),
            head: EventLogRecord {
                timestamp: 0,
                source: String::new(),
                channel: String::new(),
                payload: String::new(),
            },
        };
        match cursor.advance() {
            Some(record) => {
                cursor.head = record;
                cursors.push(cursor);
            }
            None => {}
        }
    }

    let mut merged = File::create(report_dir.join("event.log").as_std_path())?;
    while !cursors.is_empty() {
        let next = cursors
            .iter()
            .enumerate()
            .min_by_key(|(index, cursor)| (cursor.head.timestamp, *index))
            .map(|(index, _)| index)
            .expect("cursors is non-empty");

        let host = cursors[next].host.clone();
        let record = cursors[next].head.clone();
        writeln!(
            merged,
            "{}\t{}\t{}\t{}\t{}",
            record.timestamp, host, record.source, record.channel, record.payload
        )?;

        if host != "localhost" {
            if let Some(decoded) = record.decoded_payload() {
                let filename = format!("{}.{}", record.source, record.channel);
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(report_dir.join(&filename).as_std_path())?;
                file.write_all(decoded.as_bytes())?;
            }
        }

        match cursors[next].advance() {
            Some(record) => cursors[next].head = record,
            None => {
                cursors.remove(next);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_round_trips() {
        let record = EventLogRecord {
            timestamp: 1_700_000_000,
            source: "node.proc".to_owned(),
            channel: "out".to_owned(),
            payload: Value::str("a line\n").to_string(),
        };
        let line = record.render();
        let parsed = EventLogRecord::parse(&line).expect("parses");
        assert_eq!(parsed, record);
        assert_eq!(parsed.decoded_payload().as_deref(), Some("a line\n"));
    }

    #[test]
    fn parse_keeps_colons_in_payload() {
        let record =
            EventLogRecord::parse("17:src:out:'12:30: lunch'\n").expect("parses");
        assert_eq!(record.payload, "'12:30: lunch'");
        assert_eq!(record.decoded_payload().as_deref(), Some("12:30: lunch"));
    }

    #[test]
    fn merge_orders_by_timestamp_across_hosts() {
        let dir = tempdir().expect("tempdir");
        let report = dir.path().join("report");
        std::fs::create_dir(&report).unwrap();

        let local = dir.path().join("localhost-event.log");
        std::fs::write(&local, "10:localhost:out:'a'\n30:localhost:out:'c'\n").unwrap();
        let remote = dir.path().join("box1-event.log");
        std::fs::write(&remote, "20:node.srv:out:'b1\\n'\n40:node.srv:err:'b2\\n'\n").unwrap();

        let mut logs = IndexMap::new();
        logs.insert("localhost".to_owned(), local);
        logs.insert("box1".to_owned(), remote);
        merge_logs(&logs, &report).unwrap();

        let merged = std::fs::read_to_string(report.join("event.log")).unwrap();
        let timestamps: Vec<&str> = merged
            .lines()
            .map(|l| l.split('\t').next().unwrap())
            .collect();
        assert_eq!(timestamps, vec!["10", "20", "30", "40"]);

        // Non-local payloads were decoded into per-source channel files.
        assert_eq!(
            std::fs::read_to_string(report.join("node.srv.out")).unwrap(),
            "b1\n"
        );
        assert_eq!(
            std::fs::read_to_string(report.join("node.srv.err")).unwrap(),
            "b2\n"
        );
    }
}
