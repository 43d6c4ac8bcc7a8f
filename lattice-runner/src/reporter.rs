// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reporter interface: the event stream the scheduler produces.
//!
//! Concrete renderers (stream, TAP, curses) live outside this crate; the
//! scheduler guarantees that `begin` precedes any other call, `end`
//! terminates the stream, and every suite/test node sees at most one pair
//! of start/stop calls.

use crate::{
    errors::{HarnessError, NodeFailure},
    graph::{NodeKind, TestDef},
};
use std::{fmt, sync::Arc, time::Duration};

/// Terminal classification of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The test passed.
    Ok,
    /// The test failed.
    Failed,
    /// A timeout wrapper expired.
    Timeout,
    /// The node was skipped (skip flag, or it opted out).
    Skipped,
    /// An expected failure that did fail.
    Xfail,
    /// An expected failure that passed.
    UxOk,
    /// A harness-level error while starting the node.
    Error,
    /// Skipped because an input dependency failed.
    UxSkip,
}

impl Outcome {
    /// The classification string reporters print.
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "OK",
            Outcome::Failed => "FAILED",
            Outcome::Timeout => "TIMEOUT",
            Outcome::Skipped => "SKIPPED",
            Outcome::Xfail => "XFAIL",
            Outcome::UxOk => "UX-OK",
            Outcome::Error => "ERROR",
            Outcome::UxSkip => "UX-SKIP",
        }
    }

    /// Whether this outcome counts as a pass for the run's exit status.
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Ok | Outcome::UxOk | Outcome::Xfail)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters reported at the end of a run. Suites are not counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Number of test nodes.
    pub total: usize,
    /// Tests that passed (including expected failures that passed).
    pub succ: usize,
    /// Tests that were skipped.
    pub skipped: usize,
    /// Expected failures that failed.
    pub xfail: usize,
}

/// One entry of the final error list.
#[derive(Clone, Debug)]
pub struct RunError {
    /// The failing node.
    pub name: String,
    /// Whether it was a test or a suite.
    pub kind: NodeKind,
    /// The recorded failure.
    pub failure: Arc<NodeFailure>,
}

/// Receives scheduler callbacks. All methods default to no-ops so a
/// reporter implements only what it renders.
pub trait Reporter: Send {
    /// The run is starting with this definition.
    fn begin(&mut self, _defs: &TestDef) {}

    /// A suite's setUp is starting.
    fn start_set_up_suite(&mut self, _name: &str) {}

    /// A suite's setUp finished (successfully or not).
    fn stop_set_up_suite(&mut self, _name: &str) {}

    /// A suite's setUp failed.
    fn suite_set_up_failure(&mut self, _name: &str, _error: &NodeFailure) {}

    /// A test body is starting.
    fn start_test(&mut self, _name: &str) {}

    /// A node reached a terminal outcome.
    fn stop_test(&mut self, _name: &str, _outcome: Outcome, _error: Option<&NodeFailure>) {}

    /// A suite's tearDown is starting.
    fn start_tear_down_suite(&mut self, _name: &str) {}

    /// A suite's tearDown finished (successfully or not).
    fn stop_tear_down_suite(&mut self, _name: &str) {}

    /// A suite's tearDown failed.
    fn suite_tear_down_failure(&mut self, _name: &str, _error: &NodeFailure) {}

    /// A free-form log line from the harness or a component.
    fn log(&mut self, _msg: &str) {}

    /// An internal invariant broke; the run stops.
    fn harness_failure(&mut self, _error: &HarnessError) {}

    /// The run finished.
    fn end(&mut self, _duration: Duration, _stats: &RunStats, _errors: &[RunError]) {}
}

/// A reporter that discards everything.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {}
