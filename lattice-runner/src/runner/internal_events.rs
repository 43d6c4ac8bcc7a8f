// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events flowing back into the scheduler loop from in-flight operations.

use crate::{errors::NodeFailure, graph::NestedDef};

/// An event on the scheduler's loop channel. Every in-flight start or
/// teardown sends exactly one of these when it completes; log lines from
/// components ride the same channel so they serialize with state changes.
pub(crate) enum SchedulerEvent {
    /// A start operation (suite setUp or test body) finished.
    StartFinished {
        /// The node.
        name: String,
        /// What happened.
        result: StartResult,
    },

    /// A suite tearDown finished.
    TeardownFinished {
        /// The node.
        name: String,
        /// `Err` carries the tearDown failure; the suite still ends up
        /// `done`.
        result: Result<(), NodeFailure>,
    },

    /// A log line from a component.
    Log(String),
}

/// Outcome of a start operation.
pub(crate) enum StartResult {
    /// Suite setUp succeeded, possibly publishing a nested definition to
    /// splice before the suite is marked running.
    SuiteUp {
        /// The nested definition, if any.
        nested: Option<NestedDef>,
    },

    /// Suite setUp failed, timed out or was aborted.
    SuiteFailed(NodeFailure),

    /// A test body finished (either way).
    TestFinished(Result<(), NodeFailure>),
}
