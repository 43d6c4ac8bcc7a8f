// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the lattice runtime.

use camino::Utf8PathBuf;
use std::fmt;
use thiserror::Error;

/// The reason a node ended in something other than plain success.
///
/// Every failure a test body, a suite lifecycle method or the scheduler can
/// produce is one of these variants; the scheduler classifies terminal
/// outcomes from them.
#[derive(Debug, Error)]
pub enum NodeFailure {
    /// An assertion or explicitly declared failure inside a test body.
    #[error("{msg}")]
    Failure {
        /// Short, single-line message.
        msg: String,
        /// Longer detail, e.g. a diff for multi-line string comparisons.
        details: String,
    },

    /// The node opted out of running. Not counted as a failure.
    #[error("skipped: {reason}")]
    Skipped {
        /// Why the node was skipped.
        reason: String,
    },

    /// A need could not be satisfied, usually because the providing suite
    /// failed or was never supplied.
    #[error("unable to run: dependency `{missing}` is not available")]
    UnableToRun {
        /// The binding or node name that was unavailable.
        missing: String,
    },

    /// A timeout wrapper elapsed before the wrapped operation completed.
    #[error("timed out: {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
    },

    /// A static problem with the test definition.
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// An assertion collector gathered more than one sub-failure.
    #[error("{0}")]
    Collection(FailureCollection),

    /// A controlled-host operation failed.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The node was aborted because of a failure elsewhere in the graph.
    #[error("aborted: {cause}")]
    Aborted {
        /// Name of the node whose failure caused the abort.
        cause: String,
    },

    /// An internal invariant was broken.
    #[error("harness error: {0}")]
    Harness(String),
}

impl NodeFailure {
    /// Constructs a plain test failure with no extra detail.
    pub fn failure(msg: impl Into<String>) -> Self {
        NodeFailure::Failure {
            msg: msg.into(),
            details: String::new(),
        }
    }

    /// Constructs a skip marker.
    pub fn skipped(reason: impl Into<String>) -> Self {
        NodeFailure::Skipped {
            reason: reason.into(),
        }
    }

    /// Returns the longer detail text attached to this failure, if any.
    pub fn details(&self) -> Option<&str> {
        match self {
            NodeFailure::Failure { details, .. } if !details.is_empty() => Some(details),
            _ => None,
        }
    }
}

/// A static problem with a test definition: something that can be determined
/// to be wrong without running any node.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// A node references a `uses`, `depends` or `onlyAfter` target that is
    /// not part of the definition.
    #[error("unable to find dependency `{target}` of node `{node}`")]
    UnknownReference {
        /// The node whose definition is broken.
        node: String,
        /// The missing target name.
        target: String,
    },

    /// Two nodes with the same (fully qualified) name.
    #[error("duplicate node name `{0}`")]
    DuplicateName(String),

    /// The `uses` list is longer than the class's declared needs.
    #[error(
        "class `{class}` has {expected} needs, but {actual} were supplied for `{node}`"
    )]
    NeedCountMismatch {
        /// Class name.
        class: String,
        /// The node being defined.
        node: String,
        /// Declared need count.
        expected: usize,
        /// Supplied uses count.
        actual: usize,
    },

    /// None of the disjunctive need alternatives matched the supplied uses
    /// list.
    #[error(
        "class `{class}` offers {alternatives} dependency sets, but none of them matched `{node}`"
    )]
    NoMatchingNeeds {
        /// Class name.
        class: String,
        /// The node being defined.
        node: String,
        /// Number of declared alternatives.
        alternatives: usize,
    },

    /// More than one disjunctive need alternative matched.
    #[error(
        "class `{class}` offers {alternatives} dependency sets and {matched} of them matched `{node}`"
    )]
    AmbiguousNeeds {
        /// Class name.
        class: String,
        /// The node being defined.
        node: String,
        /// Number of declared alternatives.
        alternatives: usize,
        /// Number that matched.
        matched: usize,
    },

    /// A supplied node does not implement the capability a need requires.
    #[error("node `{provider}` does not implement `{capability}` required by `{node}`")]
    CapabilityNotImplemented {
        /// The node being defined.
        node: String,
        /// The supplied provider.
        provider: String,
        /// The required capability name.
        capability: &'static str,
    },

    /// The argument tuple does not match the class's declared arity.
    #[error(
        "class `{class}` takes {expected} arguments, but {actual} were specified for `{node}`"
    )]
    ArgCountMismatch {
        /// Class name.
        class: String,
        /// The node being defined.
        node: String,
        /// Declared argument count.
        expected: usize,
        /// Supplied argument count.
        actual: usize,
    },
}

/// Multiple sub-failures gathered by an assertion collector.
#[derive(Debug)]
pub struct FailureCollection {
    /// Short description given to the collector.
    pub short_desc: String,
    /// The gathered failures, in the order they were recorded.
    pub failures: Vec<NodeFailure>,
}

impl fmt::Display for FailureCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} errors)", self.short_desc, self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

/// An error from a controlled-host operation, local or remote.
///
/// Carries the operation name and the underlying message; callers decide
/// whether to treat it as fatal.
#[derive(Debug, Error)]
#[error("host operation `{op}` failed: {message}")]
pub struct HostError {
    /// The operation that failed, e.g. `recursiveCopy`.
    pub op: &'static str,
    /// The underlying error message.
    pub message: String,
}

impl HostError {
    /// Wraps an underlying error under the given operation name.
    pub fn new(op: &'static str, err: impl fmt::Display) -> Self {
        Self {
            op,
            message: err.to_string(),
        }
    }
}

/// An error in the harness itself, as opposed to a failure of a node under
/// test. Surfaced through the reporter's `harness_failure` callback and
/// stops the run.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The temporary directory passed to the runner already exists.
    #[error("temporary directory `{0}` already exists")]
    TmpDirExists(Utf8PathBuf),

    /// The report directory passed to the runner already exists.
    #[error("report directory `{0}` already exists")]
    ReportDirExists(Utf8PathBuf),

    /// Creating the run directories or log files failed.
    #[error("failed to set up the run directory: {0}")]
    Setup(#[source] std::io::Error),

    /// The test definition is statically broken.
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// An internal invariant was broken.
    #[error("internal error: {0}")]
    Internal(String),
}
