// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Assertion helpers for test bodies.
//!
//! These return `Result<(), NodeFailure>` rather than panicking, so test
//! bodies can propagate them with `?` or gather several of them in a
//! [`Checks`] collector and raise a single combined failure.

use crate::errors::{FailureCollection, NodeFailure};
use similar::TextDiff;
use std::fmt::Debug;

/// Compares two values and fails with `errmsg` if they differ.
///
/// For multi-line strings the failure detail is a unified diff; for
/// everything else it is the two debug representations.
pub fn assert_equal<T: PartialEq + Debug>(
    a: &T,
    b: &T,
    errmsg: &str,
) -> Result<(), NodeFailure> {
    if a == b {
        return Ok(());
    }
    let left = format!("{a:?}");
    let right = format!("{b:?}");
    Err(NodeFailure::Failure {
        msg: errmsg.to_owned(),
        details: format!("{left} != {right}"),
    })
}

/// Compares two strings, attaching a unified diff as detail when either side
/// spans multiple lines.
pub fn assert_equal_str(a: &str, b: &str, errmsg: &str) -> Result<(), NodeFailure> {
    assert_equal_str_described(a, b, errmsg, None, None)
}

/// Like [`assert_equal_str`], with optional descriptions for the two sides
/// used as diff headers.
pub fn assert_equal_str_described(
    a: &str,
    b: &str,
    errmsg: &str,
    left_desc: Option<&str>,
    right_desc: Option<&str>,
) -> Result<(), NodeFailure> {
    if a == b {
        return Ok(());
    }
    let details = if a.contains('\n') || b.contains('\n') {
        let diff = TextDiff::from_lines(a, b);
        diff.unified_diff()
            .header(left_desc.unwrap_or("left"), right_desc.unwrap_or("right"))
            .to_string()
    } else {
        format!("{a:?} != {b:?}")
    };
    Err(NodeFailure::Failure {
        msg: errmsg.to_owned(),
        details,
    })
}

/// Fails with `errmsg` if the two values are equal.
pub fn assert_not_equal<T: PartialEq + Debug>(
    a: &T,
    b: &T,
    errmsg: &str,
) -> Result<(), NodeFailure> {
    if a != b {
        return Ok(());
    }
    Err(NodeFailure::Failure {
        msg: errmsg.to_owned(),
        details: format!("{a:?} == {b:?}"),
    })
}

/// Checks a process exit code against an expectation.
pub fn expect_exit_code(exit_code: i32, expected: i32, desc: &str) -> Result<(), NodeFailure> {
    assert_equal(
        &exit_code,
        &expected,
        &format!("process {desc} terminated with exit code {exit_code}, expected {expected}"),
    )
}

/// Gathers several assertion results and raises them as one failure.
///
/// Zero recorded failures check out clean; a single failure is re-raised as
/// itself; several become a [`FailureCollection`].
pub struct Checks {
    short_desc: String,
    failures: Vec<NodeFailure>,
}

impl Checks {
    /// Creates a collector with a short description used when several
    /// failures are combined.
    pub fn new(short_desc: impl Into<String>) -> Self {
        Self {
            short_desc: short_desc.into(),
            failures: Vec::new(),
        }
    }

    /// Records the result of one assertion.
    pub fn record(&mut self, result: Result<(), NodeFailure>) {
        if let Err(failure) = result {
            self.failures.push(failure);
        }
    }

    /// Returns the number of failures recorded so far.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Raises the gathered failures, if any.
    pub fn check(mut self) -> Result<(), NodeFailure> {
        match self.failures.len() {
            0 => Ok(()),
            1 => Err(self.failures.remove(0)),
            _ => Err(NodeFailure::Collection(FailureCollection {
                short_desc: self.short_desc,
                failures: self.failures,
            })),
        }
    }
}
