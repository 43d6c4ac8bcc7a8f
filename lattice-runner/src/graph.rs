// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test-graph data model: capabilities, node definitions and statuses.
//!
//! A test definition maps local names to node definitions; the runner
//! builds three edge sets over the same node set from it (needs, ordering,
//! onlyAfter) and drives every node through the status machine below.

use crate::{component::ComponentClass, protocol::Value};
use indexmap::IndexMap;
use std::{fmt, sync::Arc};

/// A named interface a suite class can declare and a need can require.
///
/// Matching is by name identity, not structure: a need is satisfied only by
/// a node whose class declares the identical capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Capability {
    name: &'static str,
}

impl Capability {
    /// Declares a capability.
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// The capability's name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Whether a node is a one-shot test or a long-lived suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs once, produces a pass/fail.
    Test,
    /// setUp → live → tearDown; exposes capabilities while running.
    Suite,
}

/// A node's position in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Not yet eligible to start.
    Waiting,
    /// Being materialized; setUp (or the test body) is about to run or
    /// running.
    Starting,
    /// A suite that is up, or a test whose body is executing.
    Running,
    /// A suite in tearDown.
    Stopping,
    /// Terminal: the node completed (possibly with a recorded failure).
    Done,
    /// Terminal: a suite whose setUp failed.
    Failed,
}

impl NodeStatus {
    /// Human-readable form.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Waiting => "waiting",
            NodeStatus::Starting => "starting",
            NodeStatus::Running => "running",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Done => "done",
            NodeStatus::Failed => "failed",
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Failed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A test definition: local name → node definition, in author order.
pub type TestDef = IndexMap<String, NodeDef>;

/// One node of a test definition.
#[derive(Clone)]
pub struct NodeDef {
    /// The class to instantiate.
    pub class: Arc<dyn ComponentClass>,
    /// Capability-typed dependencies, by node name.
    pub uses: Vec<String>,
    /// Ordering-only dependencies, by node name.
    pub depends: Vec<String>,
    /// Weak edges: this node starts only after these have terminated.
    pub only_after: Vec<String>,
    /// Positional constructor arguments.
    pub args: Vec<Value>,
    /// The node is expected to fail.
    pub xfail: bool,
    /// The node is skipped without running.
    pub skip: bool,
}

impl NodeDef {
    /// A definition with no dependencies, arguments or flags.
    pub fn new(class: Arc<dyn ComponentClass>) -> Self {
        Self {
            class,
            uses: Vec::new(),
            depends: Vec::new(),
            only_after: Vec::new(),
            args: Vec::new(),
            xfail: false,
            skip: false,
        }
    }

    /// Sets the uses list.
    pub fn uses<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uses = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the ordering-only dependency list.
    pub fn depends<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the onlyAfter list.
    pub fn only_after<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_after = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the positional arguments.
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.args = args.into_iter().collect();
        self
    }

    /// Marks the node as an expected failure.
    pub fn xfail(mut self) -> Self {
        self.xfail = true;
        self
    }

    /// Marks the node as skipped.
    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }
}

impl fmt::Debug for NodeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDef")
            .field("class", &self.class.name())
            .field("uses", &self.uses)
            .field("depends", &self.depends)
            .field("only_after", &self.only_after)
            .field("args", &self.args)
            .field("xfail", &self.xfail)
            .field("skip", &self.skip)
            .finish()
    }
}

/// A nested test definition published by a suite's setUp, together with the
/// names of its leaf nodes. The scheduler splices it under the parent's
/// name atomically, before the parent is marked running.
#[derive(Clone, Debug)]
pub struct NestedDef {
    /// The nested definition; names are local and get prefixed with
    /// `parent.`.
    pub def: TestDef,
    /// Local names of the leaf nodes; external dependents of the parent
    /// come to depend on these too.
    pub leaves: Vec<String>,
}
