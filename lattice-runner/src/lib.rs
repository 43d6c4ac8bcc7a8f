// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core runtime for lattice, a component-based test harness for
//! distributed systems.
//!
//! A run is not a flat list of test functions but a directed graph of
//! interdependent components: long-lived suites (services, databases, ssh
//! connections, temporary directories) brought up and torn down in
//! dependency order, and short-lived tests that execute once a slice of
//! that graph is up. The scheduler in [`runner`] decides, each turn, which
//! nodes may start, which may be torn down, and which must be aborted.
//!
//! The other load-bearing pieces: the capability-typed test-graph model
//! ([`graph`], [`component`]), the event bus ([`events`]), the process
//! supervisor ([`process`]), the controlled-host abstraction ([`host`])
//! with a local and an SSH-backed implementation, the line-oriented remote
//! helper protocol ([`protocol`]) and its helper-side program ([`helper`]),
//! and the event-log multiplexer ([`logmux`]).

pub mod basics;
pub mod checks;
pub mod component;
pub mod errors;
pub mod events;
pub mod graph;
pub mod helper;
pub mod host;
pub mod logmux;
pub mod process;
pub mod protocol;
pub mod reporter;
pub mod runner;
