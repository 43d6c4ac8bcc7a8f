// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The line-oriented remote helper protocol.
//!
//! One request or reply per line: `COMMAND JOBID ARG1 ARG2 …\n`, where each
//! argument is the repr of a string or a number. A single grammar parses
//! both directions; [`args`] implements the grammar, [`wire`] the typed
//! request and reply sets on top of it.

pub mod args;
pub mod wire;

pub use args::{ParseError, Parsed, Value, parse_args, render_args};
pub use wire::{JobId, Reply, Request, StreamKind, WireError};
