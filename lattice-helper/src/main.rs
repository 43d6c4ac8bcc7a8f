// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The helper program executed on the remote side of an SSH session.
//!
//! With no arguments it speaks the line protocol on standard input and
//! output (so diagnostics go to standard error). With `--probe-port PORT`
//! it instead reports, via its exit status, whether the port is free to
//! bind on this machine; the runtime uses this to vend temp ports that
//! are actually free on the remote side.

use std::io;

fn main() -> io::Result<()> {
    let mut args = std::env::args().skip(1);
    if let Some(flag) = args.next() {
        match flag.as_str() {
            "--probe-port" => {
                let Some(port) = args.next().and_then(|arg| arg.parse::<u16>().ok()) else {
                    eprintln!("usage: lattice-helper --probe-port PORT");
                    std::process::exit(2);
                };
                match std::net::TcpListener::bind(("127.0.0.1", port)) {
                    Ok(_) => return Ok(()),
                    Err(_) => std::process::exit(1),
                }
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }

    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(lattice_runner::helper::run_stdio())
}
