// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unix plumbing for the process supervisor: signals and ptys.

use std::{
    io,
    os::fd::{FromRawFd, OwnedFd},
};

pub(crate) const SIGINT: libc::c_int = libc::SIGINT;
pub(crate) const SIGTERM: libc::c_int = libc::SIGTERM;
pub(crate) const SIGKILL: libc::c_int = libc::SIGKILL;

/// Sends a signal to a process. Failures (typically ESRCH from a race with
/// natural exit) are ignored.
pub(crate) fn send_signal(pid: i32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid, signal);
    }
}

/// Allocates a pty pair, returning `(master, slave)`.
pub(crate) fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // openpty returned 0, so both descriptors are live and owned by us.
    unsafe { Ok((OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))) }
}
