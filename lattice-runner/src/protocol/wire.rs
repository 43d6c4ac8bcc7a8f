// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed requests and replies on top of the argument grammar.
//!
//! The framing is `COMMAND JOBID ARG*\n` in both directions, with two
//! exceptions on the reply side: `hello` (sent once at helper startup) and
//! `cmd_error` (parser/dispatch complaints) carry no job id. Trailing
//! optional arguments are elided by the sender.

use crate::process::OutputMode;
use crate::protocol::args::{ParseError, Value, parse_args, render_args};
use std::fmt;
use thiserror::Error;

/// A job id, allocated monotonically by the runtime per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which output stream a remote hook applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Out,
    /// Standard error.
    Err,
}

impl StreamKind {
    /// Wire name of the stream.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Out => "out",
            StreamKind::Err => "err",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "out" => Some(StreamKind::Out),
            "err" => Some(StreamKind::Err),
            _ => None,
        }
    }
}

/// A structural problem with a protocol line (as opposed to a recoverable
/// argument-scanning problem, which is a [`ParseError`]).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The command name is not part of the protocol.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// The argument list does not fit the command.
    #[error("command `{cmd}` got an unexpected argument list (argument {index})")]
    BadArguments {
        /// The command.
        cmd: &'static str,
        /// Index of the offending (or missing) argument, counting the job id.
        index: usize,
    },
}

/// A request sent by the runtime to the helper.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Create the working directory, chdir into it, open the event log.
    SetWorkDir {
        /// Job id.
        job: JobId,
        /// Absolute working directory; must not pre-exist.
        path: String,
    },
    /// Recursively list a directory.
    List {
        /// Job id.
        job: JobId,
        /// The directory to list.
        path: String,
    },
    /// Idempotently remove a file or tree.
    Remove {
        /// Job id.
        job: JobId,
        /// The path to remove.
        path: String,
    },
    /// Recursively copy a file or tree.
    Copy {
        /// Job id.
        job: JobId,
        /// Source path.
        src: String,
        /// Destination path.
        dest: String,
        /// Semicolon-joined glob list of names to omit.
        ignore: Option<String>,
    },
    /// Append data to a file.
    Append {
        /// Job id.
        job: JobId,
        /// The file to append to.
        path: String,
        /// The data to append.
        data: String,
    },
    /// Create a directory and its parents.
    MakeDirs {
        /// Job id.
        job: JobId,
        /// The directory to create.
        path: String,
    },
    /// Adjust a file's access and modification times.
    Utime {
        /// Job id.
        job: JobId,
        /// The file to touch.
        path: String,
        /// Access time, seconds since epoch.
        atime: i64,
        /// Modification time, seconds since epoch.
        mtime: i64,
    },
    /// Register a process job. No reply until the process terminates.
    ProcPrepare {
        /// Job id.
        job: JobId,
        /// Output handling on the helper side.
        output_mode: OutputMode,
        /// The argv to run.
        cmdline: Vec<String>,
    },
    /// Set the working directory of a prepared process.
    ProcCwd {
        /// Job id.
        job: JobId,
        /// The working directory.
        cwd: String,
    },
    /// Add an environment variable to a prepared process, with `$NAME` and
    /// `${NAME}` expansion against the current map.
    ProcEnv {
        /// Job id.
        job: JobId,
        /// Variable name.
        name: String,
        /// Variable value, before expansion.
        value: String,
    },
    /// Start a prepared process.
    ProcStart {
        /// Job id.
        job: JobId,
        /// Allocate a pty for the child.
        use_pty: bool,
        /// Run the command through the shell.
        use_shell: bool,
    },
    /// Write to the process's standard input.
    ProcWrite {
        /// Job id.
        job: JobId,
        /// The data to write.
        data: String,
    },
    /// Close the process's standard input.
    ProcCloseStdin {
        /// Job id.
        job: JobId,
    },
    /// Stop a running process.
    ProcStop {
        /// Job id.
        job: JobId,
    },
    /// Install a stream hook; the helper confirms with `hook_added`.
    ProcAddHook {
        /// Job id.
        job: JobId,
        /// The stream the hook applies to.
        stream: StreamKind,
        /// Hook id allocated by the runtime.
        hook_id: u64,
        /// A regular expression, applied per line or per buffer.
        pattern: String,
    },
    /// Remove a stream hook; the helper confirms with `hook_dropped`.
    ProcDropHook {
        /// Job id.
        job: JobId,
        /// The hook to drop.
        hook_id: u64,
    },
    /// Shut the helper down.
    TearDown {
        /// Job id.
        job: JobId,
    },
}

impl Request {
    /// The wire name of this request.
    pub fn command(&self) -> &'static str {
        match self {
            Request::SetWorkDir { .. } => "set_work_dir",
            Request::List { .. } => "list",
            Request::Remove { .. } => "remove",
            Request::Copy { .. } => "copy",
            Request::Append { .. } => "append",
            Request::MakeDirs { .. } => "makedirs",
            Request::Utime { .. } => "utime",
            Request::ProcPrepare { .. } => "proc_prepare",
            Request::ProcCwd { .. } => "proc_cwd",
            Request::ProcEnv { .. } => "proc_env",
            Request::ProcStart { .. } => "proc_start",
            Request::ProcWrite { .. } => "proc_write",
            Request::ProcCloseStdin { .. } => "proc_close_stdin",
            Request::ProcStop { .. } => "proc_stop",
            Request::ProcAddHook { .. } => "proc_add_hook",
            Request::ProcDropHook { .. } => "proc_drop_hook",
            Request::TearDown { .. } => "tear_down",
        }
    }

    /// The job id this request belongs to.
    pub fn job(&self) -> JobId {
        match self {
            Request::SetWorkDir { job, .. }
            | Request::List { job, .. }
            | Request::Remove { job, .. }
            | Request::Copy { job, .. }
            | Request::Append { job, .. }
            | Request::MakeDirs { job, .. }
            | Request::Utime { job, .. }
            | Request::ProcPrepare { job, .. }
            | Request::ProcCwd { job, .. }
            | Request::ProcEnv { job, .. }
            | Request::ProcStart { job, .. }
            | Request::ProcWrite { job, .. }
            | Request::ProcCloseStdin { job }
            | Request::ProcStop { job }
            | Request::ProcAddHook { job, .. }
            | Request::ProcDropHook { job, .. }
            | Request::TearDown { job } => *job,
        }
    }

    /// Renders the request as one protocol line, without the newline.
    pub fn render(&self) -> String {
        let mut values = Vec::new();
        match self {
            Request::SetWorkDir { path, .. }
            | Request::List { path, .. }
            | Request::Remove { path, .. }
            | Request::MakeDirs { path, .. } => {
                values.push(Value::str(path.clone()));
            }
            Request::Copy {
                src, dest, ignore, ..
            } => {
                values.push(Value::str(src.clone()));
                values.push(Value::str(dest.clone()));
                if let Some(ignore) = ignore {
                    values.push(Value::str(ignore.clone()));
                }
            }
            Request::Append { path, data, .. } => {
                values.push(Value::str(path.clone()));
                values.push(Value::str(data.clone()));
            }
            Request::Utime {
                path, atime, mtime, ..
            } => {
                values.push(Value::str(path.clone()));
                values.push(Value::Int(*atime));
                values.push(Value::Int(*mtime));
            }
            Request::ProcPrepare {
                output_mode,
                cmdline,
                ..
            } => {
                values.push(Value::str(output_mode.as_str()));
                values.extend(cmdline.iter().cloned().map(Value::Str));
            }
            Request::ProcCwd { cwd, .. } => {
                values.push(Value::str(cwd.clone()));
            }
            Request::ProcEnv { name, value, .. } => {
                values.push(Value::str(name.clone()));
                values.push(Value::str(value.clone()));
            }
            Request::ProcStart {
                use_pty, use_shell, ..
            } => {
                values.push(Value::Int(i64::from(*use_pty)));
                values.push(Value::Int(i64::from(*use_shell)));
            }
            Request::ProcWrite { data, .. } => {
                values.push(Value::str(data.clone()));
            }
            Request::ProcAddHook {
                stream,
                hook_id,
                pattern,
                ..
            } => {
                values.push(Value::str(stream.as_str()));
                values.push(Value::Int(*hook_id as i64));
                values.push(Value::str(pattern.clone()));
            }
            Request::ProcDropHook { hook_id, .. } => {
                values.push(Value::Int(*hook_id as i64));
            }
            Request::ProcCloseStdin { .. }
            | Request::ProcStop { .. }
            | Request::TearDown { .. } => {}
        }
        if values.is_empty() {
            format!("{} {}", self.command(), self.job())
        } else {
            format!("{} {} {}", self.command(), self.job(), render_args(&values))
        }
    }

    /// Parses one request line. Argument-scanning problems are returned
    /// alongside the request so the dispatcher can report them without
    /// dropping an otherwise intact command.
    pub fn parse(line: &str) -> Result<(Request, Vec<ParseError>), WireError> {
        let (cmd, rest) = split_command(line);
        let parsed = parse_args(rest);
        let mut args = Cursor::new(parsed.values);
        let request = match cmd {
            "set_work_dir" => Request::SetWorkDir {
                job: args.job("set_work_dir")?,
                path: args.string("set_work_dir")?,
            },
            "list" => Request::List {
                job: args.job("list")?,
                path: args.string("list")?,
            },
            "remove" => Request::Remove {
                job: args.job("remove")?,
                path: args.string("remove")?,
            },
            "copy" => Request::Copy {
                job: args.job("copy")?,
                src: args.string("copy")?,
                dest: args.string("copy")?,
                ignore: args.opt_string("copy")?,
            },
            "append" => Request::Append {
                job: args.job("append")?,
                path: args.string("append")?,
                data: args.string("append")?,
            },
            "makedirs" => Request::MakeDirs {
                job: args.job("makedirs")?,
                path: args.string("makedirs")?,
            },
            "utime" => Request::Utime {
                job: args.job("utime")?,
                path: args.string("utime")?,
                atime: args.int("utime")?,
                mtime: args.int("utime")?,
            },
            "proc_prepare" => {
                let job = args.job("proc_prepare")?;
                let mode = args.string("proc_prepare")?;
                let output_mode = mode
                    .parse::<OutputMode>()
                    .map_err(|_| WireError::BadArguments {
                        cmd: "proc_prepare",
                        index: 1,
                    })?;
                let mut cmdline = Vec::new();
                while let Some(arg) = args.opt_string("proc_prepare")? {
                    cmdline.push(arg);
                }
                if cmdline.is_empty() {
                    return Err(WireError::BadArguments {
                        cmd: "proc_prepare",
                        index: 2,
                    });
                }
                Request::ProcPrepare {
                    job,
                    output_mode,
                    cmdline,
                }
            }
            "proc_cwd" => Request::ProcCwd {
                job: args.job("proc_cwd")?,
                cwd: args.string("proc_cwd")?,
            },
            "proc_env" => Request::ProcEnv {
                job: args.job("proc_env")?,
                name: args.string("proc_env")?,
                value: args.string("proc_env")?,
            },
            "proc_start" => Request::ProcStart {
                job: args.job("proc_start")?,
                use_pty: args.int("proc_start")? != 0,
                use_shell: args.int("proc_start")? != 0,
            },
            "proc_write" => Request::ProcWrite {
                job: args.job("proc_write")?,
                data: args.string("proc_write")?,
            },
            "proc_close_stdin" => Request::ProcCloseStdin {
                job: args.job("proc_close_stdin")?,
            },
            "proc_stop" => Request::ProcStop {
                job: args.job("proc_stop")?,
            },
            "proc_add_hook" => {
                let job = args.job("proc_add_hook")?;
                let stream = args.string("proc_add_hook")?;
                let stream =
                    StreamKind::from_wire(&stream).ok_or(WireError::BadArguments {
                        cmd: "proc_add_hook",
                        index: 1,
                    })?;
                Request::ProcAddHook {
                    job,
                    stream,
                    hook_id: args.int("proc_add_hook")? as u64,
                    pattern: args.string("proc_add_hook")?,
                }
            }
            "proc_drop_hook" => Request::ProcDropHook {
                job: args.job("proc_drop_hook")?,
                hook_id: args.int("proc_drop_hook")? as u64,
            },
            "tear_down" => Request::TearDown {
                job: args.job("tear_down")?,
            },
            other => return Err(WireError::UnknownCommand(other.to_owned())),
        };
        args.finish(request.command())?;
        Ok((request, parsed.errors))
    }
}

/// A reply sent by the helper to the runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// The startup banner.
    Hello {
        /// The remote host name.
        hostname: String,
        /// Operating system name.
        system: String,
        /// Kernel release.
        release: String,
        /// Kernel version.
        version: String,
        /// Machine architecture.
        machine: String,
        /// The host's native path separator.
        separator: String,
    },
    /// A job completed. Process jobs carry the exit code.
    Done {
        /// Job id.
        job: JobId,
        /// Exit code for process jobs; elided when zero.
        retcode: Option<i64>,
    },
    /// A job failed.
    Failed {
        /// Job id.
        job: JobId,
        /// What went wrong.
        message: Option<String>,
    },
    /// A parser or dispatch error not attributable to one job.
    CmdError {
        /// The complaint.
        message: String,
    },
    /// A started process reported its pid.
    ProcPid {
        /// Job id.
        job: JobId,
        /// The process id.
        pid: i64,
    },
    /// A hook was installed.
    HookAdded {
        /// Job id.
        job: JobId,
        /// The hook.
        hook_id: u64,
    },
    /// A hook was removed.
    HookDropped {
        /// Job id.
        job: JobId,
        /// The hook.
        hook_id: u64,
    },
    /// A hook matched a line or buffer.
    HookMatched {
        /// Job id.
        job: JobId,
        /// The hook.
        hook_id: u64,
        /// The matching line or buffer.
        data: String,
    },
    /// One file entry of a directory listing.
    ListFile {
        /// Job id.
        job: JobId,
        /// Path relative to the listed root, no leading separator.
        path: String,
        /// Access time.
        atime: i64,
        /// Modification time.
        mtime: i64,
        /// Change time.
        ctime: i64,
    },
    /// One directory entry of a directory listing.
    ListDir {
        /// Job id.
        job: JobId,
        /// Path relative to the listed root, no leading separator.
        path: String,
        /// Access time.
        atime: i64,
        /// Modification time.
        mtime: i64,
        /// Change time.
        ctime: i64,
    },
}

impl Reply {
    /// The wire name of this reply.
    pub fn command(&self) -> &'static str {
        match self {
            Reply::Hello { .. } => "hello",
            Reply::Done { .. } => "done",
            Reply::Failed { .. } => "failed",
            Reply::CmdError { .. } => "cmd_error",
            Reply::ProcPid { .. } => "proc_pid",
            Reply::HookAdded { .. } => "hook_added",
            Reply::HookDropped { .. } => "hook_dropped",
            Reply::HookMatched { .. } => "hook_matched",
            Reply::ListFile { .. } => "list_file",
            Reply::ListDir { .. } => "list_dir",
        }
    }

    /// Renders the reply as one protocol line, without the newline.
    pub fn render(&self) -> String {
        match self {
            Reply::Hello {
                hostname,
                system,
                release,
                version,
                machine,
                separator,
            } => format!(
                "hello {}",
                render_args(&[
                    Value::str(hostname.clone()),
                    Value::str(system.clone()),
                    Value::str(release.clone()),
                    Value::str(version.clone()),
                    Value::str(machine.clone()),
                    Value::str(separator.clone()),
                ])
            ),
            Reply::Done { job, retcode } => match retcode {
                None => format!("done {job}"),
                Some(code) => format!("done {job} {code}"),
            },
            Reply::Failed { job, message } => match message {
                Some(message) => {
                    format!("failed {job} {}", Value::str(message.clone()))
                }
                None => format!("failed {job}"),
            },
            Reply::CmdError { message } => {
                format!("cmd_error {}", Value::str(message.clone()))
            }
            Reply::ProcPid { job, pid } => format!("proc_pid {job} {pid}"),
            Reply::HookAdded { job, hook_id } => format!("hook_added {job} {hook_id}"),
            Reply::HookDropped { job, hook_id } => format!("hook_dropped {job} {hook_id}"),
            Reply::HookMatched { job, hook_id, data } => format!(
                "hook_matched {job} {hook_id} {}",
                Value::str(data.clone())
            ),
            Reply::ListFile {
                job,
                path,
                atime,
                mtime,
                ctime,
            } => format!(
                "list_file {job} {} {atime} {mtime} {ctime}",
                Value::str(path.clone())
            ),
            Reply::ListDir {
                job,
                path,
                atime,
                mtime,
                ctime,
            } => format!(
                "list_dir {job} {} {atime} {mtime} {ctime}",
                Value::str(path.clone())
            ),
        }
    }

    /// Parses one reply line.
    pub fn parse(line: &str) -> Result<(Reply, Vec<ParseError>), WireError> {
        let (cmd, rest) = split_command(line);
        let parsed = parse_args(rest);
        let mut args = Cursor::new(parsed.values);
        let reply = match cmd {
            "hello" => Reply::Hello {
                hostname: args.string("hello")?,
                system: args.string("hello")?,
                release: args.string("hello")?,
                version: args.string("hello")?,
                machine: args.string("hello")?,
                separator: args.string("hello")?,
            },
            "done" => Reply::Done {
                job: args.job("done")?,
                retcode: args.opt_int("done")?,
            },
            "failed" => Reply::Failed {
                job: args.job("failed")?,
                message: args.opt_string("failed")?,
            },
            "cmd_error" => Reply::CmdError {
                message: args.string("cmd_error")?,
            },
            "proc_pid" => Reply::ProcPid {
                job: args.job("proc_pid")?,
                pid: args.int("proc_pid")?,
            },
            "hook_added" => Reply::HookAdded {
                job: args.job("hook_added")?,
                hook_id: args.int("hook_added")? as u64,
            },
            "hook_dropped" => Reply::HookDropped {
                job: args.job("hook_dropped")?,
                hook_id: args.int("hook_dropped")? as u64,
            },
            "hook_matched" => Reply::HookMatched {
                job: args.job("hook_matched")?,
                hook_id: args.int("hook_matched")? as u64,
                data: args.string("hook_matched")?,
            },
            "list_file" => Reply::ListFile {
                job: args.job("list_file")?,
                path: args.string("list_file")?,
                atime: args.int("list_file")?,
                mtime: args.int("list_file")?,
                ctime: args.int("list_file")?,
            },
            "list_dir" => Reply::ListDir {
                job: args.job("list_dir")?,
                path: args.string("list_dir")?,
                atime: args.int("list_dir")?,
                mtime: args.int("list_dir")?,
                ctime: args.int("list_dir")?,
            },
            other => return Err(WireError::UnknownCommand(other.to_owned())),
        };
        args.finish(reply.command())?;
        Ok((reply, parsed.errors))
    }
}

fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((cmd, rest)) => (cmd, rest),
        None => (line, ""),
    }
}

/// Sequential argument consumption with positional error reporting.
struct Cursor {
    values: std::vec::IntoIter<Value>,
    index: usize,
}

impl Cursor {
    fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<Value> {
        self.index += 1;
        self.values.next()
    }

    fn job(&mut self, cmd: &'static str) -> Result<JobId, WireError> {
        match self.next() {
            Some(Value::Int(n)) if n >= 0 => Ok(JobId(n as u64)),
            _ => Err(WireError::BadArguments {
                cmd,
                index: self.index - 1,
            }),
        }
    }

    fn string(&mut self, cmd: &'static str) -> Result<String, WireError> {
        match self.next() {
            Some(Value::Str(s)) => Ok(s),
            _ => Err(WireError::BadArguments {
                cmd,
                index: self.index - 1,
            }),
        }
    }

    fn opt_string(&mut self, cmd: &'static str) -> Result<Option<String>, WireError> {
        match self.next() {
            Some(Value::Str(s)) => Ok(Some(s)),
            None => Ok(None),
            Some(_) => Err(WireError::BadArguments {
                cmd,
                index: self.index - 1,
            }),
        }
    }

    fn int(&mut self, cmd: &'static str) -> Result<i64, WireError> {
        match self.next() {
            Some(Value::Int(n)) => Ok(n),
            _ => Err(WireError::BadArguments {
                cmd,
                index: self.index - 1,
            }),
        }
    }

    fn opt_int(&mut self, cmd: &'static str) -> Result<Option<i64>, WireError> {
        match self.next() {
            Some(Value::Int(n)) => Ok(Some(n)),
            None => Ok(None),
            Some(_) => Err(WireError::BadArguments {
                cmd,
                index: self.index - 1,
            }),
        }
    }

    fn finish(mut self, cmd: &'static str) -> Result<(), WireError> {
        if self.next().is_some() {
            Err(WireError::BadArguments {
                cmd,
                index: self.index - 1,
            })
        } else {
            Ok(())
        }
    }
}
