// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives the helper program over in-process pipes and checks the wire
//! conversation against the protocol contract.

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use lattice_runner::helper::{HelperOptions, serve};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf},
    task::JoinHandle,
    time::timeout,
};

struct HelperClient {
    requests: WriteHalf<DuplexStream>,
    replies: Lines<BufReader<ReadHalf<DuplexStream>>>,
    helper: Option<JoinHandle<std::io::Result<()>>>,
    _guard: Utf8TempDir,
    work_dir: Utf8PathBuf,
}

impl HelperClient {
    fn start() -> Self {
        let guard = camino_tempfile::tempdir().expect("tempdir");
        let work_dir = guard.path().join("wd");

        let (client_side, helper_side) = tokio::io::duplex(64 * 1024);
        let (helper_read, helper_write) = tokio::io::split(helper_side);
        let (client_read, client_write) = tokio::io::split(client_side);
        let helper = tokio::spawn(serve(
            helper_read,
            helper_write,
            HelperOptions { chdir: false },
        ));
        Self {
            requests: client_write,
            replies: BufReader::new(client_read).lines(),
            helper: Some(helper),
            _guard: guard,
            work_dir,
        }
    }

    async fn send(&mut self, line: &str) {
        self.requests
            .write_all(line.as_bytes())
            .await
            .expect("request written");
        self.requests.write_all(b"\n").await.expect("newline written");
        self.requests.flush().await.expect("request flushed");
    }

    async fn next_reply(&mut self) -> String {
        timeout(Duration::from_secs(5), self.replies.next_line())
            .await
            .expect("helper replied within the timeout")
            .expect("reply stream intact")
            .expect("helper did not close the stream")
    }

    async fn expect(&mut self, expected: &str) {
        assert_eq!(self.next_reply().await, expected);
    }

    async fn finish(&mut self) {
        self.send("tear_down 99").await;
        self.expect("done 99").await;
        timeout(
            Duration::from_secs(5),
            self.helper.take().expect("helper not already joined"),
        )
        .await
        .expect("helper exited")
        .expect("helper task joined")
        .expect("helper exited cleanly");
    }
}

#[tokio::test]
async fn happy_path_with_a_process() {
    let mut client = HelperClient::start();
    let wd = client.work_dir.clone();

    let hello = client.next_reply().await;
    assert!(hello.starts_with("hello "), "banner first: {hello}");

    client.send(&format!("set_work_dir 1 '{wd}'")).await;
    client.expect("done 1").await;
    assert!(wd.is_dir(), "set_work_dir created the directory");

    client.send(&format!("makedirs 2 '{wd}/a'")).await;
    client.expect("done 2").await;
    assert!(wd.join("a").is_dir());

    // proc_prepare sends no reply of its own.
    client.send("proc_prepare 3 'ignore' '/bin/true'").await;
    client.send("proc_start 3 0 0").await;
    let pid_line = client.next_reply().await;
    assert!(
        pid_line.starts_with("proc_pid 3 "),
        "pid before exit: {pid_line}"
    );
    client.expect("done 3 0").await;

    client.finish().await;

    // Lifecycle events were appended to the helper's event log.
    let log = std::fs::read_to_string(wd.join("event.log")).expect("event.log exists");
    assert!(
        log.lines().any(|line| line.contains(":3:info:")),
        "lifecycle records for job 3:\n{log}"
    );
}

#[tokio::test]
async fn work_dir_must_not_preexist() {
    let mut client = HelperClient::start();
    let wd = client.work_dir.clone();
    std::fs::create_dir_all(wd.as_std_path()).expect("pre-create");

    let _hello = client.next_reply().await;
    client.send(&format!("set_work_dir 1 '{wd}'")).await;
    let reply = client.next_reply().await;
    assert!(
        reply.starts_with("failed 1 "),
        "pre-existing work dir is refused: {reply}"
    );
    client.finish().await;
}

#[tokio::test]
async fn hooks_match_per_line_and_report_back() {
    let mut client = HelperClient::start();
    let wd = client.work_dir.clone();

    let _hello = client.next_reply().await;
    client.send(&format!("set_work_dir 1 '{wd}'")).await;
    client.expect("done 1").await;

    client
        .send("proc_prepare 2 'lines' '/bin/sh' '-c' 'echo alpha; echo beta'")
        .await;
    client.send("proc_add_hook 2 'out' 7 'bet.'").await;
    client.expect("hook_added 2 7").await;
    client.send("proc_start 2 0 0").await;

    let pid_line = client.next_reply().await;
    assert!(pid_line.starts_with("proc_pid 2 "));
    client.expect(r"hook_matched 2 7 'beta\n'").await;
    client.expect("done 2 0").await;

    client.send("proc_drop_hook 2 7").await;
    client.expect("hook_dropped 2 7").await;

    client.finish().await;

    // Output lines landed in the event log too.
    let log = std::fs::read_to_string(wd.join("event.log")).expect("event.log exists");
    assert!(log.contains(r"'alpha\n'"), "stdout recorded:\n{log}");
}

#[tokio::test]
async fn stdin_reaches_the_process() {
    let mut client = HelperClient::start();
    let wd = client.work_dir.clone();

    let _hello = client.next_reply().await;
    client.send(&format!("set_work_dir 1 '{wd}'")).await;
    client.expect("done 1").await;

    client.send("proc_prepare 2 'lines' '/bin/cat'").await;
    client.send("proc_add_hook 2 'out' 1 'ping'").await;
    client.expect("hook_added 2 1").await;
    client.send("proc_start 2 0 0").await;
    let pid_line = client.next_reply().await;
    assert!(pid_line.starts_with("proc_pid 2 "));

    client.send(r"proc_write 2 'ping\n'").await;
    client.expect(r"hook_matched 2 1 'ping\n'").await;
    client.send("proc_close_stdin 2").await;
    client.expect("done 2 0").await;

    client.finish().await;
}

#[tokio::test]
async fn file_operations_round_trip() {
    let mut client = HelperClient::start();
    let wd = client.work_dir.clone();

    let _hello = client.next_reply().await;
    client.send(&format!("set_work_dir 1 '{wd}'")).await;
    client.expect("done 1").await;

    // Build a little tree through the protocol.
    client.send("makedirs 2 'src/sub'").await;
    client.expect("done 2").await;
    client.send(r"append 3 'src/keep.txt' 'kept\n'").await;
    client.expect("done 3").await;
    client.send(r"append 4 'src/skip.o' 'object\n'").await;
    client.expect("done 4").await;

    // Copy it, omitting objects, and list the destination.
    client.send("copy 5 'src' 'dest' '*.o'").await;
    client.expect("done 5").await;
    client.send("list 6 'dest'").await;
    let mut listed = Vec::new();
    loop {
        let reply = client.next_reply().await;
        if reply == "done 6" {
            break;
        }
        listed.push(reply);
    }
    let mut names: Vec<String> = listed
        .iter()
        .map(|line| {
            let (kind, rest) = line.split_once(' ').expect("kind and args");
            assert!(kind == "list_file" || kind == "list_dir", "entry: {line}");
            let path_start = rest.find('\'').expect("quoted path");
            rest[path_start + 1..]
                .split('\'')
                .next()
                .expect("path contents")
                .to_owned()
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["keep.txt", "sub"]);

    // utime then remove.
    client
        .send("utime 7 'dest/keep.txt' 1600000000 1600000100")
        .await;
    client.expect("done 7").await;
    client.send("remove 8 'dest'").await;
    client.expect("done 8").await;
    assert!(!wd.join("dest").exists());
    // Removing it again is fine.
    client.send("remove 9 'dest'").await;
    client.expect("done 9").await;

    client.finish().await;
}

#[tokio::test]
async fn unknown_commands_and_jobs_report_cmd_error() {
    let mut client = HelperClient::start();
    let _hello = client.next_reply().await;

    client.send("frobnicate 1 'x'").await;
    let reply = client.next_reply().await;
    assert!(
        reply.starts_with("cmd_error "),
        "unknown command is reported: {reply}"
    );

    client.send("proc_write 42 'data'").await;
    let reply = client.next_reply().await;
    assert!(
        reply.starts_with("cmd_error ") && reply.contains("42"),
        "unknown job is reported: {reply}"
    );

    client.finish().await;
}
