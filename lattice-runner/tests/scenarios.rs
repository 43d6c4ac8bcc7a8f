// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scheduler scenarios: small definitions run against a
//! recording reporter, asserting outcomes, orderings and cascades.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use lattice_runner::{
    basics::{DirectoryRef, TempDirectoryClass},
    checks::{Checks, assert_equal, expect_exit_code},
    component::{
        BlockingTest, BuildContext, CapabilityHandle, Component, ComponentClass,
        ComponentContext, Need, NeedSpec, ResourceGate, Suite, Test,
    },
    errors::{HarnessError, NodeFailure},
    graph::{Capability, NestedDef, NodeDef, NodeKind, TestDef},
    host::{CONTROLLED_HOST, ControlledHost, DIRECTORY, ProcessOptions},
    logmux::EventLogRecord,
    process::{CommandLine, OutputMode},
    protocol::Value,
    reporter::{Outcome, Reporter, RunError, RunStats},
    runner::{RunConfig, RunSummary, Runner, RunnerHandle, RunnerOpts},
};
use pretty_assertions::assert_eq;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

const MOCK: Capability = Capability::new("IMockSuite");

// ---
// Fixture classes
// ---

type BuildFn = Box<dyn Fn(BuildContext) -> Result<Component, NodeFailure> + Send + Sync>;

struct FixtureClass {
    name: &'static str,
    kind: NodeKind,
    capabilities: Vec<Capability>,
    needs: NeedSpec,
    build_fn: BuildFn,
}

impl ComponentClass for FixtureClass {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn needs(&self) -> NeedSpec {
        self.needs.clone()
    }

    fn build(&self, cx: BuildContext) -> Result<Component, NodeFailure> {
        (self.build_fn)(cx)
    }
}

fn test_fixture(
    name: &'static str,
    needs: NeedSpec,
    build_fn: BuildFn,
) -> Arc<dyn ComponentClass> {
    Arc::new(FixtureClass {
        name,
        kind: NodeKind::Test,
        capabilities: Vec::new(),
        needs,
        build_fn,
    })
}

fn suite_fixture(
    name: &'static str,
    needs: NeedSpec,
    build_fn: BuildFn,
) -> Arc<dyn ComponentClass> {
    Arc::new(FixtureClass {
        name,
        kind: NodeKind::Suite,
        capabilities: vec![MOCK],
        needs,
        build_fn,
    })
}

struct MockSuite;

#[async_trait]
impl Suite for MockSuite {
    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == MOCK).then(|| Arc::new(()) as CapabilityHandle)
    }
}

fn succeeding_test() -> Arc<dyn ComponentClass> {
    test_fixture(
        "SucceedingTest",
        NeedSpec::none(),
        Box::new(|_| Ok(Component::Test(Box::new(BlockingTest::new(|| Ok(())))))),
    )
}

fn failing_test() -> Arc<dyn ComponentClass> {
    test_fixture(
        "FailingTest",
        NeedSpec::none(),
        Box::new(|_| {
            Ok(Component::Test(Box::new(BlockingTest::new(|| {
                Err(NodeFailure::Failure {
                    msg: "intentional failure".to_owned(),
                    details: "The only purpose of this test is\nto raise an error.".to_owned(),
                })
            }))))
        }),
    )
}

fn collector_test() -> Arc<dyn ComponentClass> {
    test_fixture(
        "ThrowsMultipleErrors",
        NeedSpec::none(),
        Box::new(|_| {
            Ok(Component::Test(Box::new(BlockingTest::new(|| {
                let mut checks = Checks::new("collector");
                checks.record(assert_equal(
                    &true,
                    &false,
                    "short msg of the first intentional error",
                ));
                checks.record(assert_equal(
                    &"ape",
                    &"cow",
                    "short msg of the second intentional error",
                ));
                checks.check()
            }))))
        }),
    )
}

fn noop_suite() -> Arc<dyn ComponentClass> {
    suite_fixture(
        "NoOpSuite",
        NeedSpec::none(),
        Box::new(|_| Ok(Component::Suite(Arc::new(MockSuite)))),
    )
}

fn single_dep_needs() -> NeedSpec {
    NeedSpec::Fixed(vec![Need::new("dep1", MOCK)])
}

fn single_dep_test() -> Arc<dyn ComponentClass> {
    test_fixture(
        "SingleDepTest",
        single_dep_needs(),
        Box::new(|cx| {
            let bound = cx.bindings.has("dep1");
            Ok(Component::Test(Box::new(BlockingTest::new(move || {
                assert_equal(&bound, &true, "dep1 is not defined")
            }))))
        }),
    )
}

fn single_dep_suite() -> Arc<dyn ComponentClass> {
    suite_fixture(
        "SingleDepSuite",
        single_dep_needs(),
        Box::new(|_| Ok(Component::Suite(Arc::new(MockSuite)))),
    )
}

struct DanglingTest;

#[async_trait]
impl Test for DanglingTest {
    async fn run(&mut self, _cx: &ComponentContext) -> Result<(), NodeFailure> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn dangling_test() -> Arc<dyn ComponentClass> {
    test_fixture(
        "DanglingDeferredTest",
        NeedSpec::none(),
        Box::new(|_| Ok(Component::Test(Box::new(DanglingTest)))),
    )
}

struct EndlessSetUpSuite;

#[async_trait]
impl Suite for EndlessSetUpSuite {
    async fn set_up(&self, _cx: &ComponentContext) -> Result<Option<NestedDef>, NodeFailure> {
        std::future::pending::<()>().await;
        Ok(None)
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == MOCK).then(|| Arc::new(()) as CapabilityHandle)
    }
}

fn endless_set_up_suite() -> Arc<dyn ComponentClass> {
    suite_fixture(
        "SetUpTimeoutSuite",
        NeedSpec::none(),
        Box::new(|_| Ok(Component::Suite(Arc::new(EndlessSetUpSuite)))),
    )
}

struct EndlessTearDownSuite;

#[async_trait]
impl Suite for EndlessTearDownSuite {
    async fn tear_down(&self, _cx: &ComponentContext) -> Result<(), NodeFailure> {
        std::future::pending::<()>().await;
        Ok(())
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == MOCK).then(|| Arc::new(()) as CapabilityHandle)
    }
}

fn endless_tear_down_suite() -> Arc<dyn ComponentClass> {
    suite_fixture(
        "TearDownTimeoutSuite",
        NeedSpec::none(),
        Box::new(|_| Ok(Component::Suite(Arc::new(EndlessTearDownSuite)))),
    )
}

struct FailingSetUpSuite;

#[async_trait]
impl Suite for FailingSetUpSuite {
    async fn set_up(&self, _cx: &ComponentContext) -> Result<Option<NestedDef>, NodeFailure> {
        Err(NodeFailure::failure("refusing to come up"))
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == MOCK).then(|| Arc::new(()) as CapabilityHandle)
    }
}

fn failing_set_up_suite() -> Arc<dyn ComponentClass> {
    suite_fixture(
        "FailingSetUpSuite",
        NeedSpec::none(),
        Box::new(|_| Ok(Component::Suite(Arc::new(FailingSetUpSuite)))),
    )
}

struct LogTest {
    msg: String,
}

#[async_trait]
impl Test for LogTest {
    async fn run(&mut self, cx: &ComponentContext) -> Result<(), NodeFailure> {
        cx.log(self.msg.clone());
        Ok(())
    }
}

fn variable_needs_test() -> Arc<dyn ComponentClass> {
    test_fixture(
        "VariableNeedsTest",
        NeedSpec::OneOf(vec![
            vec![Need::new("aaa", MOCK)],
            vec![Need::new("bbb", MOCK), Need::new("ccc", MOCK)],
        ]),
        Box::new(|cx| {
            let msg = if cx.bindings.has("aaa") {
                "needs satisfy variant 1"
            } else if cx.bindings.has("bbb") && cx.bindings.has("ccc") {
                "needs satisfy variant 2"
            } else {
                return Err(NodeFailure::failure("no variant of requirements satisfied"));
            };
            Ok(Component::Test(Box::new(LogTest {
                msg: msg.to_owned(),
            })))
        }),
    )
}

fn ambiguous_needs_test() -> Arc<dyn ComponentClass> {
    test_fixture(
        "AmbiguousNeedsTest",
        NeedSpec::OneOf(vec![
            vec![Need::new("xxx", MOCK)],
            vec![Need::new("yyy", MOCK)],
        ]),
        Box::new(|_| Ok(Component::Test(Box::new(DanglingTest)))),
    )
}

struct ResourceSuite {
    gate: ResourceGate,
    handle: RunnerHandle,
}

#[async_trait]
impl Suite for ResourceSuite {
    fn ready_for_child(&self, _child: &str) -> bool {
        self.gate.is_free()
    }

    fn child_added(&self, child: &str) {
        self.gate.acquire(child);
        self.handle.log(format!("resource acquired by {child}"));
    }

    fn child_removed(&self, child: &str) {
        self.gate.release(child);
        self.handle.log(format!("resource released by {child}"));
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == MOCK).then(|| Arc::new(()) as CapabilityHandle)
    }
}

fn resource_suite() -> Arc<dyn ComponentClass> {
    suite_fixture(
        "ResourceSuite",
        NeedSpec::none(),
        Box::new(|cx| {
            Ok(Component::Suite(Arc::new(ResourceSuite {
                gate: ResourceGate::new(),
                handle: cx.handle.clone(),
            })))
        }),
    )
}

struct NestedSuite;

#[async_trait]
impl Suite for NestedSuite {
    async fn set_up(&self, _cx: &ComponentContext) -> Result<Option<NestedDef>, NodeFailure> {
        let mut def = TestDef::new();
        def.insert("nested_suite".to_owned(), NodeDef::new(noop_suite()));
        Ok(Some(NestedDef {
            def,
            leaves: vec!["nested_suite".to_owned()],
        }))
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == MOCK).then(|| Arc::new(()) as CapabilityHandle)
    }
}

fn nested_suite() -> Arc<dyn ComponentClass> {
    suite_fixture(
        "NestedSuite",
        NeedSpec::none(),
        Box::new(|_| Ok(Component::Suite(Arc::new(NestedSuite)))),
    )
}

// ---
// Recording reporter
// ---

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn boxed(&self) -> Box<dyn Reporter> {
        Box::new(RecorderReporter(self.clone()))
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("recorder lock poisoned").clone()
    }

    fn push(&self, event: String) {
        self.events
            .lock()
            .expect("recorder lock poisoned")
            .push(event);
    }

    fn index_of(&self, needle: &str) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("event {needle:?} not found in {events:#?}"))
    }

    fn count_matching(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

struct RecorderReporter(Recorder);

impl Reporter for RecorderReporter {
    fn begin(&mut self, _defs: &TestDef) {
        self.0.push("begin".to_owned());
    }

    fn start_set_up_suite(&mut self, name: &str) {
        self.0.push(format!("startSetUpSuite {name}"));
    }

    fn stop_set_up_suite(&mut self, name: &str) {
        self.0.push(format!("stopSetUpSuite {name}"));
    }

    fn suite_set_up_failure(&mut self, name: &str, error: &NodeFailure) {
        self.0.push(format!("suiteSetUpFailure {name}: {error}"));
    }

    fn start_test(&mut self, name: &str) {
        self.0.push(format!("startTest {name}"));
    }

    fn stop_test(&mut self, name: &str, outcome: Outcome, _error: Option<&NodeFailure>) {
        self.0.push(format!("stopTest {name} {outcome}"));
    }

    fn start_tear_down_suite(&mut self, name: &str) {
        self.0.push(format!("startTearDownSuite {name}"));
    }

    fn stop_tear_down_suite(&mut self, name: &str) {
        self.0.push(format!("stopTearDownSuite {name}"));
    }

    fn suite_tear_down_failure(&mut self, name: &str, error: &NodeFailure) {
        self.0.push(format!("suiteTearDownFailure {name}: {error}"));
    }

    fn log(&mut self, msg: &str) {
        self.0.push(format!("log {msg}"));
    }

    fn harness_failure(&mut self, error: &HarnessError) {
        self.0.push(format!("harnessFailure {error}"));
    }

    fn end(&mut self, _duration: Duration, _stats: &RunStats, _errors: &[RunError]) {
        self.0.push("end".to_owned());
    }
}

// ---
// Helpers
// ---

fn tdef(entries: Vec<(&str, NodeDef)>) -> TestDef {
    entries
        .into_iter()
        .map(|(name, def)| (name.to_owned(), def))
        .collect()
}

struct RunDirs {
    _guard: Utf8TempDir,
    tmp: Utf8PathBuf,
}

fn run_dirs() -> RunDirs {
    let guard = camino_tempfile::tempdir().expect("tempdir");
    let tmp = guard.path().join("tmp");
    RunDirs { _guard: guard, tmp }
}

async fn run_def(def: TestDef, recorder: &Recorder) -> RunSummary {
    run_def_with_timeouts(def, recorder, Duration::from_secs(10), Duration::from_secs(15)).await
}

async fn run_def_with_timeouts(
    def: TestDef,
    recorder: &Recorder,
    test_timeout: Duration,
    suite_timeout: Duration,
) -> RunSummary {
    let dirs = run_dirs();
    let runner = Runner::new(
        RunnerOpts::new(dirs.tmp.clone())
            .reporter(recorder.boxed())
            .test_timeout(test_timeout)
            .suite_timeout(suite_timeout),
    )
    .expect("runner builds");
    let summary = runner.run(def, RunConfig::new()).await.expect("run completes");
    drop(dirs);
    summary
}

fn find_error<'a>(summary: &'a RunSummary, name: &str) -> &'a RunError {
    summary
        .errors
        .iter()
        .find(|e| e.name == name)
        .unwrap_or_else(|| panic!("no error recorded for {name}: {:?}", summary.errors))
}

// ---
// Scenarios
// ---

#[tokio::test]
async fn stream_reporter_baseline() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("test_success", NodeDef::new(succeeding_test())),
        ("test_failure", NodeDef::new(failing_test())),
        ("test_suite", NodeDef::new(noop_suite())),
        (
            "test_single_dep",
            NodeDef::new(single_dep_test()).uses(["test_suite"]),
        ),
        ("test_collector", NodeDef::new(collector_test())),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("test_success"), Some(Outcome::Ok));
    assert_eq!(summary.outcome("test_failure"), Some(Outcome::Failed));
    assert_eq!(summary.outcome("test_single_dep"), Some(Outcome::Ok));
    assert_eq!(summary.outcome("test_collector"), Some(Outcome::Failed));
    assert_eq!(summary.stats.total, 4);
    assert_eq!(summary.stats.succ, 2);
    assert_eq!(summary.exit_code(), 1);

    let failure = find_error(&summary, "test_failure");
    assert_eq!(failure.failure.to_string(), "intentional failure");
    let collected = find_error(&summary, "test_collector");
    match &*collected.failure {
        NodeFailure::Collection(collection) => assert_eq!(collection.failures.len(), 2),
        other => panic!("expected a failure collection, got {other}"),
    }

    // The suite was set up and torn down, and the stream starts with
    // `begin` and ends with `end`.
    let events = recorder.events();
    assert_eq!(events.first().map(String::as_str), Some("begin"));
    assert_eq!(events.last().map(String::as_str), Some("end"));
    recorder.index_of("startSetUpSuite test_suite");
    recorder.index_of("stopSetUpSuite test_suite");
    recorder.index_of("startTearDownSuite test_suite");
    recorder.index_of("stopTearDownSuite test_suite");

    // Single termination: one stopTest per test node.
    for name in [
        "test_success",
        "test_failure",
        "test_single_dep",
        "test_collector",
    ] {
        assert_eq!(
            recorder.count_matching(&format!("stopTest {name} ")),
            1,
            "exactly one stopTest for {name}"
        );
    }
}

#[tokio::test]
async fn missing_need_reports_ux_skip() {
    let recorder = Recorder::default();
    let def = tdef(vec![("test_with_dep", NodeDef::new(single_dep_test()))]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("test_with_dep"), Some(Outcome::UxSkip));
    assert_eq!(summary.exit_code(), 1);
    let error = find_error(&summary, "test_with_dep");
    assert!(matches!(*error.failure, NodeFailure::UnableToRun { .. }));
    assert_eq!(recorder.count_matching("stopTest test_with_dep "), 1);
}

#[tokio::test]
async fn timeouts_classify_and_cascade() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("test_deferred_timeout", NodeDef::new(dangling_test())),
        ("endless_setup", NodeDef::new(endless_set_up_suite())),
        (
            "endless_setup_user",
            NodeDef::new(single_dep_test()).uses(["endless_setup"]),
        ),
        ("endless_teardown", NodeDef::new(endless_tear_down_suite())),
        (
            "endless_teardown_user",
            NodeDef::new(single_dep_test()).uses(["endless_teardown"]),
        ),
    ]);
    let summary = run_def_with_timeouts(
        def,
        &recorder,
        Duration::from_millis(100),
        Duration::from_millis(100),
    )
    .await;

    // A test returning a never-completing future times out.
    assert_eq!(
        summary.outcome("test_deferred_timeout"),
        Some(Outcome::Timeout)
    );

    // An endless setUp times the suite out; its dependent is skipped
    // because of the failed input dependency.
    let setup_error = find_error(&summary, "endless_setup");
    assert!(matches!(*setup_error.failure, NodeFailure::Timeout { .. }));
    assert_eq!(
        summary.outcome("endless_setup_user"),
        Some(Outcome::UxSkip)
    );

    // An endless tearDown is reported but does not fail its (already
    // finished) dependents.
    assert_eq!(
        summary.outcome("endless_teardown_user"),
        Some(Outcome::Ok)
    );
    let teardown_error = find_error(&summary, "endless_teardown");
    assert!(matches!(*teardown_error.failure, NodeFailure::Timeout { .. }));
    recorder.index_of("startTearDownSuite endless_teardown");
    recorder.index_of("stopTearDownSuite endless_teardown");
}

#[tokio::test]
async fn variable_needs_select_the_matching_alternative() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("s1", NodeDef::new(noop_suite())),
        ("s2", NodeDef::new(noop_suite())),
        (
            "var_needs1",
            NodeDef::new(variable_needs_test()).uses(["s1"]),
        ),
        (
            "var_needs2",
            NodeDef::new(variable_needs_test()).uses(["s1", "s2"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("var_needs1"), Some(Outcome::Ok));
    assert_eq!(summary.outcome("var_needs2"), Some(Outcome::Ok));
    recorder.index_of("log needs satisfy variant 1");
    recorder.index_of("log needs satisfy variant 2");
}

#[tokio::test]
async fn ambiguous_disjunctive_needs_are_definition_errors() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("s1", NodeDef::new(noop_suite())),
        ("ambiguous", NodeDef::new(ambiguous_needs_test()).uses(["s1"])),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("ambiguous"), Some(Outcome::Error));
    let error = find_error(&summary, "ambiguous");
    assert!(error.failure.to_string().contains("2 of them matched"));
}

#[tokio::test]
async fn unmatched_disjunctive_needs_are_definition_errors() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("s1", NodeDef::new(noop_suite())),
        ("s2", NodeDef::new(noop_suite())),
        ("s3", NodeDef::new(noop_suite())),
        (
            "unmatched",
            NodeDef::new(variable_needs_test()).uses(["s1", "s2", "s3"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("unmatched"), Some(Outcome::Error));
    let error = find_error(&summary, "unmatched");
    assert!(error.failure.to_string().contains("none of them matched"));
}

#[tokio::test]
async fn resource_admits_one_child_at_a_time() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("resource", NodeDef::new(resource_suite())),
        ("u1", NodeDef::new(single_dep_test()).uses(["resource"])),
        ("suite", NodeDef::new(single_dep_suite()).uses(["resource"])),
        ("u2", NodeDef::new(single_dep_test()).uses(["suite"])),
        (
            "u3",
            NodeDef::new(single_dep_test())
                .uses(["resource"])
                .only_after(["u2"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.exit_code(), 0);
    let resource_log: Vec<String> = recorder
        .events()
        .into_iter()
        .filter(|e| e.starts_with("log resource"))
        .collect();
    assert_eq!(
        resource_log,
        vec![
            "log resource acquired by u1",
            "log resource released by u1",
            "log resource acquired by suite",
            "log resource released by suite",
            "log resource acquired by u3",
            "log resource released by u3",
        ]
    );
}

#[tokio::test]
async fn only_after_waits_for_termination() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("first", NodeDef::new(succeeding_test())),
        (
            "second",
            NodeDef::new(succeeding_test()).only_after(["first"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.exit_code(), 0);
    let first_stop = recorder.index_of("stopTest first OK");
    let second_start = recorder.index_of("startTest second");
    assert!(
        first_stop < second_start,
        "second must not start before first terminates"
    );
}

#[tokio::test]
async fn only_after_on_a_failed_target_skips_without_abort() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("flaky", NodeDef::new(failing_test())),
        (
            "afterwards",
            NodeDef::new(succeeding_test()).only_after(["flaky"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    // A test failure leaves the test `done`, not `failed`; onlyAfter is
    // satisfied by any termination, so the dependent still runs.
    assert_eq!(summary.outcome("afterwards"), Some(Outcome::Ok));
}

#[tokio::test]
async fn only_after_on_a_failed_suite_is_ux_skip() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("bad_suite", NodeDef::new(failing_set_up_suite())),
        (
            "later",
            NodeDef::new(succeeding_test()).only_after(["bad_suite"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    // The suite ends `failed`; the onlyAfter dependent is skipped, not
    // aborted.
    assert_eq!(summary.outcome("later"), Some(Outcome::UxSkip));
    recorder.index_of("suiteSetUpFailure bad_suite: refusing to come up");
}

#[tokio::test]
async fn suite_failure_aborts_the_dependent_closure() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("bad_suite", NodeDef::new(failing_set_up_suite())),
        (
            "middle",
            NodeDef::new(single_dep_suite()).uses(["bad_suite"]),
        ),
        ("leaf", NodeDef::new(single_dep_test()).uses(["middle"])),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("leaf"), Some(Outcome::UxSkip));
    let middle_error = find_error(&summary, "middle");
    assert!(matches!(*middle_error.failure, NodeFailure::UnableToRun { .. }));
}

#[tokio::test]
async fn needs_ordering_is_strict() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("s", NodeDef::new(noop_suite())),
        ("t", NodeDef::new(single_dep_test()).uses(["s"])),
    ]);
    let summary = run_def(def, &recorder).await;
    assert_eq!(summary.exit_code(), 0);

    let set_up_done = recorder.index_of("stopSetUpSuite s");
    let test_start = recorder.index_of("startTest t");
    let test_stop = recorder.index_of("stopTest t OK");
    let tear_down_start = recorder.index_of("startTearDownSuite s");
    assert!(set_up_done < test_start, "suite runs before its dependent");
    assert!(
        test_stop < tear_down_start,
        "suite is torn down only after the dependent finished"
    );
}

#[tokio::test]
async fn plain_ordering_deps_do_not_consult_the_child_gate() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("resource", NodeDef::new(resource_suite())),
        ("u1", NodeDef::new(single_dep_test()).uses(["resource"])),
        (
            "ordered",
            NodeDef::new(succeeding_test()).depends(["resource"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("u1"), Some(Outcome::Ok));
    assert_eq!(summary.outcome("ordered"), Some(Outcome::Ok));

    // Both starts are fired in the same turn: u1 occupies the resource's
    // child gate, and the ordering edge must not wait on it. The start of
    // `ordered` therefore lands before u1's completion is applied.
    let ordered_start = recorder.index_of("startTest ordered");
    let u1_stop = recorder.index_of("stopTest u1 OK");
    assert!(
        ordered_start < u1_stop,
        "an ordering edge on a gated suite must not block"
    );

    // Only the needs edge acquired the resource.
    let acquisitions: Vec<String> = recorder
        .events()
        .into_iter()
        .filter(|e| e.starts_with("log resource acquired"))
        .collect();
    assert_eq!(acquisitions, vec!["log resource acquired by u1"]);
}

#[tokio::test]
async fn plain_ordering_dep_on_a_done_target_is_satisfied() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("first", NodeDef::new(succeeding_test())),
        (
            "second",
            NodeDef::new(succeeding_test()).depends(["first"]),
        ),
    ]);
    let summary = run_def(def, &recorder).await;

    // `first` terminates as `done`; the ordering edge is satisfied by any
    // state past `starting`, so `second` runs rather than wedging or
    // being swept up as a straggler.
    assert_eq!(summary.outcome("first"), Some(Outcome::Ok));
    assert_eq!(summary.outcome("second"), Some(Outcome::Ok));
    assert_eq!(summary.exit_code(), 0);
    assert!(summary.errors.is_empty(), "no errors: {:?}", summary.errors);

    let first_start = recorder.index_of("startTest first");
    let second_start = recorder.index_of("startTest second");
    assert!(
        first_start < second_start,
        "second must not start while first is still waiting or starting"
    );
}

#[tokio::test]
async fn xfail_and_skip_classification() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("expected_failure", NodeDef::new(failing_test()).xfail()),
        ("unexpected_pass", NodeDef::new(succeeding_test()).xfail()),
        ("skipped", NodeDef::new(succeeding_test()).skip()),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("expected_failure"), Some(Outcome::Xfail));
    assert_eq!(summary.outcome("unexpected_pass"), Some(Outcome::UxOk));
    assert_eq!(summary.outcome("skipped"), Some(Outcome::Skipped));
    assert_eq!(summary.stats.xfail, 1);
    assert_eq!(summary.stats.skipped, 1);
}

#[tokio::test]
async fn nested_subgraph_is_spliced_under_the_parent() {
    let recorder = Recorder::default();
    let def = tdef(vec![
        ("parent", NodeDef::new(nested_suite())),
        ("test_nested", NodeDef::new(single_dep_test()).uses(["parent"])),
    ]);
    let summary = run_def(def, &recorder).await;
    assert_eq!(summary.exit_code(), 0);

    let parent_up = recorder.index_of("stopSetUpSuite parent");
    let nested_up = recorder.index_of("stopSetUpSuite parent.nested_suite");
    let test_start = recorder.index_of("startTest test_nested");
    let nested_down = recorder.index_of("startTearDownSuite parent.nested_suite");
    let parent_down = recorder.index_of("startTearDownSuite parent");

    assert!(parent_up < nested_up, "nested nodes start after the parent");
    assert!(
        nested_up < test_start,
        "outer dependents wait for the nested leaves"
    );
    assert!(
        nested_down < parent_down,
        "the parent outlives its nested children"
    );
}

#[tokio::test]
async fn duplicate_names_are_harness_errors() {
    let recorder = Recorder::default();
    let mut def = TestDef::new();
    def.insert("localhost".to_owned(), NodeDef::new(noop_suite()));

    let dirs = run_dirs();
    let runner = Runner::new(RunnerOpts::new(dirs.tmp.clone()).reporter(recorder.boxed()))
        .expect("runner builds");
    let result = runner.run(def, RunConfig::new()).await;
    assert!(matches!(result, Err(HarnessError::Definition(_))));
    assert_eq!(recorder.count_matching("harnessFailure"), 1);
    drop(dirs);
}

#[tokio::test]
async fn temp_directory_suite_creates_and_removes() {
    let recorder = Recorder::default();
    let seen_path: Arc<Mutex<Option<String>>> = Arc::default();

    let seen = Arc::clone(&seen_path);
    let probe = test_fixture(
        "DirProbeTest",
        NeedSpec::Fixed(vec![Need::new("dir", DIRECTORY)]),
        Box::new(move |cx| {
            let dir: Arc<DirectoryRef> = cx.bindings.get("dir")?;
            let path = dir.path.clone();
            *seen.lock().expect("path lock poisoned") = Some(path.clone());
            Ok(Component::Test(Box::new(BlockingTest::new(move || {
                let metadata = std::fs::metadata(&path)
                    .map_err(|err| NodeFailure::failure(err.to_string()))?;
                assert_equal(&metadata.is_dir(), &true, "temp dir exists during the run")
            }))))
        }),
    );

    let def = tdef(vec![
        (
            "workdir",
            NodeDef::new(Arc::new(TempDirectoryClass))
                .uses(["localhost"])
                .args([Value::str("scratch")]),
        ),
        ("probe", NodeDef::new(probe).uses(["workdir"])),
    ]);
    let summary = run_def(def, &recorder).await;

    assert_eq!(summary.outcome("probe"), Some(Outcome::Ok));
    let path = seen_path
        .lock()
        .expect("path lock poisoned")
        .clone()
        .expect("probe saw the allocated path");
    assert!(path.contains("scratch-"), "descriptive path: {path}");
    assert!(
        !std::path::Path::new(&path).exists(),
        "temp dir is removed by tearDown"
    );
}

// ---
// Host-backed end-to-end run
// ---

struct ProcSuite {
    host: Arc<dyn ControlledHost>,
}

#[async_trait]
impl Suite for ProcSuite {
    async fn set_up(&self, _cx: &ComponentContext) -> Result<Option<NestedDef>, NodeFailure> {
        let (process, mut completion) = self
            .host
            .prepare_process(
                "proc_suite.echo",
                CommandLine::Shell("echo hello".to_owned()),
                ProcessOptions {
                    cwd: None,
                    output: OutputMode::Lines,
                },
            )
            .await?;
        process.start(false).await?;
        let exit_code = completion.wait_exit_code().await?;
        expect_exit_code(exit_code, 0, "echo")?;
        Ok(None)
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == MOCK).then(|| Arc::new(()) as CapabilityHandle)
    }
}

fn proc_suite() -> Arc<dyn ComponentClass> {
    Arc::new(FixtureClass {
        name: "ProcSuite",
        kind: NodeKind::Suite,
        capabilities: vec![MOCK],
        needs: NeedSpec::Fixed(vec![Need::new("host", CONTROLLED_HOST)]),
        build_fn: Box::new(|cx| {
            let host: Arc<dyn ControlledHost> = cx.bindings.get("host")?;
            Ok(Component::Suite(Arc::new(ProcSuite { host })))
        }),
    })
}

#[tokio::test]
async fn processes_stream_into_the_report_directory() {
    let recorder = Recorder::default();
    let guard = camino_tempfile::tempdir().expect("tempdir");
    let tmp = guard.path().join("tmp");
    let report = guard.path().join("report");

    let def = tdef(vec![
        ("proc_suite", NodeDef::new(proc_suite()).uses(["localhost"])),
        ("check", NodeDef::new(single_dep_test()).uses(["proc_suite"])),
    ]);
    let runner = Runner::new(
        RunnerOpts::new(tmp.clone())
            .reporter(recorder.boxed())
            .report_dir(report.clone()),
    )
    .expect("runner builds");
    let summary = runner.run(def, RunConfig::new()).await.expect("run completes");

    assert_eq!(summary.exit_code(), 0);
    // The tmp dir is cleaned on success; the report dir stays.
    assert!(!tmp.exists());

    // The captured stream landed in the per-source report file, raw.
    let captured = std::fs::read_to_string(report.join("proc_suite.echo.out"))
        .expect("report output file exists");
    assert_eq!(captured, "hello\n");

    // The merged event log parses and is monotonically non-decreasing.
    let merged = std::fs::read_to_string(report.join("event.log")).expect("merged log exists");
    let mut last_timestamp = i64::MIN;
    let mut saw_echo = false;
    for line in merged.lines() {
        let mut fields = line.split('\t');
        let timestamp: i64 = fields
            .next()
            .expect("timestamp field")
            .parse()
            .expect("timestamp parses");
        assert!(timestamp >= last_timestamp, "timestamps are ordered");
        last_timestamp = timestamp;
        let _host = fields.next().expect("host field");
        if fields.next() == Some("proc_suite.echo") {
            saw_echo = true;
        }
    }
    assert!(saw_echo, "merged log contains the process record:\n{merged}");
    drop(guard);
}

#[tokio::test]
async fn event_log_records_round_trip_through_the_sink() {
    // Sanity check that what the run writes is what the multiplexer
    // parses; the full chain is covered by the report-directory test.
    let record = EventLogRecord {
        timestamp: 42,
        source: "node.svc".to_owned(),
        channel: "err".to_owned(),
        payload: "'oops\\n'".to_owned(),
    };
    let reparsed = EventLogRecord::parse(&record.render()).expect("parses");
    assert_eq!(reparsed, record);
    assert_eq!(reparsed.decoded_payload().as_deref(), Some("oops\n"));
}
