// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scheduler: a cooperative turn loop over the node-status map.
//!
//! Each turn classifies every non-terminal node as runnable, terminatable
//! or abortable, fires the resulting operations as tasks, and goes back to
//! sleep on the loop channel. State transitions happen only here, when an
//! operation's completion event is applied, so they are serialized even
//! though the operations themselves overlap.

use super::{
    RunConfig, RunnerHandle,
    handle::RunnerShared,
    internal_events::{SchedulerEvent, StartResult},
};
use crate::{
    component::{
        Binding, Bindings, BuildContext, Component, ComponentClass, ComponentContext, Need,
        NeedSpec, Suite,
    },
    errors::{DefinitionError, HarnessError, NodeFailure},
    graph::{NestedDef, NodeKind, NodeStatus, TestDef},
    host::local::LocalHostClass,
    logmux::{self, EventLogSink},
    protocol::Value,
    reporter::{NullReporter, Outcome, Reporter, RunError, RunStats},
};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    watch,
};
use tracing::{debug, warn};

/// The name of the implicit root suite.
pub const LOCALHOST: &str = "localhost";

/// Options for building a [`Runner`].
pub struct RunnerOpts {
    /// Receives the run's event stream. Defaults to a discarding reporter.
    pub reporter: Box<dyn Reporter>,
    /// Timeout around each test body.
    pub test_timeout: Duration,
    /// Timeout around each suite setUp and tearDown.
    pub suite_timeout: Duration,
    /// Per-run working directory; must not exist yet.
    pub tmp_dir: Utf8PathBuf,
    /// Report directory; must not exist yet. No reports when absent.
    pub report_dir: Option<Utf8PathBuf>,
}

impl RunnerOpts {
    /// Defaults: null reporter, 15 s test timeout, 60 s suite timeout, no
    /// report directory.
    pub fn new(tmp_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            reporter: Box::new(NullReporter),
            test_timeout: Duration::from_secs(15),
            suite_timeout: Duration::from_secs(60),
            tmp_dir: tmp_dir.into(),
            report_dir: None,
        }
    }

    /// Sets the reporter.
    pub fn reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sets the test timeout.
    pub fn test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Sets the suite timeout.
    pub fn suite_timeout(mut self, timeout: Duration) -> Self {
        self.suite_timeout = timeout;
        self
    }

    /// Sets the report directory.
    pub fn report_dir(mut self, report_dir: impl Into<Utf8PathBuf>) -> Self {
        self.report_dir = Some(report_dir.into());
        self
    }
}

/// The terminal picture of a run.
#[derive(Debug)]
pub struct RunSummary {
    /// Aggregate counters (tests only).
    pub stats: RunStats,
    /// Terminal classification per test node.
    pub outcomes: IndexMap<String, Outcome>,
    /// Failures worth reporting, tests and suites alike.
    pub errors: Vec<RunError>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunSummary {
    /// 0 iff every test ended `OK`, `UX-OK` or `XFAIL`; 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.outcomes.values().all(|outcome| outcome.is_success()) {
            0
        } else {
            1
        }
    }

    /// The outcome of one test node.
    pub fn outcome(&self, name: &str) -> Option<Outcome> {
        self.outcomes.get(name).copied()
    }
}

struct NodeState {
    class: Arc<dyn ComponentClass>,
    args: Vec<Value>,
    needs: Vec<String>,
    depends: Vec<String>,
    only_after: Vec<String>,
    dependents: Vec<String>,
    xfail: bool,
    skip: bool,
    status: NodeStatus,
    suite: Option<Arc<dyn Suite>>,
    failure: Option<Arc<NodeFailure>>,
    outcome: Option<Outcome>,
    children: BTreeSet<String>,
    /// Set for nodes spliced in from a nested definition; the parent's
    /// child gate is consulted before such a node may start.
    nested_parent: Option<String>,
    abort_tx: Option<watch::Sender<Option<String>>>,
    aborted: bool,
}

impl NodeState {
    fn new(class: Arc<dyn ComponentClass>, args: Vec<Value>, xfail: bool, skip: bool) -> Self {
        Self {
            class,
            args,
            needs: Vec::new(),
            depends: Vec::new(),
            only_after: Vec::new(),
            dependents: Vec::new(),
            xfail,
            skip,
            status: NodeStatus::Waiting,
            suite: None,
            failure: None,
            outcome: None,
            children: BTreeSet::new(),
            nested_parent: None,
            abort_tx: None,
            aborted: false,
        }
    }

    fn is_suite(&self) -> bool {
        self.class.kind() == NodeKind::Suite
    }
}

/// The core test runner: schedules the start and stop of every node.
///
/// A `Runner` value owns all mutable state of one run; concurrent runs are
/// independent.
pub struct Runner {
    reporter: Box<dyn Reporter>,
    test_timeout: Duration,
    suite_timeout: Duration,
    tmp_dir: Utf8PathBuf,
    report_dir: Option<Utf8PathBuf>,
    states: IndexMap<String, NodeState>,
    shared: Arc<RunnerShared>,
    events_tx: UnboundedSender<SchedulerEvent>,
    events_rx: UnboundedReceiver<SchedulerEvent>,
    in_flight: usize,
}

impl Runner {
    /// Creates the run directories and the local event log. Both the tmp
    /// and report directories must not pre-exist.
    pub fn new(opts: RunnerOpts) -> Result<Self, HarnessError> {
        let tmp_dir = absolutize(opts.tmp_dir)?;
        if tmp_dir.exists() {
            return Err(HarnessError::TmpDirExists(tmp_dir));
        }
        let report_dir = match opts.report_dir {
            Some(report_dir) => {
                let report_dir = absolutize(report_dir)?;
                if report_dir.exists() {
                    return Err(HarnessError::ReportDirExists(report_dir));
                }
                Some(report_dir)
            }
            None => None,
        };

        std::fs::create_dir_all(tmp_dir.as_std_path()).map_err(HarnessError::Setup)?;
        if let Some(report_dir) = &report_dir {
            std::fs::create_dir_all(report_dir.as_std_path()).map_err(HarnessError::Setup)?;
        }

        let sink =
            EventLogSink::new(&tmp_dir, report_dir.clone()).map_err(HarnessError::Setup)?;
        let mut host_logs = IndexMap::new();
        host_logs.insert(LOCALHOST.to_owned(), logmux::local_log_path(&tmp_dir));

        let (events_tx, events_rx) = unbounded_channel();
        let shared = Arc::new(RunnerShared {
            tmp_dir: tmp_dir.clone(),
            config: Mutex::new(RunConfig::new()),
            evlog: Mutex::new(Some(sink)),
            host_logs: Mutex::new(host_logs),
        });

        Ok(Self {
            reporter: opts.reporter,
            test_timeout: opts.test_timeout,
            suite_timeout: opts.suite_timeout,
            tmp_dir,
            report_dir,
            states: IndexMap::new(),
            shared,
            events_tx,
            events_rx,
            in_flight: 0,
        })
    }

    /// A handle components use to reach this run.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            tx: self.events_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs a definition to completion on an existing runtime.
    pub async fn run(
        mut self,
        tdef: TestDef,
        config: RunConfig,
    ) -> Result<RunSummary, HarnessError> {
        let started_at = Instant::now();
        self.reporter.begin(&tdef);
        *self.shared.config.lock().expect("config lock poisoned") = config;

        self.insert_root()?;
        if let Err(err) = self.parse_test_def(&tdef, None) {
            let err = HarnessError::from(err);
            self.reporter.harness_failure(&err);
            return Err(err);
        }

        loop {
            self.iterate();
            if self.in_flight == 0 {
                break;
            }
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.apply(event);
        }
        // Log lines may still sit in the channel behind the last state
        // change.
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply(event);
        }

        Ok(self.finish(started_at))
    }

    /// Builds a current-thread runtime and runs to completion.
    pub fn execute(self, tdef: TestDef, config: RunConfig) -> Result<RunSummary, HarnessError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(HarnessError::Setup)?;
        runtime.block_on(self.run(tdef, config))
    }

    fn insert_root(&mut self) -> Result<(), HarnessError> {
        let class: Arc<dyn ComponentClass> = Arc::new(LocalHostClass);
        let built = class.build(BuildContext {
            name: LOCALHOST.to_owned(),
            args: Vec::new(),
            bindings: Bindings::default(),
            handle: self.handle(),
        });
        let suite = match built {
            Ok(Component::Suite(suite)) => suite,
            _ => {
                return Err(HarnessError::Internal(
                    "the root suite failed to build".to_owned(),
                ));
            }
        };
        let mut state = NodeState::new(class, Vec::new(), false, false);
        state.status = NodeStatus::Running;
        state.suite = Some(suite);
        self.states.insert(LOCALHOST.to_owned(), state);
        Ok(())
    }

    // ---
    // Definition parsing and nested splicing
    // ---

    fn parse_test_def(
        &mut self,
        tdef: &TestDef,
        parent: Option<&str>,
    ) -> Result<(), DefinitionError> {
        for (local, def) in tdef {
            let name = qualify(parent, local);
            if self.states.contains_key(&name) {
                return Err(DefinitionError::DuplicateName(name));
            }
            self.states.insert(
                name,
                NodeState::new(
                    Arc::clone(&def.class),
                    def.args.clone(),
                    def.xfail,
                    def.skip,
                ),
            );
        }

        for (local, def) in tdef {
            let name = qualify(parent, local);
            for target in &def.uses {
                let target = self.resolve_ref(&name, target, parent)?;
                self.add_edge(&name, &target, EdgeKind::Need);
            }
            for target in &def.depends {
                let target = self.resolve_ref(&name, target, parent)?;
                self.add_edge(&name, &target, EdgeKind::Ordering);
            }
            for target in &def.only_after {
                let target = self.resolve_ref(&name, target, parent)?;
                self.add_edge(&name, &target, EdgeKind::OnlyAfter);
            }
        }
        Ok(())
    }

    fn resolve_ref(
        &self,
        node: &str,
        target: &str,
        parent: Option<&str>,
    ) -> Result<String, DefinitionError> {
        if let Some(parent) = parent {
            let prefixed = format!("{parent}.{target}");
            if self.states.contains_key(&prefixed) {
                return Ok(prefixed);
            }
        }
        if self.states.contains_key(target) {
            return Ok(target.to_owned());
        }
        Err(DefinitionError::UnknownReference {
            node: node.to_owned(),
            target: target.to_owned(),
        })
    }

    fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        {
            let state = self.states.get_mut(from).expect("edge source exists");
            let list = match kind {
                EdgeKind::Need => &mut state.needs,
                EdgeKind::Ordering => &mut state.depends,
                EdgeKind::OnlyAfter => &mut state.only_after,
            };
            list.push(to.to_owned());
        }
        if !matches!(kind, EdgeKind::OnlyAfter) {
            let target = self.states.get_mut(to).expect("edge target exists");
            if !target.dependents.iter().any(|d| d == from) {
                target.dependents.push(from.to_owned());
            }
        }
    }

    /// Splices a nested definition under `parent`, making every nested
    /// node depend on the parent and every existing dependent of the
    /// parent depend on the nested leaves. Runs atomically between the
    /// parent's setUp returning and the parent being marked running.
    fn splice_nested(
        &mut self,
        parent: &str,
        nested: NestedDef,
    ) -> Result<(), DefinitionError> {
        let outer_dependents: Vec<String> = self
            .states
            .get(parent)
            .expect("parent state exists")
            .dependents
            .clone();

        self.parse_test_def(&nested.def, Some(parent))?;

        let leaves: Vec<String> = nested
            .leaves
            .iter()
            .map(|leaf| format!("{parent}.{leaf}"))
            .collect();
        for leaf in &leaves {
            if !self.states.contains_key(leaf) {
                return Err(DefinitionError::UnknownReference {
                    node: parent.to_owned(),
                    target: leaf.clone(),
                });
            }
        }

        for dependent in &outer_dependents {
            for leaf in &leaves {
                self.add_edge(dependent, leaf, EdgeKind::Ordering);
            }
        }

        for local in nested.def.keys() {
            let full = format!("{parent}.{local}");
            self.add_edge(&full, parent, EdgeKind::Ordering);
            self.states
                .get_mut(&full)
                .expect("nested state exists")
                .nested_parent = Some(parent.to_owned());
        }
        Ok(())
    }

    // ---
    // Classification and the turn loop
    // ---

    fn classify(&self) -> Classified {
        let mut classified = Classified::default();
        for (name, state) in &self.states {
            if state.status.is_terminal() {
                continue;
            }

            let mut unready = 0usize;
            let mut failed = 0usize;
            let mut done_dependents = 0usize;

            for dependent in &state.dependents {
                if self.status_of(dependent).is_terminal() {
                    done_dependents += 1;
                }
            }

            for dep in &state.needs {
                let dep_state = self.states.get(dep).expect("dependency state exists");
                match dep_state.status {
                    NodeStatus::Waiting | NodeStatus::Starting | NodeStatus::Stopping => {
                        unready += 1;
                    }
                    NodeStatus::Failed => failed += 1,
                    NodeStatus::Done => {
                        debug!(
                            node = name.as_str(),
                            dep = dep.as_str(),
                            "need already done; dependent will not be able to bind it"
                        );
                    }
                    NodeStatus::Running => {
                        let ready = dep_state
                            .suite
                            .as_ref()
                            .is_none_or(|suite| suite.ready_for_child(name));
                        if !ready {
                            unready += 1;
                        }
                    }
                }
            }

            // Plain ordering edges are weaker than needs: the target only
            // has to be past starting. No child gating either; ordering
            // dependents are never registered as children.
            for dep in &state.depends {
                match self.status_of(dep) {
                    NodeStatus::Waiting | NodeStatus::Starting => unready += 1,
                    NodeStatus::Failed => failed += 1,
                    _ => {}
                }
            }

            // A nested child additionally waits for its parent's child
            // gate.
            if let Some(parent) = &state.nested_parent {
                if let Some(parent_state) = self.states.get(parent) {
                    if parent_state.status == NodeStatus::Running {
                        let ready = parent_state
                            .suite
                            .as_ref()
                            .is_none_or(|suite| suite.ready_for_child(name));
                        if !ready {
                            unready += 1;
                        }
                    }
                }
            }

            for dep in &state.only_after {
                match self.status_of(dep) {
                    NodeStatus::Failed => failed += 1,
                    NodeStatus::Done => {}
                    _ => unready += 1,
                }
            }

            let startable = matches!(
                state.status,
                NodeStatus::Waiting | NodeStatus::Starting | NodeStatus::Running
            );
            if startable && failed > 0 {
                classified.abortable.push(name.clone());
            } else if state.status == NodeStatus::Waiting && unready == 0 {
                classified.runnable.push(name.clone());
            } else if state.status == NodeStatus::Running
                && state.is_suite()
                && done_dependents == state.dependents.len()
            {
                classified.terminatable.push(name.clone());
            }
        }
        classified
    }

    fn status_of(&self, name: &str) -> NodeStatus {
        self.states
            .get(name)
            .map(|state| state.status)
            .unwrap_or(NodeStatus::Done)
    }

    /// One scheduler turn: classify and fire until nothing more can be
    /// decided without an operation completing.
    fn iterate(&mut self) {
        loop {
            let classified = self.classify();
            if classified.is_empty() {
                return;
            }

            let mut transitioned = false;
            for name in &classified.abortable {
                transitioned |= self.process_abort(name);
            }
            for name in &classified.terminatable {
                self.start_teardown(name);
            }
            for name in &classified.runnable {
                transitioned |= self.try_start(name);
            }
            if !transitioned {
                return;
            }
        }
    }

    fn apply(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Log(msg) => self.reporter.log(&msg),
            SchedulerEvent::StartFinished { name, result } => {
                self.in_flight -= 1;
                match result {
                    StartResult::SuiteUp { nested } => self.finish_suite_up(&name, nested),
                    StartResult::SuiteFailed(failure) => {
                        self.finish_suite_failed(&name, failure);
                    }
                    StartResult::TestFinished(result) => self.finish_test(&name, result),
                }
            }
            SchedulerEvent::TeardownFinished { name, result } => {
                self.in_flight -= 1;
                self.finish_teardown(&name, result);
            }
        }
    }

    // ---
    // Aborts
    // ---

    /// Handles one abortable node. Waiting nodes terminate right away as
    /// `UX-SKIP`; started nodes get their in-flight operation cancelled
    /// and their abort hooks fired, and terminate through the normal
    /// completion path.
    fn process_abort(&mut self, name: &str) -> bool {
        let Some(cause) = self.first_failed_dependency(name) else {
            return false;
        };
        let status = self.status_of(name);
        match status {
            NodeStatus::Waiting => {
                let failure = Arc::new(NodeFailure::UnableToRun {
                    missing: cause.clone(),
                });
                let state = self.states.get_mut(name).expect("node state exists");
                state.status = NodeStatus::Done;
                state.failure = Some(Arc::clone(&failure));
                state.outcome = Some(Outcome::UxSkip);
                self.reporter
                    .stop_test(name, Outcome::UxSkip, Some(&failure));
                true
            }
            NodeStatus::Starting | NodeStatus::Running => {
                self.signal_abort(name, &cause);
                false
            }
            _ => false,
        }
    }

    fn first_failed_dependency(&self, name: &str) -> Option<String> {
        let state = self.states.get(name)?;
        state
            .needs
            .iter()
            .chain(&state.depends)
            .chain(&state.only_after)
            .find(|dep| self.status_of(dep) == NodeStatus::Failed)
            .cloned()
    }

    /// Cancels a node's in-flight operation, fires its abort hook, and
    /// recursively does the same to its live children.
    fn signal_abort(&mut self, name: &str, cause: &str) {
        let (suite, children) = {
            let Some(state) = self.states.get_mut(name) else {
                return;
            };
            if state.aborted {
                return;
            }
            state.aborted = true;
            if let Some(abort_tx) = &state.abort_tx {
                let _ = abort_tx.send(Some(cause.to_owned()));
            }
            (
                state.suite.clone(),
                state.children.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(suite) = suite {
            suite.abort();
        }
        for child in children {
            self.signal_abort(&child, cause);
        }
    }

    // ---
    // Starting nodes
    // ---

    fn try_start(&mut self, name: &str) -> bool {
        if self.status_of(name) != NodeStatus::Waiting {
            return false;
        }
        match self.prepare_start(name) {
            Ok(Some(plan)) => {
                self.launch(name, plan);
                false
            }
            // A gate (readyForChild) closed between classification and
            // start; the node stays waiting for a later turn.
            Ok(None) => false,
            Err(failure) => {
                self.finish_startup_failed(name, failure);
                true
            }
        }
    }

    fn prepare_start(&mut self, name: &str) -> Result<Option<Component>, NodeFailure> {
        let (class, needs, args) = {
            let state = self.states.get(name).expect("node state exists");
            if state.skip {
                return Err(NodeFailure::skipped(format!(
                    "node {name} got skipped intentionally"
                )));
            }
            (
                Arc::clone(&state.class),
                state.needs.clone(),
                state.args.clone(),
            )
        };

        let chosen = self.match_needs(name, class.as_ref(), &needs)?;

        if args.len() != class.arg_count() {
            return Err(DefinitionError::ArgCountMismatch {
                class: class.name().to_owned(),
                node: name.to_owned(),
                expected: class.arg_count(),
                actual: args.len(),
            }
            .into());
        }

        // The parent's child gate is consulted before a nested child may
        // start; re-check it here for the same reason the provider gates
        // are re-checked below.
        let nested_parent = self
            .states
            .get(name)
            .and_then(|state| state.nested_parent.clone());
        if let Some(parent) = nested_parent {
            if let Some(parent_state) = self.states.get(&parent) {
                if parent_state.status == NodeStatus::Running {
                    let ready = parent_state
                        .suite
                        .as_ref()
                        .is_none_or(|suite| suite.ready_for_child(name));
                    if !ready {
                        return Ok(None);
                    }
                }
            }
        }

        // Bind every need to its (running) provider, re-checking the
        // provider's child gate: an earlier start in this same turn may
        // have closed it.
        let mut bindings = Bindings::default();
        for (need, provider) in chosen.iter().zip(&needs) {
            let provider_state = self.states.get(provider).expect("provider state exists");
            let suite = match (&provider_state.suite, provider_state.status) {
                (Some(suite), NodeStatus::Running) => Arc::clone(suite),
                _ => {
                    return Err(NodeFailure::UnableToRun {
                        missing: provider.clone(),
                    });
                }
            };
            if !suite.ready_for_child(name) {
                return Ok(None);
            }
            let handle =
                suite
                    .provide(need.capability)
                    .ok_or(DefinitionError::CapabilityNotImplemented {
                        node: name.to_owned(),
                        provider: provider.clone(),
                        capability: need.capability.name(),
                    })?;
            bindings.insert(
                need.binding,
                Binding {
                    provider: provider.clone(),
                    handle,
                },
            );
        }

        let component = class.build(BuildContext {
            name: name.to_owned(),
            args,
            bindings,
            handle: self.handle(),
        })?;

        // The new node becomes a live child of each provider.
        let unique_providers: BTreeSet<String> = needs.iter().cloned().collect();
        for provider in unique_providers {
            let state = self.states.get_mut(&provider).expect("provider state exists");
            if state.children.insert(name.to_owned()) {
                if let Some(suite) = state.suite.clone() {
                    suite.child_added(name);
                }
            }
        }

        Ok(Some(component))
    }

    /// Resolves the class's need spec against the supplied uses list.
    fn match_needs(
        &self,
        name: &str,
        class: &dyn ComponentClass,
        needs: &[String],
    ) -> Result<Vec<Need>, NodeFailure> {
        match class.needs() {
            NeedSpec::Fixed(tuple) => {
                if needs.len() < tuple.len() {
                    // A need with no supplied provider: the node cannot
                    // run, but the definition as such is not malformed.
                    return Err(NodeFailure::UnableToRun {
                        missing: tuple[needs.len()].binding.to_owned(),
                    });
                }
                if needs.len() > tuple.len() {
                    return Err(DefinitionError::NeedCountMismatch {
                        class: class.name().to_owned(),
                        node: name.to_owned(),
                        expected: tuple.len(),
                        actual: needs.len(),
                    }
                    .into());
                }
                self.check_capabilities(name, &tuple, needs)?;
                Ok(tuple)
            }
            NeedSpec::OneOf(alternatives) => {
                let mut matching = Vec::new();
                for alternative in &alternatives {
                    if alternative.len() == needs.len()
                        && self.check_capabilities(name, alternative, needs).is_ok()
                    {
                        matching.push(alternative.clone());
                    }
                }
                match matching.len() {
                    0 => Err(DefinitionError::NoMatchingNeeds {
                        class: class.name().to_owned(),
                        node: name.to_owned(),
                        alternatives: alternatives.len(),
                    }
                    .into()),
                    1 => Ok(matching.remove(0)),
                    matched => Err(DefinitionError::AmbiguousNeeds {
                        class: class.name().to_owned(),
                        node: name.to_owned(),
                        alternatives: alternatives.len(),
                        matched,
                    }
                    .into()),
                }
            }
        }
    }

    fn check_capabilities(
        &self,
        name: &str,
        tuple: &[Need],
        needs: &[String],
    ) -> Result<(), DefinitionError> {
        for (need, provider) in tuple.iter().zip(needs) {
            let provider_state = self.states.get(provider).expect("provider state exists");
            if !provider_state
                .class
                .capabilities()
                .contains(&need.capability)
            {
                return Err(DefinitionError::CapabilityNotImplemented {
                    node: name.to_owned(),
                    provider: provider.clone(),
                    capability: need.capability.name(),
                });
            }
        }
        Ok(())
    }

    fn launch(&mut self, name: &str, component: Component) {
        let (abort_tx, abort_rx) = watch::channel(None);
        let cx = ComponentContext::new(name.to_owned(), self.handle());
        let events_tx = self.events_tx.clone();
        let name_owned = name.to_owned();

        match component {
            Component::Suite(suite) => {
                {
                    let state = self.states.get_mut(name).expect("node state exists");
                    state.status = NodeStatus::Starting;
                    state.suite = Some(Arc::clone(&suite));
                    state.abort_tx = Some(abort_tx);
                }
                self.reporter.start_set_up_suite(name);
                let timeout = self.suite_timeout;
                self.in_flight += 1;
                tokio::spawn(async move {
                    let set_up = suite.set_up(&cx);
                    let result =
                        with_abort_and_timeout(abort_rx, timeout, "suite setUp timed out", set_up)
                            .await;
                    let result = match result {
                        Ok(nested) => StartResult::SuiteUp { nested },
                        Err(failure) => StartResult::SuiteFailed(failure),
                    };
                    let _ = events_tx.send(SchedulerEvent::StartFinished {
                        name: name_owned,
                        result,
                    });
                });
            }
            Component::Test(mut test) => {
                {
                    let state = self.states.get_mut(name).expect("node state exists");
                    state.status = NodeStatus::Running;
                    state.abort_tx = Some(abort_tx);
                }
                self.reporter.start_test(name);
                let timeout = self.test_timeout;
                self.in_flight += 1;
                tokio::spawn(async move {
                    let run = test.run(&cx);
                    let result =
                        with_abort_and_timeout(abort_rx, timeout, "test run timed out", run).await;
                    let _ = events_tx.send(SchedulerEvent::StartFinished {
                        name: name_owned,
                        result: StartResult::TestFinished(result),
                    });
                });
            }
        }
    }

    // ---
    // Completions
    // ---

    fn finish_suite_up(&mut self, name: &str, nested: Option<NestedDef>) {
        if let Some(nested) = nested {
            if let Err(err) = self.splice_nested(name, nested) {
                self.finish_suite_failed(name, err.into());
                return;
            }
        }
        {
            let state = self.states.get_mut(name).expect("node state exists");
            state.status = NodeStatus::Running;
            state.abort_tx = None;
        }
        self.reporter.stop_set_up_suite(name);
    }

    fn finish_suite_failed(&mut self, name: &str, failure: NodeFailure) {
        let failure = Arc::new(failure);
        {
            let state = self.states.get_mut(name).expect("node state exists");
            state.status = NodeStatus::Failed;
            state.failure = Some(Arc::clone(&failure));
            state.abort_tx = None;
            state.suite = None;
        }
        self.reporter.stop_set_up_suite(name);
        self.reporter.suite_set_up_failure(name, &failure);
        self.release_parents(name);
    }

    fn finish_test(&mut self, name: &str, result: Result<(), NodeFailure>) {
        let (outcome, failure) = {
            let state = self.states.get_mut(name).expect("node state exists");
            state.status = NodeStatus::Done;
            state.abort_tx = None;
            match result {
                Ok(()) => {
                    let outcome = if state.xfail {
                        Outcome::UxOk
                    } else {
                        Outcome::Ok
                    };
                    (outcome, None)
                }
                Err(failure) => {
                    let outcome = if state.xfail {
                        Outcome::Xfail
                    } else if matches!(failure, NodeFailure::Timeout { .. }) {
                        Outcome::Timeout
                    } else {
                        Outcome::Failed
                    };
                    let failure = Arc::new(failure);
                    state.failure = Some(Arc::clone(&failure));
                    (outcome, Some(failure))
                }
            }
        };
        self.states
            .get_mut(name)
            .expect("node state exists")
            .outcome = Some(outcome);
        self.release_parents(name);
        self.reporter.stop_test(name, outcome, failure.as_deref());
    }

    fn finish_startup_failed(&mut self, name: &str, failure: NodeFailure) {
        let outcome = match &failure {
            NodeFailure::Skipped { .. } => Outcome::Skipped,
            NodeFailure::UnableToRun { .. } => Outcome::UxSkip,
            NodeFailure::Timeout { .. } => Outcome::Timeout,
            _ => Outcome::Error,
        };
        debug!(node = name, %failure, "node failed to start");
        let failure = Arc::new(failure);
        {
            let state = self.states.get_mut(name).expect("node state exists");
            state.status = NodeStatus::Done;
            state.failure = Some(Arc::clone(&failure));
            state.outcome = Some(outcome);
        }
        self.release_parents(name);
        self.reporter.stop_test(name, outcome, Some(&failure));
    }

    // ---
    // Teardown
    // ---

    fn start_teardown(&mut self, name: &str) {
        let suite = {
            let Some(state) = self.states.get_mut(name) else {
                return;
            };
            if state.status != NodeStatus::Running {
                return;
            }
            state.status = NodeStatus::Stopping;
            state.suite.clone()
        };
        let Some(suite) = suite else {
            // A running suite without an instance is an internal
            // inconsistency; close it out rather than wedging the run.
            self.finish_teardown(
                name,
                Err(NodeFailure::Harness(
                    "running suite has no implementation instance".to_owned(),
                )),
            );
            return;
        };

        self.reporter.start_tear_down_suite(name);
        let cx = ComponentContext::new(name.to_owned(), self.handle());
        let events_tx = self.events_tx.clone();
        let name_owned = name.to_owned();
        let timeout = self.suite_timeout;
        self.in_flight += 1;
        tokio::spawn(async move {
            let tear_down = suite.tear_down(&cx);
            let result = match tokio::time::timeout(timeout, tear_down).await {
                Ok(result) => result,
                Err(_) => Err(NodeFailure::Timeout {
                    what: "suite tearDown timed out".to_owned(),
                }),
            };
            let _ = events_tx.send(SchedulerEvent::TeardownFinished {
                name: name_owned,
                result,
            });
        });
    }

    fn finish_teardown(&mut self, name: &str, result: Result<(), NodeFailure>) {
        self.release_parents(name);
        let failure = {
            let state = self.states.get_mut(name).expect("node state exists");
            state.status = NodeStatus::Done;
            state.suite = None;
            match result {
                Ok(()) => None,
                Err(failure) => {
                    let failure = Arc::new(failure);
                    state.failure = Some(Arc::clone(&failure));
                    Some(failure)
                }
            }
        };
        self.reporter.stop_tear_down_suite(name);
        if let Some(failure) = failure {
            self.reporter.suite_tear_down_failure(name, &failure);
        }
    }

    /// Removes this node from the live-children sets of the suites its
    /// needs were bound to.
    fn release_parents(&mut self, name: &str) {
        let providers: BTreeSet<String> = self
            .states
            .get(name)
            .map(|state| state.needs.iter().cloned().collect())
            .unwrap_or_default();
        for provider in providers {
            let Some(state) = self.states.get_mut(&provider) else {
                continue;
            };
            if state.children.remove(name) {
                if let Some(suite) = state.suite.clone() {
                    suite.child_removed(name);
                }
            }
        }
    }

    // ---
    // Run end
    // ---

    fn finish(&mut self, started_at: Instant) -> RunSummary {
        let stragglers: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| !state.status.is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        for name in stragglers {
            warn!(
                node = name.as_str(),
                "node never reached a terminal state; reporting as skipped"
            );
            let state = self.states.get_mut(&name).expect("node state exists");
            state.status = NodeStatus::Done;
            state.outcome = Some(Outcome::Skipped);
            self.reporter.stop_test(&name, Outcome::Skipped, None);
        }

        let mut stats = RunStats::default();
        let mut errors = Vec::new();
        let mut outcomes = IndexMap::new();
        for (name, state) in &self.states {
            let is_suite = state.is_suite();
            if let Some(failure) = &state.failure {
                if matches!(**failure, NodeFailure::Skipped { .. }) {
                    if !is_suite {
                        stats.skipped += 1;
                    }
                } else if state.xfail {
                    if !is_suite {
                        stats.xfail += 1;
                    }
                } else {
                    errors.push(RunError {
                        name: name.clone(),
                        kind: state.class.kind(),
                        failure: Arc::clone(failure),
                    });
                }
            } else if !is_suite {
                stats.succ += 1;
            }
            if !is_suite {
                stats.total += 1;
                if let Some(outcome) = state.outcome {
                    outcomes.insert(name.clone(), outcome);
                }
            }
        }

        let duration = started_at.elapsed();
        self.reporter.end(duration, &stats, &errors);

        // Flush the local log, then merge everything into the report dir.
        *self.shared.evlog.lock().expect("event log lock poisoned") = None;
        if let Some(report_dir) = &self.report_dir {
            let host_logs = self
                .shared
                .host_logs
                .lock()
                .expect("host log lock poisoned")
                .clone();
            if let Err(err) = logmux::merge_logs(&host_logs, report_dir) {
                warn!(%err, "unable to merge event logs");
            }
        }

        let summary = RunSummary {
            stats,
            outcomes,
            errors,
            duration,
        };
        if summary.exit_code() == 0 {
            let _ = std::fs::remove_dir_all(self.tmp_dir.as_std_path());
        }
        summary
    }
}

#[derive(Default)]
struct Classified {
    runnable: Vec<String>,
    terminatable: Vec<String>,
    abortable: Vec<String>,
}

impl Classified {
    fn is_empty(&self) -> bool {
        self.runnable.is_empty() && self.terminatable.is_empty() && self.abortable.is_empty()
    }
}

enum EdgeKind {
    Need,
    Ordering,
    OnlyAfter,
}

fn qualify(parent: Option<&str>, local: &str) -> String {
    match parent {
        Some(parent) => format!("{parent}.{local}"),
        None => local.to_owned(),
    }
}

fn absolutize(path: Utf8PathBuf) -> Result<Utf8PathBuf, HarnessError> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().map_err(HarnessError::Setup)?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| HarnessError::Internal(format!("non-UTF-8 working directory: {p:?}")))?;
    Ok(cwd.join(path))
}

/// Wraps an operation so the first of {abort, expiry, completion} wins;
/// late completions are dropped with the future.
async fn with_abort_and_timeout<T>(
    mut abort_rx: watch::Receiver<Option<String>>,
    timeout: Duration,
    what: &str,
    operation: impl Future<Output = Result<T, NodeFailure>>,
) -> Result<T, NodeFailure> {
    tokio::select! {
        changed = abort_rx.wait_for(Option::is_some) => {
            let cause = changed
                .ok()
                .and_then(|guard| guard.clone())
                .unwrap_or_default();
            Err(NodeFailure::Aborted { cause })
        }
        completed = tokio::time::timeout(timeout, operation) => match completed {
            Ok(result) => result,
            Err(_) => Err(NodeFailure::Timeout {
                what: what.to_owned(),
            }),
        }
    }
}
