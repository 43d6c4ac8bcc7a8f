// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The component traits: what user-supplied suites and tests implement.
//!
//! A node's class is a [`ComponentClass`]: a factory that declares the
//! class's kind, capabilities, needs and arity, and builds the
//! implementation instance once the scheduler has bound every need to a
//! running suite. Suites are shared (`Arc<dyn Suite>`, interior
//! mutability); tests are owned and run once.

use crate::{
    errors::NodeFailure,
    graph::{Capability, NestedDef, NodeKind},
    protocol::Value,
    runner::RunnerHandle,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::{
    any::Any,
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

/// One capability-typed dependency slot: a local binding name and the
/// capability the bound node must declare.
#[derive(Clone, Copy, Debug)]
pub struct Need {
    /// Name under which the bound suite appears in [`Bindings`].
    pub binding: &'static str,
    /// The capability the provider must declare.
    pub capability: Capability,
}

impl Need {
    /// Declares a need.
    pub const fn new(binding: &'static str, capability: Capability) -> Self {
        Self {
            binding,
            capability,
        }
    }
}

/// A class's declared needs: one fixed tuple, or a set of alternatives of
/// which exactly one must match the supplied uses list.
#[derive(Clone, Debug)]
pub enum NeedSpec {
    /// A single tuple that must match.
    Fixed(Vec<Need>),
    /// Alternatives; exactly one must match, anything else is a definition
    /// error.
    OneOf(Vec<Vec<Need>>),
}

impl NeedSpec {
    /// A spec with no needs at all.
    pub fn none() -> Self {
        NeedSpec::Fixed(Vec::new())
    }
}

/// An opaque capability value handed from a providing suite to a consumer,
/// which downcasts it to the concrete handle type the capability implies.
pub type CapabilityHandle = Arc<dyn Any + Send + Sync>;

/// A built node implementation.
pub enum Component {
    /// A one-shot test.
    Test(Box<dyn Test>),
    /// A long-lived suite.
    Suite(Arc<dyn Suite>),
}

/// The class (factory) side of a component.
pub trait ComponentClass: Send + Sync {
    /// The class name, used in error messages.
    fn name(&self) -> &'static str;

    /// Whether instances are tests or suites.
    fn kind(&self) -> NodeKind;

    /// The capabilities instances declare. Matching is by identity.
    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    /// The declared needs.
    fn needs(&self) -> NeedSpec {
        NeedSpec::none()
    }

    /// The number of positional arguments instances take.
    fn arg_count(&self) -> usize {
        0
    }

    /// Builds an instance. Every need is already bound to a running suite.
    fn build(&self, cx: BuildContext) -> Result<Component, NodeFailure>;
}

/// Whether a class declares the given capability.
pub fn implements(class: &dyn ComponentClass, capability: Capability) -> bool {
    class.capabilities().contains(&capability)
}

/// One resolved need: who provides it and the capability value.
pub struct Binding {
    /// The providing node's name.
    pub provider: String,
    /// The capability value, downcast by the consumer.
    pub handle: CapabilityHandle,
}

/// The resolved needs of a node, keyed by binding name.
#[derive(Default)]
pub struct Bindings {
    map: IndexMap<String, Binding>,
}

impl Bindings {
    pub(crate) fn insert(&mut self, name: impl Into<String>, binding: Binding) {
        self.map.insert(name.into(), binding);
    }

    /// Whether a binding with this name was resolved. Classes with
    /// disjunctive needs use this to find out which alternative matched.
    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// The name of the node providing a binding.
    pub fn provider(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(|b| b.provider.as_str())
    }

    /// Downcasts a binding to the concrete capability handle type.
    pub fn get<T: Clone + 'static>(&self, name: &str) -> Result<T, NodeFailure> {
        let binding = self.map.get(name).ok_or_else(|| NodeFailure::UnableToRun {
            missing: name.to_owned(),
        })?;
        binding
            .handle
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| {
                NodeFailure::Harness(format!(
                    "binding `{name}` does not carry the expected capability type"
                ))
            })
    }
}

/// Everything a class needs to build an instance.
pub struct BuildContext {
    /// The node's fully qualified name.
    pub name: String,
    /// Positional arguments from the definition.
    pub args: Vec<Value>,
    /// Resolved needs.
    pub bindings: Bindings,
    /// Handle into the runner for logging, temp paths and config.
    pub handle: RunnerHandle,
}

impl BuildContext {
    /// The string argument at `index`.
    pub fn arg_str(&self, index: usize) -> Result<&str, NodeFailure> {
        self.args
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NodeFailure::Harness(format!(
                    "argument {index} of `{}` is not a string",
                    self.name
                ))
            })
    }

    /// The integer argument at `index`.
    pub fn arg_int(&self, index: usize) -> Result<i64, NodeFailure> {
        self.args
            .get(index)
            .and_then(Value::as_int)
            .ok_or_else(|| {
                NodeFailure::Harness(format!(
                    "argument {index} of `{}` is not an integer",
                    self.name
                ))
            })
    }
}

/// Per-call context handed to suite lifecycle methods and test bodies.
pub struct ComponentContext {
    name: String,
    handle: RunnerHandle,
}

impl ComponentContext {
    pub(crate) fn new(name: String, handle: RunnerHandle) -> Self {
        Self { name, handle }
    }

    /// The node's fully qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runner handle.
    pub fn handle(&self) -> &RunnerHandle {
        &self.handle
    }

    /// Reports a line through the reporter.
    pub fn log(&self, msg: impl Into<String>) {
        self.handle.log(msg);
    }

    /// Suspends the caller cooperatively.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A long-lived node: brought up, exposes capabilities, torn down.
#[async_trait]
pub trait Suite: Send + Sync {
    /// Brings the suite up. May return a nested test definition, which the
    /// scheduler splices under this suite's name before marking it running.
    async fn set_up(&self, _cx: &ComponentContext) -> Result<Option<NestedDef>, NodeFailure> {
        Ok(None)
    }

    /// Tears the suite down. Runs once no dependents remain.
    async fn tear_down(&self, _cx: &ComponentContext) -> Result<(), NodeFailure> {
        Ok(())
    }

    /// Consulted by the scheduler before a dependent (or nested child) may
    /// start. Default: always ready.
    fn ready_for_child(&self, _child: &str) -> bool {
        true
    }

    /// A dependent bound to this suite started.
    fn child_added(&self, _child: &str) {}

    /// A dependent bound to this suite terminated.
    fn child_removed(&self, _child: &str) {}

    /// Returns the capability value for one of this class's declared
    /// capabilities.
    fn provide(&self, _capability: Capability) -> Option<CapabilityHandle> {
        None
    }

    /// Abort hook: the node is being cancelled because a dependency failed.
    /// Implementations cancel internal waits; in-flight lifecycle calls are
    /// cancelled by the scheduler itself.
    fn abort(&self) {}
}

/// A one-shot node. The body runs exactly once, under the run's test
/// timeout.
#[async_trait]
pub trait Test: Send {
    /// The test body.
    async fn run(&mut self, cx: &ComponentContext) -> Result<(), NodeFailure>;
}

/// Adapter for test bodies that cannot be written cooperatively: the
/// closure runs on a worker thread while timeouts stay enforced from the
/// loop.
pub struct BlockingTest {
    body: Option<Box<dyn FnOnce() -> Result<(), NodeFailure> + Send>>,
}

impl BlockingTest {
    /// Wraps a synchronous body.
    pub fn new(body: impl FnOnce() -> Result<(), NodeFailure> + Send + 'static) -> Self {
        Self {
            body: Some(Box::new(body)),
        }
    }
}

#[async_trait]
impl Test for BlockingTest {
    async fn run(&mut self, _cx: &ComponentContext) -> Result<(), NodeFailure> {
        let body = self
            .body
            .take()
            .ok_or_else(|| NodeFailure::Harness("blocking test body ran twice".to_owned()))?;
        match tokio::task::spawn_blocking(body).await {
            Ok(result) => result,
            Err(_) => Err(NodeFailure::Harness(
                "blocking test body panicked".to_owned(),
            )),
        }
    }
}

/// Occupancy latch for resource suites, which admit at most one child at a
/// time. Embed one and delegate `ready_for_child`, `child_added` and
/// `child_removed` to it.
#[derive(Default)]
pub struct ResourceGate {
    occupants: Mutex<BTreeSet<String>>,
}

impl ResourceGate {
    /// An empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the gate admits another child.
    pub fn is_free(&self) -> bool {
        self.occupants.lock().expect("gate lock poisoned").is_empty()
    }

    /// Records an acquisition.
    pub fn acquire(&self, child: &str) {
        self.occupants
            .lock()
            .expect("gate lock poisoned")
            .insert(child.to_owned());
    }

    /// Records a release.
    pub fn release(&self, child: &str) {
        self.occupants
            .lock()
            .expect("gate lock poisoned")
            .remove(child);
    }

    /// The current number of occupants.
    pub fn occupant_count(&self) -> usize {
        self.occupants.lock().expect("gate lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_gate_tracks_occupancy() {
        let gate = ResourceGate::new();
        assert!(gate.is_free());
        gate.acquire("u1");
        assert!(!gate.is_free());
        assert_eq!(gate.occupant_count(), 1);
        gate.release("u1");
        assert!(gate.is_free());
    }

    #[test]
    fn bindings_downcast() {
        let mut bindings = Bindings::default();
        let value: Arc<String> = Arc::new("capability payload".to_owned());
        bindings.insert(
            "dep1",
            Binding {
                provider: "provider".to_owned(),
                handle: Arc::new(value) as CapabilityHandle,
            },
        );
        assert!(bindings.has("dep1"));
        assert!(!bindings.has("dep2"));
        assert_eq!(bindings.provider("dep1"), Some("provider"));
        let restored: Arc<String> = bindings.get("dep1").expect("downcasts");
        assert_eq!(*restored, "capability payload");
        assert!(bindings.get::<Arc<i64>>("dep1").is_err());
        assert!(matches!(
            bindings.get::<Arc<String>>("missing"),
            Err(NodeFailure::UnableToRun { .. })
        ));
    }
}
