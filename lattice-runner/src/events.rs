// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The event bus: process events, matchers and hook bookkeeping.
//!
//! An [`EventSource`] owns a set of hooks. Emitting an event enqueues it on
//! the channel of every hook whose matcher accepts it; delivery order per
//! source equals emission order. The source owns the hook records and hands
//! callers an opaque [`HookId`] used only for removal, which keeps the
//! source/hook reference graph acyclic.

use std::{
    collections::HashMap,
    sync::Mutex,
};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

/// An event emitted by a supervised process, local or remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk or line of standard output.
    Out {
        /// The output data. In line mode this includes the trailing newline.
        data: String,
    },

    /// A chunk or line of standard error.
    Err {
        /// The output data. In line mode this includes the trailing newline.
        data: String,
    },

    /// The process terminated.
    Ended {
        /// The exit code, with 0 substituted for signal deaths.
        exit_code: i32,
    },
}

impl ProcessEvent {
    /// The event-log channel this event is recorded under.
    pub fn channel(&self) -> &'static str {
        match self {
            ProcessEvent::Out { .. } => "out",
            ProcessEvent::Err { .. } => "err",
            ProcessEvent::Ended { .. } => "info",
        }
    }

    /// The stream data carried by this event, if it is a stream event.
    pub fn data(&self) -> Option<&str> {
        match self {
            ProcessEvent::Out { data } | ProcessEvent::Err { data } => Some(data),
            ProcessEvent::Ended { .. } => None,
        }
    }
}

/// The class of event a matcher selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    /// Standard-output stream events.
    StreamOut,
    /// Standard-error stream events.
    StreamErr,
    /// Stream events on either channel.
    AnyStream,
    /// Process termination.
    ProcessEnded,
}

/// Matches emitted events against an event class and an optional pattern.
///
/// For stream events the pattern is a substring test against the data; an
/// absent or empty pattern matches every event of the class. `ProcessEnded`
/// matchers ignore the pattern.
#[derive(Clone, Debug)]
pub struct EventMatcher {
    class: EventClass,
    pattern: Option<String>,
}

impl EventMatcher {
    /// Creates a matcher accepting every event of the given class.
    pub fn new(class: EventClass) -> Self {
        Self {
            class,
            pattern: None,
        }
    }

    /// Creates a matcher accepting events of the class whose data contains
    /// `pattern`.
    pub fn with_pattern(class: EventClass, pattern: impl Into<String>) -> Self {
        Self {
            class,
            pattern: Some(pattern.into()),
        }
    }

    /// The event class this matcher selects.
    pub fn class(&self) -> EventClass {
        self.class
    }

    /// The pattern, if one was supplied.
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    /// Whether this matcher accepts the given event.
    pub fn matches(&self, event: &ProcessEvent) -> bool {
        let class_matches = match (self.class, event) {
            (EventClass::StreamOut, ProcessEvent::Out { .. }) => true,
            (EventClass::StreamErr, ProcessEvent::Err { .. }) => true,
            (EventClass::AnyStream, ProcessEvent::Out { .. } | ProcessEvent::Err { .. }) => true,
            (EventClass::ProcessEnded, ProcessEvent::Ended { .. }) => true,
            _ => false,
        };
        if !class_matches {
            return false;
        }
        match (&self.pattern, event.data()) {
            (Some(pattern), Some(data)) if !pattern.is_empty() => data.contains(pattern),
            _ => true,
        }
    }
}

/// Opaque handle to an installed hook, used only for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Removing a hook that is not installed fails with this error.
#[derive(Debug, Error)]
#[error("no such hook: {0:?}")]
pub struct UnknownHook(pub HookId);

struct Hook {
    matcher: EventMatcher,
    sender: UnboundedSender<ProcessEvent>,
}

type Observer = Box<dyn Fn(&ProcessEvent) + Send + Sync>;

/// Owner of a hook set; anything that emits [`ProcessEvent`]s.
#[derive(Default)]
pub struct EventSource {
    inner: Mutex<SourceInner>,
    observers: Mutex<Vec<Observer>>,
}

#[derive(Default)]
struct SourceInner {
    hooks: HashMap<u64, Hook>,
    next_id: u64,
}

impl EventSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a hook. Every future event accepted by `matcher` is sent on
    /// `sender`; a closed receiver is tolerated, so callers that drop their
    /// receiving end before removing the hook simply stop seeing events.
    pub fn add_hook(&self, matcher: EventMatcher, sender: UnboundedSender<ProcessEvent>) -> HookId {
        let mut inner = self.inner.lock().expect("event source lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.hooks.insert(id, Hook { matcher, sender });
        HookId(id)
    }

    /// Removes a previously installed hook.
    ///
    /// Events already enqueued for the hook are not recalled; late
    /// deliveries must be tolerated by the receiver.
    pub fn remove_hook(&self, id: HookId) -> Result<(), UnknownHook> {
        let mut inner = self.inner.lock().expect("event source lock poisoned");
        inner.hooks.remove(&id.0).map(|_| ()).ok_or(UnknownHook(id))
    }

    /// Registers an observer called inline, in the emitter's context, for
    /// every event. Observers are internal plumbing (event-log writes,
    /// wire replies) that must see events synchronously and in order;
    /// user-facing matching goes through hooks.
    pub fn add_observer(&self, observer: impl Fn(&ProcessEvent) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(Box::new(observer));
    }

    /// Emits an event: observers run inline, then the event is enqueued
    /// for every matching hook.
    pub fn emit(&self, event: ProcessEvent) {
        {
            let observers = self.observers.lock().expect("observer lock poisoned");
            for observer in observers.iter() {
                observer(&event);
            }
        }
        let inner = self.inner.lock().expect("event source lock poisoned");
        for hook in inner.hooks.values() {
            if hook.matcher.matches(&event) {
                // A closed receiver means the hook owner went away; the
                // event is dropped for that hook only.
                let _ = hook.sender.send(event.clone());
            }
        }
    }

    /// Delivers an event to one specific hook, bypassing matching.
    ///
    /// Used for remote hooks, where matching already happened on the remote
    /// side. Unknown ids are ignored: a match can arrive after the hook was
    /// dropped locally.
    pub fn fire_hook(&self, id: HookId, event: ProcessEvent) {
        let inner = self.inner.lock().expect("event source lock poisoned");
        if let Some(hook) = inner.hooks.get(&id.0) {
            let _ = hook.sender.send(event);
        }
    }
}

/// Installs a hook, waits for the first matching event, then removes the
/// hook again. Returns `None` if the source was dropped while waiting.
///
/// The hook is installed when this is called, not when the returned future
/// is first polled, so events emitted in between are not missed.
pub fn wait_for(
    source: &EventSource,
    matcher: EventMatcher,
) -> impl std::future::Future<Output = Option<ProcessEvent>> + '_ {
    let (tx, mut rx) = unbounded_channel();
    let id = source.add_hook(matcher, tx);
    async move {
        let event = rx.recv().await;
        // The hook may already be gone if the source cleaned up.
        let _ = source.remove_hook(id);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(data: &str) -> ProcessEvent {
        ProcessEvent::Out {
            data: data.to_owned(),
        }
    }

    #[tokio::test]
    async fn matching_hook_receives_events_in_order() {
        let source = EventSource::new();
        let (tx, mut rx) = unbounded_channel();
        source.add_hook(EventMatcher::new(EventClass::StreamOut), tx);

        source.emit(out("first\n"));
        source.emit(out("second\n"));
        source.emit(ProcessEvent::Err {
            data: "ignored\n".to_owned(),
        });

        assert_eq!(rx.recv().await, Some(out("first\n")));
        assert_eq!(rx.recv().await, Some(out("second\n")));
        assert!(rx.try_recv().is_err(), "stderr event must not match");
    }

    #[tokio::test]
    async fn pattern_is_a_substring_test() {
        let source = EventSource::new();
        let (tx, mut rx) = unbounded_channel();
        source.add_hook(
            EventMatcher::with_pattern(EventClass::StreamOut, "ready"),
            tx,
        );

        source.emit(out("starting up\n"));
        source.emit(out("server ready to accept\n"));

        assert_eq!(rx.recv().await, Some(out("server ready to accept\n")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn empty_pattern_matches_everything_of_the_class() {
        let matcher = EventMatcher::with_pattern(EventClass::StreamErr, "");
        assert!(matcher.matches(&ProcessEvent::Err {
            data: "anything".to_owned()
        }));
        assert!(!matcher.matches(&out("anything")));
    }

    #[test]
    fn process_ended_ignores_pattern() {
        let matcher = EventMatcher::with_pattern(EventClass::ProcessEnded, "unused");
        assert!(matcher.matches(&ProcessEvent::Ended { exit_code: 3 }));
    }

    #[test]
    fn removing_a_missing_hook_fails() {
        let source = EventSource::new();
        let (tx, _rx) = unbounded_channel();
        let id = source.add_hook(EventMatcher::new(EventClass::AnyStream), tx);
        source.remove_hook(id).expect("first removal succeeds");
        assert!(source.remove_hook(id).is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_tolerated() {
        let source = EventSource::new();
        let (tx, rx) = unbounded_channel();
        source.add_hook(EventMatcher::new(EventClass::AnyStream), tx);
        drop(rx);
        // Must not panic or error.
        source.emit(out("into the void\n"));
    }

    #[tokio::test]
    async fn wait_for_sees_the_first_match() {
        let source = EventSource::new();
        let wait = wait_for(&source, EventMatcher::with_pattern(EventClass::StreamOut, "go"));
        // Emit before polling completes; the hook is installed synchronously
        // before the await point, so this is not racy.
        source.emit(out("go now\n"));
        assert_eq!(wait.await, Some(out("go now\n")));
    }
}
