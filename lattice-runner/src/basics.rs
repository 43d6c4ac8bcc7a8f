// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Basic ready-made suites: directories on controlled hosts.

use crate::{
    component::{
        BuildContext, CapabilityHandle, Component, ComponentClass, ComponentContext, Need,
        NeedSpec, Suite,
    },
    errors::NodeFailure,
    graph::{Capability, NestedDef, NodeKind},
    host::{CONTROLLED_HOST, ControlledHost, DIRECTORY},
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// The value behind the `IDirectory` capability: a directory on a specific
/// controlled host.
pub struct DirectoryRef {
    /// The host the directory lives on.
    pub host: Arc<dyn ControlledHost>,
    /// The absolute path on that host.
    pub path: String,
}

impl DirectoryRef {
    /// A printable `host:path` description.
    pub fn desc(&self) -> String {
        format!("{}:{}", self.host.host_name(), self.path)
    }
}

/// An existing directory on a host. Arguments: `(path)`.
pub struct DirectorySuite {
    dir: Arc<DirectoryRef>,
}

#[async_trait]
impl Suite for DirectorySuite {
    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        (capability == DIRECTORY)
            .then(|| Arc::new(Arc::clone(&self.dir)) as CapabilityHandle)
    }
}

/// Class for [`DirectorySuite`].
pub struct DirectoryClass;

impl ComponentClass for DirectoryClass {
    fn name(&self) -> &'static str {
        "Directory"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Suite
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![DIRECTORY]
    }

    fn needs(&self) -> NeedSpec {
        NeedSpec::Fixed(vec![Need::new("host", CONTROLLED_HOST)])
    }

    fn arg_count(&self) -> usize {
        1
    }

    fn build(&self, cx: BuildContext) -> Result<Component, NodeFailure> {
        let host: Arc<dyn ControlledHost> = cx.bindings.get("host")?;
        let path = cx.arg_str(0)?.to_owned();
        Ok(Component::Suite(Arc::new(DirectorySuite {
            dir: Arc::new(DirectoryRef { host, path }),
        })))
    }
}

/// A temporary directory on a host: allocated and created in setUp,
/// removed again in tearDown. Arguments: `(name)`, the description the
/// path is derived from.
pub struct TempDirectorySuite {
    name: String,
    host: Arc<dyn ControlledHost>,
    dir: Mutex<Option<Arc<DirectoryRef>>>,
}

impl TempDirectorySuite {
    /// The allocated path, once setUp ran.
    pub fn path(&self) -> Option<String> {
        self.dir
            .lock()
            .expect("dir lock poisoned")
            .as_ref()
            .map(|dir| dir.path.clone())
    }
}

#[async_trait]
impl Suite for TempDirectorySuite {
    async fn set_up(&self, _cx: &ComponentContext) -> Result<Option<NestedDef>, NodeFailure> {
        let path = self.host.temp_dir(&self.name);
        // A stale directory from an earlier allocation must not survive.
        self.host.recursive_remove(&path).await?;
        self.host.make_directory(&path).await?;
        *self.dir.lock().expect("dir lock poisoned") = Some(Arc::new(DirectoryRef {
            host: Arc::clone(&self.host),
            path,
        }));
        Ok(None)
    }

    async fn tear_down(&self, _cx: &ComponentContext) -> Result<(), NodeFailure> {
        let dir = self.dir.lock().expect("dir lock poisoned").take();
        if let Some(dir) = dir {
            self.host.recursive_remove(&dir.path).await?;
        }
        Ok(())
    }

    fn provide(&self, capability: Capability) -> Option<CapabilityHandle> {
        if capability != DIRECTORY {
            return None;
        }
        self.dir
            .lock()
            .expect("dir lock poisoned")
            .as_ref()
            .map(|dir| Arc::new(Arc::clone(dir)) as CapabilityHandle)
    }
}

/// Class for [`TempDirectorySuite`].
pub struct TempDirectoryClass;

impl ComponentClass for TempDirectoryClass {
    fn name(&self) -> &'static str {
        "TempDirectory"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Suite
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![DIRECTORY]
    }

    fn needs(&self) -> NeedSpec {
        NeedSpec::Fixed(vec![Need::new("host", CONTROLLED_HOST)])
    }

    fn arg_count(&self) -> usize {
        1
    }

    fn build(&self, cx: BuildContext) -> Result<Component, NodeFailure> {
        let host: Arc<dyn ControlledHost> = cx.bindings.get("host")?;
        let name = cx.arg_str(0)?.to_owned();
        Ok(Component::Suite(Arc::new(TempDirectorySuite {
            name,
            host,
            dir: Mutex::new(None),
        })))
    }
}
