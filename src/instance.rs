//! The `Instance` record and the registry that owns a fleet of them.

use std::any::Any;
use tokio::time::Instant;

/// Parameters captured at first launch, replayed verbatim on retry.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub image: String,
    pub size: String,
    pub network: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Booting,
    Bootstrapping,
    Ready,
    Failed,
    Terminating,
    Terminated,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Starting => "starting",
            InstanceState::Booting => "booting",
            InstanceState::Bootstrapping => "bootstrapping",
            InstanceState::Ready => "ready",
            InstanceState::Failed => "failed",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// One VM under management. `backend_handle` is driver-owned and opaque to
/// everything above `BackendDriver` (boto-equivalent instance id, a GCE
/// operation name, an Azure `JoinHandle`...).
pub struct Instance {
    pub id: String,
    pub tags: Vec<String>,
    pub public_addr: String,
    pub private_addr: String,
    pub state: InstanceState,
    pub num_starts: u32,
    pub deadline: Instant,
    /// Reapplied verbatim to `deadline` on every deadline-triggered retry
    /// (resolves Open Question (c): the retry path must not immediately
    /// re-expire with whatever time happened to be left over).
    pub boot_timeout: tokio::time::Duration,
    pub max_starts: u32,
    pub launch_params: LaunchParams,
    pub backend_handle: Box<dyn Any + Send + Sync>,
}

impl Instance {
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            public_address: self.public_addr.clone(),
            private_address: self.private_addr.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Read-only snapshot returned by `Experiment::list`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub public_address: String,
    pub private_address: String,
    pub tags: Vec<String>,
}

/// Ordered collection of `Instance` records with tag-based subset queries.
/// Single-writer (the `LifecycleEngine`); reads happen concurrently during
/// fan-out, hence the `RwLock`.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: Vec<Instance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self { instances: Vec::new() }
    }

    pub fn push(&mut self, instance: Instance) {
        self.instances.push(instance);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.instances.iter_mut()
    }

    /// Insertion-order-stable subset matching all of `tags`.
    pub fn subset(&self, tags: &[String]) -> Vec<&Instance> {
        self.instances.iter().filter(|i| i.has_tags(tags)).collect()
    }

    pub fn subset_mut(&mut self, tags: &[String]) -> Vec<&mut Instance> {
        self.instances.iter_mut().filter(|i| i.has_tags(tags)).collect()
    }

    /// Only `Ready` instances matching all of `tags`, in registry order.
    pub fn ready_subset(&self, tags: &[String]) -> Vec<&Instance> {
        self.instances
            .iter()
            .filter(|i| i.has_tags(tags) && i.state == InstanceState::Ready)
            .collect()
    }

    pub fn remove_by_id(&mut self, id: &str) {
        self.instances.retain(|i| i.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }
}
