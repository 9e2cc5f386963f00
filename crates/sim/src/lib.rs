//! Rekon sim: the reconciler tree. Each registered simulator advances objects of
//! one type the way the corresponding controller would, through an `ObjectClient`
//! (normally the mock client of a dry run).

#![forbid(unsafe_code)]

use kube::core::DynamicObject;
use metrics::counter;
use rekon_core::object::object_ref_of;
use rekon_core::{kinds, Error, ObjectType, Result};
use rekon_kubehub::{ListOptions, ObjectClient};
use tracing::{debug, trace};

mod builtin;
mod cluster;
mod gc;
mod util;
mod workload;

pub use builtin::{JobSimulator, PodSimulator, PvSimulator, PvcSimulator, VolumeSnapshotSimulator};
pub use cluster::{ClusterSimulator, ComponentSimulator};
pub use gc::GarbageCollector;
pub use workload::{InstanceSetSimulator, StatefulSetSimulator};

/// One state-transition step for objects of a single type. Must be deterministic
/// and must stop writing once the objects it reads stop changing.
#[async_trait::async_trait]
pub trait Simulator: Send + Sync {
    fn name(&self) -> &'static str;
    fn object_type(&self) -> ObjectType;
    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()>;
}

/// Simulators in registration order.
#[derive(Default)]
pub struct ReconcilerTree {
    simulators: Vec<Box<dyn Simulator>>,
}

impl ReconcilerTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sim: Box<dyn Simulator>) -> &mut Self {
        self.simulators.push(sim);
        self
    }

    pub fn len(&self) -> usize {
        self.simulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.simulators.is_empty()
    }

    pub fn registered(&self) -> impl Iterator<Item = (&'static str, ObjectType)> + '_ {
        self.simulators.iter().map(|s| (s.name(), s.object_type()))
    }

    /// Database-operator controllers followed by the built-in ones, then a garbage
    /// collector for every type in `managed` except Event.
    pub fn kubeblocks<I: IntoIterator<Item = ObjectType>>(managed: I) -> Self {
        let mut tree = Self::new();
        tree.register(Box::new(ClusterSimulator::default()))
            .register(Box::new(ComponentSimulator::default()))
            .register(Box::new(InstanceSetSimulator))
            .register(Box::new(StatefulSetSimulator))
            .register(Box::new(JobSimulator))
            .register(Box::new(PodSimulator))
            .register(Box::new(PvcSimulator))
            .register(Box::new(PvSimulator))
            .register(Box::new(VolumeSnapshotSimulator::new(kinds::volume_snapshot())))
            .register(Box::new(VolumeSnapshotSimulator::new(kinds::volume_snapshot_v1beta1())));
        for ty in managed.into_iter().filter(|t| t != &kinds::event()) {
            tree.register(Box::new(GarbageCollector::new(ty)));
        }
        tree
    }

    /// One round: every simulator once, in registration order, over a fresh read of
    /// each object of its type. The first error aborts the round.
    pub async fn run(&self, client: &dyn ObjectClient) -> Result<()> {
        for sim in &self.simulators {
            let ty = sim.object_type();
            let listed = client.list(&ty, &ListOptions::default()).await?;
            trace!(sim = sim.name(), ty = %ty, count = listed.len(), "sim: round");
            for obj in listed {
                let key = object_ref_of(&obj)?;
                let current = match client.get(&key).await {
                    Ok(o) => o,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                counter!("sim_reconciles_total", 1u64, "sim" => sim.name());
                sim.reconcile(client, &current).await.map_err(|e| match e {
                    Error::Reconcile(_) => e,
                    other => Error::Reconcile(format!("{} {key}: {other}", sim.name())),
                })?;
            }
        }
        debug!(simulators = self.simulators.len(), "sim: round complete");
        Ok(())
    }
}
