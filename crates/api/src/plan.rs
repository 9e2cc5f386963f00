//! One simulated reconciliation cycle: seed, apply the desired root, iterate the
//! reconciler tree to a fixed point, report.

use std::sync::Arc;
use std::time::Instant;

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use rekon_apply::{spec_diff, spec_hash};
use rekon_core::config::Settings;
use rekon_core::object::{object_ref_of, object_reference, spec};
use rekon_core::{DryRunPhase, DryRunResult, Error, ObjectTreeNode, Plan, Result};
use rekon_kubehub::ObjectClient;
use rekon_mock::MockClient;
use rekon_rules::{build_object_summaries, object_tree_from_cache, RuleSet};
use rekon_sim::ReconcilerTree;
use rekon_store::{ChangeCaptureStore, DescriptionFormatter};
use serde_json::Value;
use tracing::{info, warn};

/// Why the fixed-point loop stopped.
enum Outcome {
    FixedPoint,
    Stopped(Error),
}

#[derive(Clone)]
pub struct PlanGenerator {
    real: Arc<dyn ObjectClient>,
    rules: Arc<RuleSet>,
    settings: Settings,
    formatter: Option<DescriptionFormatter>,
}

impl PlanGenerator {
    pub fn new(real: Arc<dyn ObjectClient>, rules: Arc<RuleSet>, settings: Settings) -> Self {
        Self { real, rules, settings, formatter: None }
    }

    pub fn with_formatter(mut self, formatter: DescriptionFormatter) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn client(&self) -> &Arc<dyn ObjectClient> {
        &self.real
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Predict what reconciling `desired_root` would do, starting from the objects
    /// `loader` supplies. Failures are reported in the result, never returned; a
    /// root without a `spec` fails as `Malformed` before anything is loaded.
    pub async fn generate_plan(&self, desired_root: &DynamicObject, loader: &dyn crate::ObjectLoader) -> DryRunResult {
        let t0 = Instant::now();
        let result = match self.run(desired_root, loader).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "plan: aborted");
                DryRunResult::failed(e.reason(), e.to_string())
            }
        };
        let phase = match result.phase {
            DryRunPhase::Succeeded => "Succeeded",
            DryRunPhase::Failed => "Failed",
        };
        counter!("plan_runs_total", 1u64, "phase" => phase);
        histogram!("plan_latency_ms", t0.elapsed().as_millis() as f64);
        info!(phase, reason = ?result.reason, changes = result.plan.changes.len(), took_ms = %t0.elapsed().as_millis(), "plan: done");
        result
    }

    async fn run(&self, desired_root: &DynamicObject, loader: &dyn crate::ObjectLoader) -> Result<DryRunResult> {
        let root_key = object_ref_of(desired_root)?;
        let desired_spec = spec(desired_root)
            .filter(|v| !v.is_null())
            .ok_or_else(|| Error::Malformed(format!("desired root {root_key} has no spec")))?;
        let managed = self.rules.managed_types();
        let store = Arc::new(ChangeCaptureStore::new(self.formatter.clone()));
        let client = MockClient::new(store.clone(), self.real.clone(), managed.clone());
        let tree = ReconcilerTree::kubeblocks(managed);

        let seed = loader.load().await?;
        info!(root = %root_key, objects = seed.len(), "plan: seeded");
        store.load(seed.into_values())?;
        let current = client.get(&root_key).await?;
        if store.get(&root_key).is_none() {
            store.load([current.clone()])?;
        }
        let initial = store.get_all();

        let null = Value::Null;
        let diff = spec_diff(spec(&current).unwrap_or(&null), desired_spec);
        let revision = spec_hash(desired_spec);
        client.update(desired_root).await?;

        let (outcome, rounds) = self.iterate(&tree, &client).await;
        histogram!("plan_rounds", rounds as f64);

        let object_tree = match client.get(&root_key).await {
            Ok(root) => object_tree_from_cache(&client, &self.rules, &root).await?,
            Err(e) if e.is_not_found() => ObjectTreeNode::new(object_reference(desired_root)?),
            Err(e) => return Err(e),
        };
        let plan = Plan {
            object_tree: Some(object_tree),
            changes: store.changes(),
            summary: build_object_summaries(&initial, &store.get_all()),
        };
        let (phase, reason, message) = match outcome {
            Outcome::FixedPoint => {
                info!(root = %root_key, rounds, "plan: fixed point");
                (DryRunPhase::Succeeded, None, None)
            }
            Outcome::Stopped(e) => {
                warn!(root = %root_key, rounds, error = %e, "plan: stopped before fixed point");
                (DryRunPhase::Failed, Some(e.reason().to_string()), Some(e.to_string()))
            }
        };
        Ok(DryRunResult {
            phase,
            reason,
            message,
            observed_target_generation: current.metadata.generation.unwrap_or(0),
            spec_diff: diff,
            desired_spec_revision: revision,
            plan,
        })
    }

    /// Run rounds until one records no change, the time budget runs out, the round
    /// cap is hit or a simulator fails.
    async fn iterate(&self, tree: &ReconcilerTree, client: &MockClient) -> (Outcome, usize) {
        let start = Instant::now();
        let budget = self.settings.plan_timeout;
        let mut last = client.store().change_count();
        let mut rounds = 0usize;
        loop {
            if self.settings.plan_max_rounds > 0 && rounds >= self.settings.plan_max_rounds {
                let msg = format!("no fixed point after {rounds} rounds");
                return (Outcome::Stopped(Error::Timeout(msg)), rounds);
            }
            let Some(remaining) = budget.checked_sub(start.elapsed()) else {
                return (Outcome::Stopped(Error::Timeout(format!("no fixed point within {budget:?}"))), rounds);
            };
            match tokio::time::timeout(remaining, tree.run(client)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return (Outcome::Stopped(e), rounds + 1),
                Err(_) => return (Outcome::Stopped(Error::Timeout(format!("no fixed point within {budget:?}"))), rounds + 1),
            }
            rounds += 1;
            let now = client.store().change_count();
            if now == last {
                return (Outcome::FixedPoint, rounds);
            }
            last = now;
        }
    }
}
