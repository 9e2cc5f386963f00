//! The ReconciliationTrace resource, the context that computes its status and the
//! registry mapping cluster changes to the traces they concern.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use kube::core::DynamicObject;
use kube::{CustomResource, ResourceExt};
use rekon_core::object::object_ref_of;
use rekon_core::{DryRunResult, Error, ObjectPatch, ObjectRef, ObjectType, Plan, Result};
use rekon_kubehub::{ObjectClient, ObjectEvent};
use rekon_rules::{find_roots, RuleSet};
use rekon_store::DescriptionFormatter;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{description_formatter, HistoricalLoader, LiveLoader, ObjectLoader, PlanGenerator, ResourcesManager, TraceHistory};

pub const TRACE_API_VERSION: &str = "trace.kubeblocks.io/v1";

pub fn trace_type() -> ObjectType {
    ObjectType::new(TRACE_API_VERSION, "ReconciliationTrace")
}

/// Traces a root object's reconciliation and optionally plans a spec change.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "trace.kubeblocks.io",
    version = "v1",
    kind = "ReconciliationTrace",
    plural = "reconciliationtraces",
    shortname = "trace",
    namespaced,
    status = "ReconciliationTraceStatus",
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.targetObject.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.dryRunResult.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationTraceSpec {
    /// Root object; defaults to the trace's own namespace and name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_object: Option<TraceTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<DryRunSpec>,

    /// Locale of `localDescription` in recorded changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TraceTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DryRunSpec {
    /// Desired root spec as YAML or JSON text.
    pub desired_spec: String,
}

/// Changes, tree and summary observed for the live root.
pub type CurrentState = Plan;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationTraceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_result: Option<DryRunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<CurrentState>,
}

pub(crate) fn trace_key(trace: &ReconciliationTrace) -> ObjectRef {
    ObjectRef::new(trace_type(), trace.namespace().unwrap_or_default(), trace.name_any())
}

pub(crate) fn target_key(trace: &ReconciliationTrace, root: &ObjectType) -> ObjectRef {
    let target = trace.spec.target_object.clone().unwrap_or_default();
    ObjectRef::new(
        root.clone(),
        target.namespace.or_else(|| trace.namespace()).unwrap_or_default(),
        target.name.unwrap_or_else(|| trace.name_any()),
    )
}

/// `current` with its spec replaced by `desired_spec` (YAML or JSON text).
pub fn with_desired_spec(current: &DynamicObject, desired_spec: &str) -> Result<DynamicObject> {
    let spec: Value = serde_yaml::from_str(desired_spec).map_err(|e| Error::Malformed(format!("desired spec: {e}")))?;
    let mut desired = current.clone();
    desired.data["spec"] = spec;
    Ok(desired)
}

/// The root with its spec replaced by the trace's desired spec.
pub fn desired_root(current: &DynamicObject, trace: &ReconciliationTrace) -> Result<DynamicObject> {
    let dry_run = trace
        .spec
        .dry_run
        .as_ref()
        .ok_or_else(|| Error::Malformed(format!("trace {} has no dryRun", trace.name_any())))?;
    with_desired_spec(current, &dry_run.desired_spec)
}

/// What keeping trace statuses current needs: the plan generator, the recorded
/// history and the description strings.
pub struct TraceContext {
    generator: PlanGenerator,
    history: TraceHistory,
    resources: Arc<ResourcesManager>,
    default_locale: String,
}

impl TraceContext {
    pub fn new(generator: PlanGenerator, history: TraceHistory, resources: Arc<ResourcesManager>) -> Self {
        let default_locale = generator.settings().default_locale.clone();
        Self { generator, history, resources, default_locale }
    }

    pub fn generator(&self) -> &PlanGenerator {
        &self.generator
    }

    pub fn history(&self) -> &TraceHistory {
        &self.history
    }

    /// Descriptions in the default locale plus the trace's own, if it names one.
    pub fn formatter(&self, trace: &ReconciliationTrace) -> DescriptionFormatter {
        description_formatter(self.resources.clone(), self.default_locale.clone(), trace.spec.locale.clone())
    }

    /// Status for `trace`: the observed current state, plus a dry run when the
    /// trace asks for one. An observation failure leaves `currentState` unset.
    pub async fn reconcile(&self, trace: &ReconciliationTrace) -> ReconciliationTraceStatus {
        let formatter = self.formatter(trace);
        let client = self.generator.client().as_ref();
        let current_state = match self.history.observe(client, self.generator.rules(), trace, &formatter).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(trace = %trace_key(trace), error = %e, "trace: observation failed");
                None
            }
        };
        let dry_run_result = match trace.spec.dry_run {
            Some(_) => Some(dry_run_trace(self, trace).await),
            None => None,
        };
        ReconciliationTraceStatus { dry_run_result, current_state }
    }

    /// Release everything recorded for a deleted trace.
    pub fn forget(&self, trace: &ObjectRef) -> bool {
        self.history.forget(trace)
    }
}

/// Plan the trace's desired spec. The baseline is the trace's recorded tree at its
/// pinned revisions when one exists, otherwise the live tree.
pub async fn dry_run_trace(ctx: &TraceContext, trace: &ReconciliationTrace) -> DryRunResult {
    let generator = ctx.generator();
    let key = target_key(trace, &generator.rules().root);
    let current = match generator.client().get(&key).await {
        Ok(o) => o,
        Err(e) => return DryRunResult::failed(e.reason(), e.to_string()),
    };
    let desired = match desired_root(&current, trace) {
        Ok(d) => d,
        Err(e) => return DryRunResult::failed(e.reason(), e.to_string()),
    };
    let loader: Box<dyn ObjectLoader> = match ctx.history().object_tree(&trace_key(trace)) {
        Some(tree) => Box::new(HistoricalLoader::new(ctx.history().store().clone(), tree)),
        None => Box::new(LiveLoader::new(generator.client().clone(), generator.rules().clone(), current)),
    };
    info!(trace = %trace_key(trace), target = %key, "trace: dry run");
    generator.clone().with_formatter(ctx.formatter(trace)).generate_plan(&desired, loader.as_ref()).await
}

pub fn trace_from_object(obj: &DynamicObject) -> Result<ReconciliationTrace> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Merge patch writing `status` into a trace; unset parts are left alone.
pub fn status_patch(status: &ReconciliationTraceStatus) -> Result<ObjectPatch> {
    Ok(ObjectPatch::Merge(json!({ "status": serde_json::to_value(status)? })))
}

/// What a watch event did to a registered trace.
#[derive(Debug)]
pub enum TraceUpdate {
    /// New, or its spec generation moved.
    Changed(Box<ReconciliationTrace>),
    /// Only status or metadata changed.
    Unchanged,
    Deleted,
}

struct Registered {
    target: ObjectRef,
    generation: i64,
}

/// Trace key to resolved target key.
#[derive(Default)]
pub struct TraceRegistry {
    targets: RwLock<BTreeMap<ObjectRef, Registered>>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh `trace`. True when it is new or its spec generation moved.
    pub fn upsert(&self, trace: &ReconciliationTrace, root: &ObjectType) -> bool {
        let (k, target) = (trace_key(trace), target_key(trace, root));
        let generation = trace.metadata.generation.unwrap_or(0);
        debug!(trace = %k, target = %target, generation, "trace: registered");
        let mut targets = self.targets.write().unwrap_or_else(|p| p.into_inner());
        let prev = targets.insert(k, Registered { target, generation });
        prev.map_or(true, |p| p.generation != generation)
    }

    pub fn remove(&self, trace: &ObjectRef) -> bool {
        self.targets.write().unwrap_or_else(|p| p.into_inner()).remove(trace).is_some()
    }

    pub fn len(&self) -> usize {
        self.targets.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a watch event on a trace.
    pub fn track(&self, event: &ObjectEvent, root: &ObjectType) -> Result<(ObjectRef, TraceUpdate)> {
        let obj = event.object();
        if let ObjectEvent::Delete(_) = event {
            let key = object_ref_of(obj)?;
            self.remove(&key);
            info!(trace = %key, "trace: deleted");
            return Ok((key, TraceUpdate::Deleted));
        }
        let trace = trace_from_object(obj)?;
        let key = trace_key(&trace);
        let update = if self.upsert(&trace, root) { TraceUpdate::Changed(Box::new(trace)) } else { TraceUpdate::Unchanged };
        Ok((key, update))
    }

    /// Traces whose target is one of `roots`.
    pub fn traces_for_roots(&self, roots: &[DynamicObject]) -> Result<Vec<ObjectRef>> {
        let keys = roots.iter().map(object_ref_of).collect::<Result<Vec<_>>>()?;
        let targets = self.targets.read().unwrap_or_else(|p| p.into_inner());
        Ok(targets.iter().filter(|(_, r)| keys.contains(&r.target)).map(|(k, _)| k.clone()).collect())
    }

    /// Traces affected by a change to `obj`, found by walking ownership back to roots.
    pub async fn traces_for_change(&self, client: &dyn ObjectClient, rules: &RuleSet, obj: &DynamicObject) -> Result<Vec<ObjectRef>> {
        let roots = find_roots(client, rules, obj).await?;
        self.traces_for_roots(&roots)
    }
}
