//! Rekon dry-run API (in-process).
//!
//! Frontends drive everything through this crate: a [`PlanGenerator`] runs one
//! simulated reconciliation cycle over objects supplied by an [`ObjectLoader`];
//! [`ReconciliationTrace`] resources name the roots to plan for, a [`TraceHistory`]
//! pins what each trace has observed, and the notification worker maps cluster
//! changes back to the traces they affect.

#![forbid(unsafe_code)]

mod history;
mod i18n;
mod loader;
mod notify;
mod plan;
mod trace;

pub use history::TraceHistory;
pub use i18n::{description_formatter, format_description, ResourcesManager};
pub use loader::{HistoricalLoader, LiveLoader, ObjectLoader, StaticLoader};
pub use notify::{spawn_notifier, CancelHandle};
pub use plan::PlanGenerator;
pub use trace::{
    desired_root, dry_run_trace, status_patch, trace_from_object, trace_type, with_desired_spec, CurrentState, DryRunSpec,
    ReconciliationTrace, ReconciliationTraceSpec, ReconciliationTraceStatus, TraceContext, TraceRegistry, TraceTarget,
    TraceUpdate,
};
