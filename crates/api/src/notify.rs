//! Turns watch events into rate-limited trace notifications.

use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use metrics::counter;
use rekon_core::config::Settings;
use rekon_core::object::object_ref_of;
use rekon_core::ObjectRef;
use rekon_kubehub::{resolve_involved_object, ObjectClient, ObjectEvent};
use rekon_rules::RuleSet;
use rekon_store::Coalescer;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::TraceRegistry;

/// Stops a spawned worker.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn the notifier: events are resolved to the object they concern, coalesced
/// per object, and drained at `notify_qps` into the keys of affected traces.
/// The worker exits on cancel, or once `events` closes and the queue is empty.
pub fn spawn_notifier(
    client: Arc<dyn ObjectClient>,
    rules: Arc<RuleSet>,
    registry: Arc<TraceRegistry>,
    settings: &Settings,
    mut events: mpsc::Receiver<ObjectEvent>,
    out: mpsc::Sender<ObjectRef>,
) -> CancelHandle {
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    let cap = settings.notify_queue_cap;
    let period = Duration::from_secs_f64(1.0 / f64::from(settings.notify_qps.max(1)));
    tokio::spawn(async move {
        let mut queue: Coalescer<ObjectRef, DynamicObject> = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(period);
        let mut open = true;
        info!(cap, period_ms = %period.as_millis(), "notifier started");
        loop {
            tokio::select! {
                _ = &mut cancel_rx => break,
                ev = events.recv(), if open => match ev {
                    Some(ev) => enqueue(client.as_ref(), &mut queue, ev).await,
                    None => open = false,
                },
                _ = ticker.tick() => {
                    let Some((key, obj)) = queue.pop() else {
                        if open { continue } else { break }
                    };
                    match registry.traces_for_change(client.as_ref(), &rules, &obj).await {
                        Ok(traces) => {
                            for t in traces {
                                debug!(object = %key, trace = %t, "notify");
                                if out.send(t).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(object = %key, error = %e, "notifier: root lookup failed"),
                    }
                }
            }
        }
        info!("notifier stopped");
    });
    CancelHandle { tx: Some(cancel_tx) }
}

async fn enqueue(client: &dyn ObjectClient, queue: &mut Coalescer<ObjectRef, DynamicObject>, ev: ObjectEvent) {
    let obj = match resolve_involved_object(client, ev.object()).await {
        Ok(Some(o)) => o,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "notifier: unresolvable event");
            return;
        }
    };
    let Ok(key) = object_ref_of(&obj) else { return };
    let before = queue.dropped();
    if queue.push(key, obj) {
        counter!("notify_enqueued_total", 1u64);
    }
    if queue.dropped() > before {
        counter!("notify_dropped_total", queue.dropped() - before);
    }
}
