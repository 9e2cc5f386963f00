//! Watch events and involved-object resolution.

use futures::TryStreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::watcher::{self, Event},
    Client,
};
use k8s_openapi::api::core::v1::ObjectReference;
use metrics::counter;
use rekon_core::{kinds, object::object_type_of, ObjectRef, Result};
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{DiscoveredResource, ObjectClient};

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Create(DynamicObject),
    Update(DynamicObject),
    Delete(DynamicObject),
    /// Re-listed after a watch restart; whether it changed is unknown.
    Generic(DynamicObject),
}

impl ObjectEvent {
    pub fn object(&self) -> &DynamicObject {
        match self {
            ObjectEvent::Create(o) | ObjectEvent::Update(o) | ObjectEvent::Delete(o) | ObjectEvent::Generic(o) => o,
        }
    }
}

/// The object an event is about. Core Events are dereferenced through `client`
/// to their involved object; `None` when that object no longer exists.
pub async fn resolve_involved_object(client: &dyn ObjectClient, obj: &DynamicObject) -> Result<Option<DynamicObject>> {
    if object_type_of(obj)? != kinds::event() {
        return Ok(Some(obj.clone()));
    }
    let Some(involved) = obj.data.get("involvedObject").cloned() else {
        return Ok(None);
    };
    let reference: ObjectReference = serde_json::from_value(involved)?;
    let key = ObjectRef::from_reference(&reference);
    match client.get(&key).await {
        Ok(o) => Ok(Some(o)),
        Err(e) if e.is_not_found() => {
            debug!(involved = %key, "involved object gone");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// List+watch one resource and forward events until the stream ends or the
/// receiver is dropped.
pub async fn start_watcher(
    client: Client,
    resource: &DiscoveredResource,
    namespace: Option<&str>,
    tx: mpsc::Sender<ObjectEvent>,
) -> Result<()> {
    let ar = resource.api_resource();
    let api: Api<DynamicObject> = match namespace.filter(|_| resource.namespaced) {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let ty = resource.object_type();
    let typed = |mut o: DynamicObject| {
        if o.types.is_none() {
            o.types = Some(kube::core::TypeMeta { api_version: ty.api_version.clone(), kind: ty.kind.clone() });
        }
        o
    };
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ty = %ty, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await.map_err(|e| rekon_core::Error::Internal(format!("watch {ty}: {e}")))? {
        let batch = match ev {
            Event::Applied(o) => {
                let uid = o.metadata.uid.clone().unwrap_or_default();
                let o = typed(o);
                vec![if seen.insert(uid) { ObjectEvent::Create(o) } else { ObjectEvent::Update(o) }]
            }
            Event::Deleted(o) => {
                if let Some(uid) = &o.metadata.uid {
                    seen.remove(uid);
                }
                vec![ObjectEvent::Delete(typed(o))]
            }
            Event::Restarted(list) => {
                debug!(ty = %ty, count = list.len(), "watch restart");
                seen = list.iter().filter_map(|o| o.metadata.uid.clone()).collect();
                list.into_iter().map(|o| ObjectEvent::Generic(typed(o))).collect()
            }
        };
        for e in batch {
            counter!("watch_events_total", 1u64);
            if tx.send(e).await.is_err() {
                debug!(ty = %ty, "event receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(ty = %ty, "watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ListOptions;
    use rekon_core::{object::new_object, Error, ObjectPatch, ObjectType};

    struct OnePod(DynamicObject);

    #[async_trait::async_trait]
    impl ObjectClient for OnePod {
        async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
            if Some(key.name.as_str()) == self.0.metadata.name.as_deref() {
                Ok(self.0.clone())
            } else {
                Err(Error::NotFound(key.to_string()))
            }
        }
        async fn list(&self, _: &ObjectType, _: &ListOptions) -> Result<Vec<DynamicObject>> { Ok(vec![]) }
        async fn create(&self, o: &DynamicObject) -> Result<DynamicObject> { Ok(o.clone()) }
        async fn update(&self, o: &DynamicObject) -> Result<DynamicObject> { Ok(o.clone()) }
        async fn patch(&self, k: &ObjectRef, _: &ObjectPatch) -> Result<DynamicObject> { self.get(k).await }
        async fn delete(&self, _: &ObjectRef) -> Result<()> { Ok(()) }
        async fn update_status(&self, o: &DynamicObject) -> Result<DynamicObject> { Ok(o.clone()) }
        async fn patch_status(&self, k: &ObjectRef, _: &ObjectPatch) -> Result<DynamicObject> { self.get(k).await }
    }

    fn event_about(name: &str) -> DynamicObject {
        let mut ev = new_object(&kinds::event(), "ns", &format!("{name}.17a"));
        ev.data = serde_json::json!({"involvedObject": {"apiVersion": "v1", "kind": "Pod", "namespace": "ns", "name": name}});
        ev
    }

    #[tokio::test]
    async fn events_resolve_to_their_involved_object() {
        let pod = new_object(&kinds::pod(), "ns", "db-0");
        let client = OnePod(pod.clone());
        assert_eq!(resolve_involved_object(&client, &event_about("db-0")).await.unwrap(), Some(pod.clone()));
        assert_eq!(resolve_involved_object(&client, &event_about("gone")).await.unwrap(), None);
        assert_eq!(resolve_involved_object(&client, &pod).await.unwrap(), Some(pod));
    }
}
