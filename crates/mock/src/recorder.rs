//! Core Events emitted by simulators.

use kube::core::DynamicObject;
use rekon_core::object::{new_object, object_reference};
use rekon_core::{kinds, Result};
use rekon_kubehub::ObjectClient;
use serde_json::json;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Records Events through an `ObjectClient`. The Event name is derived from the
/// involved object, reason and message, so recording the same Event twice is a
/// no-op and a converged simulation stops producing changes.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    component: String,
}

impl EventRecorder {
    pub fn new(component: impl Into<String>) -> Self {
        Self { component: component.into() }
    }

    pub fn event_name(involved: &DynamicObject, reason: &str, message: &str) -> String {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in reason.bytes().chain([0u8]).chain(message.bytes()) {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        format!("{}.{:x}", involved.metadata.name.as_deref().unwrap_or_default(), h)
    }

    pub async fn record(
        &self,
        client: &dyn ObjectClient,
        involved: &DynamicObject,
        type_: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let name = Self::event_name(involved, reason, message);
        let ns = involved.metadata.namespace.as_deref().unwrap_or("default");
        let mut ev = new_object(&kinds::event(), ns, &name);
        ev.data = json!({
            "involvedObject": object_reference(involved)?,
            "type": type_,
            "reason": reason,
            "message": message,
            "count": 1,
            "source": {"component": self.component},
        });
        match client.create(&ev).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
