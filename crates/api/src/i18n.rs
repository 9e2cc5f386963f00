//! Localized change descriptions.
//!
//! The resources ConfigMap maps a locale to `key=value` lines. Keys are
//! `<apiVersion>/<kind>/<changeType>` for object changes and the raw message for
//! Events; object formats take two `%s` slots, namespace then name.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::core::DynamicObject;
use rekon_core::object::event_message;
use rekon_core::{kinds, ChangeType, ObjectType};
use rekon_store::DescriptionFormatter;
use tracing::debug;

#[derive(Debug, Default)]
struct Table {
    raw: BTreeMap<String, String>,
    formats: BTreeMap<String, BTreeMap<String, String>>,
}

/// Parsed format strings, swapped atomically when the source data changes.
#[derive(Default)]
pub struct ResourcesManager {
    table: ArcSwap<Table>,
}

fn parse_lines(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (k, v) = line.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

impl ResourcesManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the `data` of a resources ConfigMap; unchanged data is not reparsed.
    pub fn parse_raw(&self, config_map: &DynamicObject) {
        let raw: BTreeMap<String, String> = config_map
            .data
            .get("data")
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default();
        if self.table.load().raw == raw {
            return;
        }
        let formats = raw.iter().map(|(locale, text)| (locale.clone(), parse_lines(text))).collect();
        debug!(locales = raw.len(), "i18n: resources reparsed");
        self.table.store(Arc::new(Table { raw, formats }));
    }

    pub fn format_string(&self, key: &str, locale: &str) -> Option<String> {
        self.table.load().formats.get(locale).and_then(|m| m.get(key)).cloned()
    }
}

/// Substitute `%s` slots in order; extra slots stay empty.
fn sprintf(format: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut parts = format.split("%s");
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    for (i, part) in parts.enumerate() {
        out.push_str(args.get(i).copied().unwrap_or_default());
        out.push_str(part);
    }
    out
}

/// Description of one change in `locale`. `None` only when `locale` is `None`.
pub fn format_description(
    old: Option<&DynamicObject>,
    new: Option<&DynamicObject>,
    change_type: ChangeType,
    ty: &ObjectType,
    resources: &ResourcesManager,
    locale: Option<&str>,
) -> Option<String> {
    let locale = locale?;
    let Some(obj) = new.or(old) else {
        return Some(change_type.as_str().to_string());
    };
    if ty == &kinds::event() {
        let message = event_message(obj);
        return Some(resources.format_string(message, locale).unwrap_or_else(|| message.to_string()));
    }
    let key = format!("{}/{}/{}", ty.api_version, ty.kind, change_type.as_str());
    let text = match resources.format_string(&key, locale) {
        Some(f) => {
            let ns = obj.metadata.namespace.as_deref().unwrap_or_default();
            sprintf(&f, &[ns, obj.metadata.name.as_deref().unwrap_or_default()])
        }
        None => change_type.as_str().to_string(),
    };
    Some(text)
}

/// Formatter for the change-capture store: default-locale text plus an optional
/// localized one.
pub fn description_formatter(
    resources: Arc<ResourcesManager>,
    default_locale: String,
    locale: Option<String>,
) -> DescriptionFormatter {
    Arc::new(move |old: Option<&DynamicObject>, new: Option<&DynamicObject>, change_type: ChangeType, ty: &ObjectType| {
        let default = format_description(old, new, change_type, ty, &resources, Some(&default_locale))
            .unwrap_or_else(|| change_type.as_str().to_string());
        let local = format_description(old, new, change_type, ty, &resources, locale.as_deref());
        (default, local)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::object::new_object;
    use serde_json::json;

    fn resources() -> ResourcesManager {
        let mut cm = new_object(&kinds::config_map(), "kb-system", "trace-i18n");
        cm.data = json!({"data": {
            "en": "apps.kubeblocks.io/v1/Component/Creation=Component %s/%s is created.\n# comment\nPod is ready=Pod is ready.",
            "zh_CN": "apps.kubeblocks.io/v1/Component/Creation=组件 %s/%s 已创建。",
        }});
        let r = ResourcesManager::new();
        r.parse_raw(&cm);
        r
    }

    #[test]
    fn object_changes_use_namespace_and_name() {
        let r = resources();
        let comp = new_object(&kinds::component(), "ns", "c1");
        let ty = kinds::component();
        let en = format_description(None, Some(&comp), ChangeType::Creation, &ty, &r, Some("en"));
        assert_eq!(en.as_deref(), Some("Component ns/c1 is created."));
        let zh = format_description(None, Some(&comp), ChangeType::Creation, &ty, &r, Some("zh_CN"));
        assert_eq!(zh.as_deref(), Some("组件 ns/c1 已创建。"));
    }

    #[test]
    fn missing_keys_fall_back() {
        let r = resources();
        let comp = new_object(&kinds::component(), "ns", "c1");
        let ty = kinds::component();
        let upd = format_description(Some(&comp), Some(&comp), ChangeType::Update, &ty, &r, Some("en"));
        assert_eq!(upd.as_deref(), Some("Update"));
        assert_eq!(format_description(None, Some(&comp), ChangeType::Creation, &ty, &r, None), None);
        assert_eq!(format_description(None, None, ChangeType::Deletion, &ty, &r, Some("en")).as_deref(), Some("Deletion"));
    }

    #[test]
    fn events_are_keyed_by_message() {
        let r = resources();
        let mut ev = new_object(&kinds::event(), "ns", "e1");
        ev.data = json!({"message": "Pod is ready"});
        let ty = kinds::event();
        let en = format_description(None, Some(&ev), ChangeType::Event, &ty, &r, Some("en"));
        assert_eq!(en.as_deref(), Some("Pod is ready."));
        let zh = format_description(None, Some(&ev), ChangeType::Event, &ty, &r, Some("zh_CN"));
        assert_eq!(zh.as_deref(), Some("Pod is ready"));
    }

    #[test]
    fn formatter_returns_default_and_local_text() {
        let r = Arc::new(resources());
        let f = description_formatter(r, "en".into(), Some("zh_CN".into()));
        let comp = new_object(&kinds::component(), "ns", "c1");
        let (default, local) = f(None, Some(&comp), ChangeType::Creation, &kinds::component());
        assert_eq!(default, "Component ns/c1 is created.");
        assert_eq!(local.as_deref(), Some("组件 ns/c1 已创建。"));
    }

    #[test]
    fn sprintf_fills_slots_in_order() {
        assert_eq!(sprintf("%s/%s", &["a", "b"]), "a/b");
        assert_eq!(sprintf("no slots", &["a"]), "no slots");
        assert_eq!(sprintf("%s and %s", &["a"]), "a and ");
    }
}
