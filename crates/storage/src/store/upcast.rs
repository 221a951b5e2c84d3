#![forbid(unsafe_code)]

use serde_json::Value;
use std::collections::HashMap;
use tl_core::model::{EVENT_SCHEMA_VERSION, EventKind};

pub(crate) type UpcastFn = fn(Value) -> Value;

/// Maps (event type, source schema version) to the transform that lifts a
/// payload one version forward. Versions with no registered transform are
/// shape-compatible and pass through.
pub(crate) struct UpcastRegistry {
    transforms: HashMap<(EventKind, i64), UpcastFn>,
}

impl UpcastRegistry {
    pub(crate) fn upcast(&self, kind: EventKind, stored_version: i64, mut data: Value) -> Value {
        if stored_version > EVENT_SCHEMA_VERSION {
            // Written by a newer replica; pass through so reads never block.
            tracing::warn!(
                kind = kind.as_str(),
                stored_version,
                current_version = EVENT_SCHEMA_VERSION,
                "event payload is newer than this build; passing through unchanged"
            );
            return data;
        }
        let mut version = stored_version;
        while version < EVENT_SCHEMA_VERSION {
            if let Some(transform) = self.transforms.get(&(kind, version)) {
                data = transform(data);
            }
            version += 1;
        }
        data
    }
}

pub(crate) fn registry() -> UpcastRegistry {
    let mut transforms: HashMap<(EventKind, i64), UpcastFn> = HashMap::new();
    transforms.insert((EventKind::Created, 1), created_v1_to_v2);
    UpcastRegistry { transforms }
}

/// v1 `created` payloads carried priority as a word; v2 uses 0..=3.
fn created_v1_to_v2(mut data: Value) -> Value {
    if let Some(object) = data.as_object_mut()
        && let Some(priority) = object.get("priority").and_then(Value::as_str)
    {
        let numeric = match priority {
            "urgent" => 3,
            "high" => 2,
            "medium" => 1,
            "low" => 0,
            _ => 1,
        };
        object.insert("priority".to_string(), Value::from(numeric));
    }
    data
}
