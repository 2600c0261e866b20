use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// Event source tag the storage service stamps on its notification records.
pub const STORAGE_EVENT_SOURCE: &str = "aws:s3";

/// What caused this invocation, and therefore which pipeline shape applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TriggerEvent {
    #[serde(rename_all = "camelCase")]
    StorageNotification {
        bucket_name: String,
        object_key: String,
        /// Number of records in the batch; only the first one is acted upon.
        record_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    InlineScript { source_text: String },
    InlineArguments { argv: Vec<String> },
    Bare,
}

impl TriggerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::StorageNotification { .. } => "storageNotification",
            TriggerEvent::InlineScript { .. } => "inlineScript",
            TriggerEvent::InlineArguments { .. } => "inlineArguments",
            TriggerEvent::Bare => "bare",
        }
    }

    /// Bucket to stage input from and output to, for storage notifications.
    pub fn bucket(&self) -> Option<&str> {
        match self {
            TriggerEvent::StorageNotification { bucket_name, .. } => Some(bucket_name),
            _ => None,
        }
    }
}

/// Classify an inbound event. Storage notifications win over inline scripts,
/// which win over inline arguments; anything else is a bare invocation.
pub fn classify(event: &JsonValue) -> TriggerEvent {
    if let Some(notification) = storage_notification(event) {
        return notification;
    }

    if let Some(script) = event.get("script") {
        match script.as_str() {
            Some(text) if !text.is_empty() => {
                return TriggerEvent::InlineScript {
                    source_text: text.to_string(),
                }
            }
            Some(_) => {}
            None => warn!("Ignoring non-string 'script' field"),
        }
    }

    if let Some(argv) = event.get("cmd_args").and_then(argument_vector) {
        return TriggerEvent::InlineArguments { argv };
    }

    TriggerEvent::Bare
}

fn storage_notification(event: &JsonValue) -> Option<TriggerEvent> {
    let records = event.get("Records")?.as_array()?;
    let first = records.first()?;

    if first.get("eventSource").and_then(JsonValue::as_str) != Some(STORAGE_EVENT_SOURCE) {
        return None;
    }

    // A record tagged as storage but lacking the object description falls through.
    let s3 = first.get("s3")?;
    let bucket_name = s3.pointer("/bucket/name")?.as_str()?;
    let object_key = s3.pointer("/object/key")?.as_str()?;
    if bucket_name.is_empty() || object_key.is_empty() {
        debug!("Storage record without bucket or key; not a storage notification");
        return None;
    }

    if records.len() > 1 {
        warn!(
            records = records.len(),
            "Storage notification batch has more than one record; only the first is processed"
        );
    }

    Some(TriggerEvent::StorageNotification {
        bucket_name: bucket_name.to_string(),
        object_key: object_key.to_string(),
        record_count: records.len(),
    })
}

fn argument_vector(value: &JsonValue) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let argv: Vec<String> = items
        .iter()
        .map(|item| match item {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect();
    if argv.is_empty() {
        None
    } else {
        Some(argv)
    }
}
