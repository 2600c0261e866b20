pub mod host;

use capsules_udocker_exec::{render_plain_text, FsObjectStore, InvocationContext, Supervisor};
use chrono::{DateTime, Utc};
use config_loader::SupervisorConfig;
use serde_json::Value as JsonValue;
use std::path::PathBuf;

/// Log coordinates the host assigns to this execution context.
#[derive(Debug, Clone, Default)]
pub struct LogNames {
    pub group: String,
    pub stream: String,
}

/// Root of the filesystem object store: the configured one, else under the scratch root.
pub fn store_root(config: &SupervisorConfig) -> PathBuf {
    config
        .store_root
        .clone()
        .unwrap_or_else(|| config.layout.tmp_root.join("object-store"))
}

pub fn build_supervisor(config: SupervisorConfig) -> Supervisor {
    let store = FsObjectStore::new(store_root(&config));
    Supervisor::with_defaults(config, Box::new(store))
}

/// Run one event through the supervisor and render the host-facing text.
pub fn respond(
    supervisor: &Supervisor,
    request_id: &str,
    deadline: Option<DateTime<Utc>>,
    event: &JsonValue,
    names: &LogNames,
) -> String {
    let mut ctx = InvocationContext::new(request_id).with_log_names(&names.group, &names.stream);
    ctx.deadline = deadline;
    let envelope = supervisor.handle(event, &ctx);
    render_plain_text(&envelope, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_root_defaults_under_tmp_root() {
        let config = SupervisorConfig::from_vars([
            ("IMAGE_ID", "alpine:3"),
            ("UDOCKER_DIR", "/tmp/home/.udocker"),
        ])
        .unwrap();
        assert_eq!(store_root(&config), PathBuf::from("/tmp/object-store"));

        let config = SupervisorConfig::from_vars([
            ("IMAGE_ID", "alpine:3"),
            ("UDOCKER_DIR", "/tmp/home/.udocker"),
            ("SUPERVISOR_STORE_ROOT", "/mnt/objects"),
        ])
        .unwrap();
        assert_eq!(store_root(&config), PathBuf::from("/mnt/objects"));
    }
}
