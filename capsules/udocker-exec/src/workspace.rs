//! Ephemeral per-invocation filesystem layout.
//!
//! Everything lives under the sandbox's scratch root so that a warm execution
//! context finds the runtime install and container state left by earlier calls.
//! All creation steps are idempotent.

use config_loader::LayoutSettings;
use serde_json::Value as JsonValue;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const RUNTIME_BINARY_NAME: &str = "udocker";
const EVENT_FILE_NAME: &str = "event.json";
const EXECUTION_LOG_NAME: &str = "execution.log";
const OUTPUT_DIR_NAME: &str = "output";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Invalid request identifier '{id}'")]
    InvalidRequestId { id: String },
    #[error("Refusing object key '{key}': {reason}")]
    InvalidObjectKey { key: String, reason: &'static str },
    #[error("Container runtime not found at {source_path} and no installed copy at {installed}")]
    RuntimeMissing {
        source_path: PathBuf,
        installed: PathBuf,
    },
    #[error("Filesystem operation on {path} failed: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to serialize event description: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Fixed paths shared by every invocation in one execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub tmp_root: PathBuf,
    pub runtime_dir: PathBuf,
    pub runtime_bin: PathBuf,
    pub runtime_home: PathBuf,
    pub runtime_source: PathBuf,
    pub script_path: PathBuf,
    pub init_script_path: PathBuf,
}

impl WorkspaceLayout {
    pub fn from_settings(settings: &LayoutSettings) -> Self {
        let tmp_root = settings.tmp_root.clone();
        let runtime_dir = tmp_root.join("udocker");
        Self {
            runtime_bin: runtime_dir.join(RUNTIME_BINARY_NAME),
            runtime_home: tmp_root.join("home").join(".udocker"),
            runtime_source: settings.task_root.join(RUNTIME_BINARY_NAME),
            script_path: runtime_dir.join("script.sh"),
            init_script_path: runtime_dir.join("init_script.sh"),
            runtime_dir,
            tmp_root,
        }
    }
}

/// The directory tree owned by a single invocation.
#[derive(Debug, Clone)]
pub struct Workspace {
    layout: WorkspaceLayout,
    request_id: String,
    request_dir: PathBuf,
    output_dir: PathBuf,
}

impl Workspace {
    /// Create the runtime install, runtime home and `<request_id>/output/`, install the
    /// runtime binary and, when configured, the persistent init script.
    pub fn prepare(
        layout: &WorkspaceLayout,
        request_id: &str,
        init_script: Option<&Path>,
    ) -> Result<Self, WorkspaceError> {
        validate_request_id(request_id)?;

        let request_dir = layout.tmp_root.join(request_id);
        let output_dir = request_dir.join(OUTPUT_DIR_NAME);
        for dir in [&layout.runtime_dir, &layout.runtime_home, &output_dir] {
            fs::create_dir_all(dir).map_err(io_at(dir))?;
        }

        install_runtime(layout)?;

        if let Some(source) = init_script {
            fs::copy(source, &layout.init_script_path).map_err(io_at(source))?;
            debug!(
                "Copied init script {} to {}",
                source.display(),
                layout.init_script_path.display()
            );
        }

        info!(request_id, dir = %request_dir.display(), "Workspace prepared");
        Ok(Self {
            layout: layout.clone(),
            request_id: request_id.to_string(),
            request_dir,
            output_dir,
        })
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn request_dir(&self) -> &Path {
        &self.request_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn event_file(&self) -> PathBuf {
        self.request_dir.join(EVENT_FILE_NAME)
    }

    pub fn execution_log(&self) -> PathBuf {
        self.request_dir.join(EXECUTION_LOG_NAME)
    }

    /// Persist the raw triggering event for inspection from inside the container.
    pub fn write_event(&self, event: &JsonValue) -> Result<PathBuf, WorkspaceError> {
        let path = self.event_file();
        let body = serde_json::to_vec_pretty(event)?;
        fs::write(&path, body).map_err(io_at(&path))?;
        Ok(path)
    }

    /// Local destination for a staged input object.
    pub fn input_path(&self, object_key: &str) -> Result<PathBuf, WorkspaceError> {
        safe_join(&self.request_dir, object_key)
    }

    /// Recursively delete the output directory.
    pub fn remove_output(&self) -> Result<(), WorkspaceError> {
        match fs::remove_dir_all(&self.output_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_at(&self.output_dir)(err)),
        }
    }
}

fn install_runtime(layout: &WorkspaceLayout) -> Result<(), WorkspaceError> {
    if layout.runtime_source.is_file() {
        fs::copy(&layout.runtime_source, &layout.runtime_bin)
            .map_err(io_at(&layout.runtime_bin))?;
    } else if layout.runtime_bin.is_file() {
        warn!(
            "Runtime source {} missing; reusing installed copy",
            layout.runtime_source.display()
        );
    } else {
        return Err(WorkspaceError::RuntimeMissing {
            source_path: layout.runtime_source.clone(),
            installed: layout.runtime_bin.clone(),
        });
    }

    #[cfg(unix)]
    {
        let bin = &layout.runtime_bin;
        let mut permissions = fs::metadata(bin).map_err(io_at(bin))?.permissions();
        permissions.set_mode(permissions.mode() | 0o700);
        fs::set_permissions(bin, permissions).map_err(io_at(bin))?;
    }

    Ok(())
}

fn validate_request_id(request_id: &str) -> Result<(), WorkspaceError> {
    let invalid = request_id.is_empty()
        || request_id == "."
        || request_id == ".."
        || request_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(WorkspaceError::InvalidRequestId {
            id: request_id.to_string(),
        });
    }
    Ok(())
}

/// Join an externally supplied relative path under `base`, refusing anything that
/// could resolve outside of it.
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
    let reject = |reason| WorkspaceError::InvalidObjectKey {
        key: relative.to_string(),
        reason,
    };

    if relative.contains('\0') {
        return Err(reject("contains a NUL byte"));
    }

    let mut sanitized = PathBuf::new();
    for comp in Path::new(relative).components() {
        match comp {
            Component::Normal(part) => sanitized.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(reject("contains '..' segments")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(reject("must be relative"))
            }
        }
    }

    if sanitized.as_os_str().is_empty() {
        return Err(reject("does not name a file"));
    }

    Ok(base.join(sanitized))
}
