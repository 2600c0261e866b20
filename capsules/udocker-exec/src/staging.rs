//! Moving objects between the object store and the request workspace.

use crate::workspace::{safe_join, Workspace, WorkspaceError};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Key prefix under which produced files are published.
pub const OUTPUT_KEY_PREFIX: &str = "output";

const ACL_DIR: &str = ".acl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },
    #[error("Invalid bucket name '{bucket}'")]
    InvalidBucket { bucket: String },
    #[error(transparent)]
    InvalidKey(#[from] WorkspaceError),
    #[error("Object store I/O on {path} failed: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "STORE_OBJECT_NOT_FOUND",
            StoreError::InvalidBucket { .. } => "STORE_INVALID_BUCKET",
            StoreError::InvalidKey(_) => "STORE_INVALID_KEY",
            StoreError::Io { .. } => "STORE_IO_ERROR",
        }
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Capability surface of the object storage service used by the supervisor.
pub trait ObjectStore: Send + Sync {
    /// Download `bucket/key` into the local file `destination`.
    fn get(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), StoreError>;

    /// Upload the local file `source` as `bucket/key`, replacing any previous object.
    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError>;

    /// Grant anonymous read access to an existing object.
    fn set_public_read(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Keys in `bucket` that start with `prefix`, sorted.
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Object store laid out as `<root>/<bucket>/<key>` on the local filesystem.
///
/// Public-read grants are recorded as marker files under `<root>/.acl/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when `set_public_read` has been applied to the object.
    pub fn is_public(&self, bucket: &str, key: &str) -> bool {
        self.acl_path(bucket, key)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        let valid = !bucket.is_empty()
            && !bucket.starts_with('.')
            && !bucket.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidBucket {
                bucket: bucket.to_string(),
            });
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        Ok(safe_join(&self.bucket_dir(bucket)?, key)?)
    }

    fn acl_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        self.bucket_dir(bucket)?;
        Ok(safe_join(&self.root.join(ACL_DIR).join(bucket), key)?)
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        if !path.is_file() {
            return Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        fs::copy(&path, destination).map_err(io_at(destination))?;
        Ok(())
    }

    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(io_at(parent))?;

        // Stage next to the destination so the final rename is atomic.
        let mut staged = NamedTempFile::new_in(parent).map_err(io_at(parent))?;
        let mut input = fs::File::open(source).map_err(io_at(source))?;
        io::copy(&mut input, staged.as_file_mut()).map_err(io_at(staged.path()))?;
        staged
            .persist(&path)
            .map_err(|err| io_at(&path)(err.error))?;
        Ok(())
    }

    fn set_public_read(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let object = self.object_path(bucket, key)?;
        if !object.is_file() {
            return Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let marker = self.acl_path(bucket, key)?;
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        fs::write(&marker, b"public-read").map_err(io_at(&marker))?;
        Ok(())
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|err| StoreError::Io {
                path: dir.clone(),
                source: err.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            // Half-written uploads are hidden temp files beside their destination.
            if entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            if let Some(key) = relative_key(&dir, entry.path()) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Download the object named by the storage notification into the workspace.
#[instrument(skip(store, workspace), fields(request_id = workspace.request_id()))]
pub fn stage_input(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    workspace: &Workspace,
) -> Result<PathBuf, StoreError> {
    let destination = workspace.input_path(key)?;
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }

    store.get(bucket, key, &destination)?;
    info!("Downloaded s3://{}/{} to {}", bucket, key, destination.display());
    Ok(destination)
}

/// One produced file that could not be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFailure {
    pub key: String,
    pub message: String,
}

/// Outcome of publishing the output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStaging {
    pub uploaded: Vec<String>,
    pub failures: Vec<OutputFailure>,
    pub cleanup_error: Option<String>,
}

impl OutputStaging {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.cleanup_error.is_none()
    }
}

/// Upload every file under the output directory as `output/<relative path>` and mark
/// it publicly readable. Each file is independent of the others. The output directory
/// is removed afterwards whatever happened to the uploads.
#[instrument(skip(store, workspace), fields(request_id = workspace.request_id()))]
pub fn stage_output(store: &dyn ObjectStore, bucket: &str, workspace: &Workspace) -> OutputStaging {
    let mut staging = OutputStaging::default();
    let output_dir = workspace.output_dir();

    if output_dir.is_dir() {
        // Symlinks publish their targets; dangling links and loops surface as failures.
        for entry in WalkDir::new(output_dir).follow_links(true).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let key = err
                        .path()
                        .and_then(|path| relative_key(output_dir, path))
                        .map(|rel| format!("{}/{}", OUTPUT_KEY_PREFIX, rel))
                        .unwrap_or_else(|| OUTPUT_KEY_PREFIX.to_string());
                    warn!("Unable to read output entry {}: {}", key, err);
                    staging.failures.push(OutputFailure {
                        key,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_key(output_dir, entry.path()) else {
                continue;
            };

            let key = format!("{}/{}", OUTPUT_KEY_PREFIX, relative);
            let published = store
                .put(bucket, &key, entry.path())
                .and_then(|()| store.set_public_read(bucket, &key));
            match published {
                Ok(()) => {
                    debug!("Uploaded {} to s3://{}/{}", entry.path().display(), bucket, key);
                    staging.uploaded.push(key);
                }
                Err(err) => {
                    warn!("Failed to publish s3://{}/{}: {}", bucket, key, err);
                    staging.failures.push(OutputFailure {
                        key,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    if let Err(err) = workspace.remove_output() {
        warn!("Failed to clean output directory: {}", err);
        staging.cleanup_error = Some(err.to_string());
    }

    info!(
        uploaded = staging.uploaded.len(),
        failed = staging.failures.len(),
        "Output staging finished"
    );
    staging
}

/// Forward-slash key of `path` relative to `base`, if it lies beneath it.
fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|comp| match comp {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
