use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub mod credentials;
pub use credentials::{
    is_sensitive, redact_assignment, CredentialError, CredentialProvider, EnvCredentialProvider,
    StaticCredentialProvider, FORWARDED_CREDENTIALS, SESSION_CREDENTIALS,
};

/// Host variables carrying this prefix are forwarded into the container with the
/// prefix stripped.
pub const USER_VARIABLE_PREFIX: &str = "CONT_VAR_";

pub const IMAGE_ID_VAR: &str = "IMAGE_ID";
pub const UDOCKER_DIR_VAR: &str = "UDOCKER_DIR";
pub const INIT_SCRIPT_PATH_VAR: &str = "INIT_SCRIPT_PATH";
pub const LAYOUT_FILE_VAR: &str = "SUPERVISOR_LAYOUT_FILE";
pub const ENFORCE_DEADLINE_VAR: &str = "SUPERVISOR_ENFORCE_DEADLINE";
pub const STORE_ROOT_VAR: &str = "SUPERVISOR_STORE_ROOT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Required variable {name} is not set")]
    MissingVariable { name: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Layout file not found: {path}")]
    LayoutFileNotFound { path: String },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },
}

/// Filesystem and runtime naming conventions of the execution sandbox.
///
/// Every field has a default matching the function host's layout; a JSON file
/// named by `SUPERVISOR_LAYOUT_FILE` may override any subset of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutSettings {
    /// Writable scratch root; the only persistent-across-warm-calls location.
    pub tmp_root: PathBuf,
    /// Read-only directory holding the deployed package (runtime binary, init script).
    pub task_root: PathBuf,
    /// Reserved name of the single container instance.
    pub container_name: String,
    /// udocker execution engine selector passed to `setup --execmode`.
    pub exec_mode: String,
    /// Grace period kept free before the host deadline when the deadline is enforced.
    pub deadline_grace_ms: u64,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            tmp_root: PathBuf::from("/tmp"),
            task_root: PathBuf::from("/var/task"),
            container_name: "lambda_cont".to_string(),
            exec_mode: "F1".to_string(),
            deadline_grace_ms: 2_000,
        }
    }
}

impl LayoutSettings {
    pub fn deadline_grace(&self) -> Duration {
        Duration::from_millis(self.deadline_grace_ms)
    }

    #[instrument]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::LayoutFileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read layout file: {}", e),
        })?;

        let layout: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
                message: e.to_string(),
            })?;

        layout.validate()?;
        debug!("Loaded layout overrides from {:?}", path);
        Ok(layout)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.tmp_root.is_absolute() {
            return Err(ConfigError::InvalidValue {
                name: "tmpRoot".to_string(),
                message: format!("'{}' must be absolute", self.tmp_root.display()),
            });
        }
        if self.container_name.trim().is_empty()
            || self.container_name.contains(char::is_whitespace)
        {
            return Err(ConfigError::InvalidValue {
                name: "containerName".to_string(),
                message: "container name must be a single non-empty token".to_string(),
            });
        }
        if self.exec_mode.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "execMode".to_string(),
                message: "execution mode cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Deployment configuration for the supervisor, sourced once at start-up and then
/// passed by value into the orchestrator. Nothing below this point reads the
/// process environment for deployment settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub image_id: String,
    pub udocker_dir: PathBuf,
    pub init_script_path: Option<PathBuf>,
    /// User-declared container variables, prefix already stripped.
    pub user_variables: BTreeMap<String, String>,
    pub layout: LayoutSettings,
    pub enforce_deadline: bool,
    pub store_root: Option<PathBuf>,
}

impl SupervisorConfig {
    /// Load from the current process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        }))
    }

    /// Load from an explicit set of environment-style key/value pairs.
    #[instrument(skip(vars))]
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let image_id = required(&vars, IMAGE_ID_VAR)?;
        if image_id.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                name: IMAGE_ID_VAR.to_string(),
                message: format!("'{}' contains whitespace", image_id),
            });
        }
        let udocker_dir = PathBuf::from(required(&vars, UDOCKER_DIR_VAR)?);

        let init_script_path = non_empty(&vars, INIT_SCRIPT_PATH_VAR).map(PathBuf::from);

        let layout = match non_empty(&vars, LAYOUT_FILE_VAR) {
            Some(path) => LayoutSettings::from_file(Path::new(&path))?,
            None => LayoutSettings::default(),
        };

        let enforce_deadline = match non_empty(&vars, ENFORCE_DEADLINE_VAR) {
            Some(raw) => parse_bool(ENFORCE_DEADLINE_VAR, &raw)?,
            None => false,
        };

        let store_root = non_empty(&vars, STORE_ROOT_VAR).map(PathBuf::from);

        let user_variables = user_variables(&vars);
        debug!(
            image = %image_id,
            user_variables = user_variables.len(),
            "Supervisor configuration loaded"
        );

        Ok(Self {
            image_id,
            udocker_dir,
            init_script_path,
            user_variables,
            layout,
            enforce_deadline,
            store_root,
        })
    }

    /// True when the user declared `name` through a prefixed host variable.
    pub fn declares_user_variable(&self, name: &str) -> bool {
        self.user_variables.contains_key(name)
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    non_empty(vars, name).ok_or_else(|| ConfigError::MissingVariable {
        name: name.to_string(),
    })
}

fn non_empty(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("expected a boolean, found '{}'", other),
        }),
    }
}

fn user_variables(vars: &HashMap<String, String>) -> BTreeMap<String, String> {
    let mut forwarded = BTreeMap::new();
    for (key, value) in vars {
        if let Some(name) = key.strip_prefix(USER_VARIABLE_PREFIX) {
            if name.is_empty() {
                warn!("Ignoring bare {} variable without a name", USER_VARIABLE_PREFIX);
                continue;
            }
            forwarded.insert(name.to_string(), value.clone());
        }
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("IMAGE_ID", "alpine:3"),
            ("UDOCKER_DIR", "/tmp/home/.udocker"),
        ]
    }

    #[test]
    fn test_load_minimal_config_uses_layout_defaults() {
        let config = SupervisorConfig::from_vars(base_vars()).unwrap();

        assert_eq!(config.image_id, "alpine:3");
        assert_eq!(config.udocker_dir, PathBuf::from("/tmp/home/.udocker"));
        assert!(config.init_script_path.is_none());
        assert!(!config.enforce_deadline);
        assert_eq!(config.layout, LayoutSettings::default());
        assert_eq!(config.layout.container_name, "lambda_cont");
    }

    #[test]
    fn test_missing_image_id_fails() {
        let result = SupervisorConfig::from_vars(vec![("UDOCKER_DIR", "/tmp/home/.udocker")]);
        assert!(matches!(
            result,
            Err(ConfigError::MissingVariable { ref name }) if name == "IMAGE_ID"
        ));
    }

    #[test]
    fn test_blank_init_script_path_is_treated_as_unset() {
        let mut vars = base_vars();
        vars.push(("INIT_SCRIPT_PATH", "  "));
        let config = SupervisorConfig::from_vars(vars).unwrap();
        assert!(config.init_script_path.is_none());
    }

    #[test]
    fn test_prefixed_variables_are_stripped() {
        let mut vars = base_vars();
        vars.push(("CONT_VAR_GREETING", "hello"));
        vars.push(("CONT_VAR_AWS_ACCESS_KEY_ID", "user-key"));
        vars.push(("CONT_VAR_", "ignored"));
        vars.push(("OTHER", "not forwarded"));

        let config = SupervisorConfig::from_vars(vars).unwrap();

        assert_eq!(config.user_variables.len(), 2);
        assert_eq!(config.user_variables["GREETING"], "hello");
        assert!(config.declares_user_variable("AWS_ACCESS_KEY_ID"));
        assert!(!config.declares_user_variable("OTHER"));
    }

    #[test]
    fn test_enforce_deadline_parsing() {
        let mut vars = base_vars();
        vars.push(("SUPERVISOR_ENFORCE_DEADLINE", "TRUE"));
        assert!(SupervisorConfig::from_vars(vars).unwrap().enforce_deadline);

        let mut vars = base_vars();
        vars.push(("SUPERVISOR_ENFORCE_DEADLINE", "maybe"));
        assert!(matches!(
            SupervisorConfig::from_vars(vars),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_layout_file_overrides_subset() {
        let temp_dir = TempDir::new().unwrap();
        let layout_path = temp_dir.path().join("layout.json");
        fs::write(
            &layout_path,
            r#"{ "tmpRoot": "/scratch", "containerName": "job_cont" }"#,
        )
        .unwrap();

        let path = layout_path.to_string_lossy().to_string();
        let mut vars: Vec<(String, String)> = base_vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.push(("SUPERVISOR_LAYOUT_FILE".to_string(), path));

        let config = SupervisorConfig::from_vars(vars).unwrap();
        assert_eq!(config.layout.tmp_root, PathBuf::from("/scratch"));
        assert_eq!(config.layout.container_name, "job_cont");
        assert_eq!(config.layout.task_root, PathBuf::from("/var/task"));
        assert_eq!(config.layout.exec_mode, "F1");
    }

    #[test]
    fn test_layout_file_rejects_relative_tmp_root() {
        let temp_dir = TempDir::new().unwrap();
        let layout_path = temp_dir.path().join("layout.json");
        fs::write(&layout_path, r#"{ "tmpRoot": "scratch" }"#).unwrap();

        let result = LayoutSettings::from_file(&layout_path);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_layout_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = LayoutSettings::from_file(&temp_dir.path().join("missing.json"));
        assert!(matches!(
            result,
            Err(ConfigError::LayoutFileNotFound { .. })
        ));
    }
}
