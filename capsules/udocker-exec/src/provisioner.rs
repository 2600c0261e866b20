//! Idempotent image pull and container instance setup.

use crate::process::{command_line_string, truncate, CommandLogs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum RuntimeToolError {
    #[error("Failed to spawn container runtime '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("Container runtime command '{command}' exited with {status:?}: {output}")]
    Failed {
        command: String,
        status: Option<i32>,
        output: String,
    },
}

impl RuntimeToolError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeToolError::Spawn { .. } => "RUNTIME_TOOL_SPAWN_ERROR",
            RuntimeToolError::Failed { .. } => "RUNTIME_TOOL_COMMAND_FAILED",
        }
    }
}

/// Subcommands of the user-space container runtime the provisioner depends on.
///
/// `images` and `ps` return the raw listing; interpretation happens in
/// [`parse_image_list`] and [`parse_container_names`].
pub trait RuntimeTool: Send + Sync {
    fn images(&self) -> Result<String, RuntimeToolError>;
    fn pull(&self, image_id: &str) -> Result<(), RuntimeToolError>;
    fn ps(&self) -> Result<String, RuntimeToolError>;
    fn create(&self, container_name: &str, image_id: &str) -> Result<(), RuntimeToolError>;
    fn setup(&self, container_name: &str, exec_mode: &ExecMode) -> Result<(), RuntimeToolError>;
}

/// Drives the installed `udocker` executable.
#[derive(Debug, Clone)]
pub struct UdockerCli {
    binary: PathBuf,
    udocker_dir: PathBuf,
}

impl UdockerCli {
    pub fn new(binary: impl Into<PathBuf>, udocker_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            udocker_dir: udocker_dir.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn invoke(&self, args: &[&str]) -> Result<CommandLogs, RuntimeToolError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).env("UDOCKER_DIR", &self.udocker_dir);
        let cmdline = command_line_string(&cmd);
        debug!("Running {}", cmdline);

        let output = cmd.output().map_err(|source| RuntimeToolError::Spawn {
            command: cmdline.clone(),
            source,
        })?;
        let logs = CommandLogs::from_output(&output);
        if !output.status.success() {
            return Err(RuntimeToolError::Failed {
                command: cmdline,
                status: logs.exit_status,
                output: truncate(&logs.combined(), 2048),
            });
        }
        Ok(logs)
    }
}

impl RuntimeTool for UdockerCli {
    fn images(&self) -> Result<String, RuntimeToolError> {
        Ok(self.invoke(&["images"])?.stdout)
    }

    fn pull(&self, image_id: &str) -> Result<(), RuntimeToolError> {
        self.invoke(&["pull", image_id]).map(|_| ())
    }

    fn ps(&self) -> Result<String, RuntimeToolError> {
        Ok(self.invoke(&["ps"])?.stdout)
    }

    fn create(&self, container_name: &str, image_id: &str) -> Result<(), RuntimeToolError> {
        let name_flag = format!("--name={}", container_name);
        self.invoke(&["create", &name_flag, image_id]).map(|_| ())
    }

    fn setup(&self, container_name: &str, exec_mode: &ExecMode) -> Result<(), RuntimeToolError> {
        let mode_flag = format!("--execmode={}", exec_mode.as_str());
        self.invoke(&["setup", &mode_flag, container_name])
            .map(|_| ())
    }
}

/// Execution engine a container instance is configured with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ExecMode {
    /// `F1`: chroot-less execution through LD_PRELOAD emulation.
    Fakechroot,
    Other(String),
}

impl ExecMode {
    pub fn as_str(&self) -> &str {
        match self {
            ExecMode::Fakechroot => "F1",
            ExecMode::Other(mode) => mode,
        }
    }
}

impl From<String> for ExecMode {
    fn from(mode: String) -> Self {
        if mode == "F1" {
            ExecMode::Fakechroot
        } else {
            ExecMode::Other(mode)
        }
    }
}

impl From<ExecMode> for String {
    fn from(mode: ExecMode) -> Self {
        mode.as_str().to_string()
    }
}

/// A container instance known to be ready for `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRegistration {
    pub container_name: String,
    pub image_id: String,
    pub exec_mode: ExecMode,
    /// True when this call pulled the image or created the instance.
    pub freshly_provisioned: bool,
}

/// Header tokens printed above the `udocker images` listing across releases.
const IMAGE_LIST_HEADERS: [&str; 2] = ["REPOSITORY", "REPOSITORIES"];

/// Image references listed by `udocker images`, one per non-header line.
pub fn parse_image_list(listing: &str) -> BTreeSet<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|token| !IMAGE_LIST_HEADERS.iter().any(|h| token.eq_ignore_ascii_case(h)))
        .map(str::to_string)
        .collect()
}

/// Container names listed by `udocker ps`, taken from the bracketed
/// `['name', ...]` column.
pub fn parse_container_names(listing: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for line in listing.lines() {
        let Some(open) = line.find('[') else {
            continue;
        };
        let Some(close) = line[open..].find(']') else {
            continue;
        };
        for raw in line[open + 1..open + close].split(',') {
            let name = raw.trim().trim_matches(|c| c == '\'' || c == '"');
            if !name.is_empty() {
                names.insert(name.to_string());
            }
        }
    }
    names
}

fn image_present(images: &BTreeSet<String>, image_id: &str) -> bool {
    if images.contains(image_id) {
        return true;
    }
    // An untagged reference resolves to :latest. A ':' after the last '/' is a tag.
    let untagged = !image_id
        .rsplit('/')
        .next()
        .is_some_and(|last| last.contains(':'));
    untagged && images.contains(&format!("{}:latest", image_id))
}

/// Ensures the configured image and reserved container instance exist.
pub struct Provisioner<'a> {
    tool: &'a dyn RuntimeTool,
    container_name: String,
    exec_mode: ExecMode,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        tool: &'a dyn RuntimeTool,
        container_name: impl Into<String>,
        exec_mode: ExecMode,
    ) -> Self {
        Self {
            tool,
            container_name: container_name.into(),
            exec_mode,
        }
    }

    /// Pull the image when it is not in the local repository, then create and set up
    /// the reserved instance when it does not exist yet. No rollback on failure.
    #[instrument(skip(self), fields(container = %self.container_name))]
    pub fn ensure(&self, image_id: &str) -> Result<ContainerRegistration, RuntimeToolError> {
        let mut fresh = false;

        let images = parse_image_list(&self.tool.images()?);
        if image_present(&images, image_id) {
            debug!("Image {} already present", image_id);
        } else {
            info!("Pulling image {}", image_id);
            self.tool.pull(image_id)?;
            fresh = true;
        }

        let containers = parse_container_names(&self.tool.ps()?);
        if containers.contains(&self.container_name) {
            debug!("Container {} already exists", self.container_name);
        } else {
            info!(
                "Creating container {} from {} with exec mode {}",
                self.container_name,
                image_id,
                self.exec_mode.as_str()
            );
            self.tool.create(&self.container_name, image_id)?;
            self.tool.setup(&self.container_name, &self.exec_mode)?;
            fresh = true;
        }

        Ok(ContainerRegistration {
            container_name: self.container_name.clone(),
            image_id: image_id.to_string(),
            exec_mode: self.exec_mode.clone(),
            freshly_provisioned: fresh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory runtime that records every mutating call.
    #[derive(Default)]
    struct RecordingTool {
        images: Mutex<Vec<String>>,
        containers: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
        fail_pull: bool,
    }

    impl RecordingTool {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RuntimeTool for RecordingTool {
        fn images(&self) -> Result<String, RuntimeToolError> {
            let mut listing = String::from("REPOSITORY\n");
            for image in self.images.lock().unwrap().iter() {
                listing.push_str(&format!("{}    .\n", image));
            }
            Ok(listing)
        }

        fn pull(&self, image_id: &str) -> Result<(), RuntimeToolError> {
            self.calls.lock().unwrap().push(format!("pull {}", image_id));
            if self.fail_pull {
                return Err(RuntimeToolError::Failed {
                    command: format!("udocker pull {}", image_id),
                    status: Some(1),
                    output: "Error: image not found".to_string(),
                });
            }
            self.images.lock().unwrap().push(image_id.to_string());
            Ok(())
        }

        fn ps(&self) -> Result<String, RuntimeToolError> {
            let mut listing = String::from("CONTAINER ID                         P M NAMES              IMAGE\n");
            for name in self.containers.lock().unwrap().iter() {
                listing.push_str(&format!(
                    "3f6a2b1c-0000-0000-0000-000000000000 . W ['{}']       alpine:3\n",
                    name
                ));
            }
            Ok(listing)
        }

        fn create(&self, container_name: &str, image_id: &str) -> Result<(), RuntimeToolError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {} {}", container_name, image_id));
            self.containers
                .lock()
                .unwrap()
                .push(container_name.to_string());
            Ok(())
        }

        fn setup(&self, container_name: &str, exec_mode: &ExecMode) -> Result<(), RuntimeToolError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("setup {} {}", container_name, exec_mode.as_str()));
            Ok(())
        }
    }

    #[test]
    fn ensure_provisions_once() {
        let tool = RecordingTool::default();
        let provisioner = Provisioner::new(&tool, "lambda_cont", ExecMode::Fakechroot);

        let first = provisioner.ensure("alpine:3").unwrap();
        assert!(first.freshly_provisioned);
        assert_eq!(
            tool.calls(),
            vec![
                "pull alpine:3".to_string(),
                "create lambda_cont alpine:3".to_string(),
                "setup lambda_cont F1".to_string(),
            ]
        );

        let second = provisioner.ensure("alpine:3").unwrap();
        assert!(!second.freshly_provisioned);
        assert_eq!(tool.calls().len(), 3);
        assert_eq!(second.container_name, "lambda_cont");
        assert_eq!(second.exec_mode, ExecMode::Fakechroot);
    }

    #[test]
    fn ensure_skips_pull_for_present_image() {
        let tool = RecordingTool::default();
        tool.images.lock().unwrap().push("centos:7".to_string());
        let provisioner = Provisioner::new(&tool, "lambda_cont", ExecMode::Fakechroot);

        provisioner.ensure("centos:7").unwrap();
        assert!(!tool.calls().iter().any(|call| call.starts_with("pull")));
    }

    #[test]
    fn failed_pull_leaves_no_instance() {
        let tool = RecordingTool {
            fail_pull: true,
            ..RecordingTool::default()
        };
        let provisioner = Provisioner::new(&tool, "lambda_cont", ExecMode::Fakechroot);

        let err = provisioner.ensure("missing:1").unwrap_err();
        assert_eq!(err.code(), "RUNTIME_TOOL_COMMAND_FAILED");
        assert!(tool.containers.lock().unwrap().is_empty());
    }

    #[test]
    fn image_list_parsing_avoids_substring_matches() {
        let listing = "REPOSITORY\nmyorg/alpine:3.19    .\nubuntu:22.04    .\n";
        let images = parse_image_list(listing);

        assert!(images.contains("myorg/alpine:3.19"));
        assert!(!image_present(&images, "alpine:3"));
        assert!(!image_present(&images, "ubuntu:22"));
        assert!(image_present(&images, "ubuntu:22.04"));
    }

    #[test]
    fn image_list_header_is_not_an_image() {
        for header in ["REPOSITORY", "REPOSITORIES"] {
            let images = parse_image_list(&format!("{}\nalpine:3    .\n", header));
            assert_eq!(images, BTreeSet::from(["alpine:3".to_string()]));
        }
    }

    #[test]
    fn untagged_image_matches_latest() {
        let images = parse_image_list("REPOSITORY\ncentos:latest    .\n");
        assert!(image_present(&images, "centos"));
        assert!(!image_present(&images, "centos:7"));

        let images = parse_image_list("REPOSITORY\nregistry:5000/app:latest    .\n");
        assert!(image_present(&images, "registry:5000/app"));
    }

    #[test]
    fn container_names_are_parsed_from_brackets() {
        let listing = "CONTAINER ID                         P M NAMES              IMAGE\n\
            aa-bb . W ['lambda_cont_old', 'x']  alpine:3\n\
            cc-dd . W ['other']  alpine:3\n\
            ee-ff . R []  alpine:3\n";
        let names = parse_container_names(listing);

        assert!(names.contains("lambda_cont_old"));
        assert!(names.contains("x"));
        assert!(names.contains("other"));
        assert!(!names.contains("lambda_cont"));
    }

    #[test]
    fn exec_mode_serializes_as_udocker_flag() {
        assert_eq!(ExecMode::from("F1".to_string()), ExecMode::Fakechroot);
        assert_eq!(ExecMode::from("P1".to_string()).as_str(), "P1");
        assert_eq!(
            serde_json::to_value(ExecMode::Fakechroot).unwrap(),
            serde_json::json!("F1")
        );
    }
}
