//! Assembly of the `udocker run` invocation.

use crate::context::InvocationContext;
use crate::event::TriggerEvent;
use crate::process::display_line;
use crate::provisioner::ContainerRegistration;
use crate::workspace::WorkspaceLayout;
use config_loader::{
    CredentialProvider, SupervisorConfig, FORWARDED_CREDENTIALS, SESSION_CREDENTIALS,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, instrument};

/// Variable carrying the invocation's request identifier into the container.
pub const REQUEST_ID_VAR: &str = "REQUEST_ID";

/// Marker file only present in musl-based (Alpine-like) root filesystems.
pub const MUSL_MARKER: &str = "lib/libc.musl-x86_64.so.1";

/// Directories bind-mounted from the host in addition to the scratch root.
const HOST_MOUNTS: [&str; 3] = ["/dev", "/proc", "/etc/hosts"];

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to write inline script to {path}: {source}")]
    ScriptWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Variables injected into the container, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSet {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSet {
    /// Merge user-declared variables, the request identifier and host credentials.
    ///
    /// User declarations take precedence over `REQUEST_ID` and the access key pair;
    /// session tokens always replace them. Credentials the host lacks are skipped.
    pub fn assemble(
        config: &SupervisorConfig,
        credentials: &dyn CredentialProvider,
        request_id: &str,
    ) -> Self {
        let mut vars = config.user_variables.clone();

        vars.entry(REQUEST_ID_VAR.to_string())
            .or_insert_with(|| request_id.to_string());

        for name in FORWARDED_CREDENTIALS {
            if config.declares_user_variable(name) {
                debug!("Keeping user-declared {}", name);
                continue;
            }
            match credentials.resolve(name) {
                Ok(value) => {
                    vars.insert(name.to_string(), value);
                }
                Err(err) => debug!("Skipping credential: {}", err),
            }
        }

        for name in SESSION_CREDENTIALS {
            match credentials.resolve(name) {
                Ok(value) => {
                    vars.insert(name.to_string(), value);
                }
                Err(err) => debug!("Skipping credential: {}", err),
            }
        }

        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `--env KEY=VALUE` pairs in name order.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::with_capacity(self.vars.len() * 2);
        for (name, value) in &self.vars {
            flags.push("--env".to_string());
            flags.push(format!("{}={}", name, value));
        }
        flags
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Shell used to run scripts inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Busybox,
    Posix,
}

impl ShellKind {
    pub fn interpreter(&self) -> &'static str {
        match self {
            ShellKind::Busybox => "/bin/busybox sh",
            ShellKind::Posix => "/bin/sh",
        }
    }
}

/// Picks the script interpreter by looking at a container's root filesystem.
pub trait ShellDetector: Send + Sync {
    fn detect(&self, container_root: &Path) -> ShellKind;
}

impl<F> ShellDetector for F
where
    F: Fn(&Path) -> ShellKind + Send + Sync,
{
    fn detect(&self, container_root: &Path) -> ShellKind {
        self(container_root)
    }
}

/// Uses busybox when the root filesystem ships the musl loader, `/bin/sh` otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct MuslMarkerProbe;

impl ShellDetector for MuslMarkerProbe {
    fn detect(&self, container_root: &Path) -> ShellKind {
        let marker = container_root.join(MUSL_MARKER);
        if marker.is_file() {
            debug!("Found {}; using busybox shell", marker.display());
            ShellKind::Busybox
        } else {
            ShellKind::Posix
        }
    }
}

/// The fully resolved runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Variables for the runtime process itself, not forwarded into the container.
    pub runtime_env: Vec<(String, String)>,
}

impl ExecutionCommand {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (name, value) in &self.runtime_env {
            cmd.env(name, value);
        }
        cmd
    }

    /// Printable form with credential values masked.
    pub fn display(&self) -> String {
        display_line(
            &self.program.to_string_lossy(),
            self.args.iter().map(String::as_str),
        )
    }
}

pub struct CommandBuilder<'a> {
    layout: &'a WorkspaceLayout,
    udocker_dir: &'a Path,
    init_script_configured: bool,
    detector: &'a dyn ShellDetector,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(
        layout: &'a WorkspaceLayout,
        udocker_dir: &'a Path,
        init_script_configured: bool,
        detector: &'a dyn ShellDetector,
    ) -> Self {
        Self {
            layout,
            udocker_dir,
            init_script_configured,
            detector,
        }
    }

    /// Root filesystem of a container instance inside the runtime's state directory.
    pub fn container_root(&self, container_name: &str) -> PathBuf {
        self.udocker_dir
            .join("containers")
            .join(container_name)
            .join("ROOT")
    }

    /// Build the run command. The invocation shape follows the trigger: inline script,
    /// then inline arguments, then the persistent init script, then a bare start.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, trigger = event.kind()))]
    pub fn build(
        &self,
        registration: &ContainerRegistration,
        environment: &EnvironmentSet,
        event: &TriggerEvent,
        ctx: &InvocationContext,
    ) -> Result<ExecutionCommand, BuildError> {
        let mut args = vec![
            "--quiet".to_string(),
            "run".to_string(),
            "-v".to_string(),
            self.layout.tmp_root.to_string_lossy().into_owned(),
        ];
        for mount in HOST_MOUNTS {
            args.push("-v".to_string());
            args.push(mount.to_string());
        }
        args.push("--nosysdirs".to_string());
        args.extend(environment.to_flags());

        let container = registration.container_name.clone();
        match event {
            TriggerEvent::InlineScript { source_text } => {
                let script = &self.layout.script_path;
                fs::write(script, source_text).map_err(|source| BuildError::ScriptWrite {
                    path: script.clone(),
                    source,
                })?;
                args.push(self.entrypoint(&container, script));
                args.push(container);
            }
            TriggerEvent::InlineArguments { argv } => {
                args.push(container);
                args.extend(argv.iter().cloned());
            }
            _ if self.init_script_configured => {
                args.push(self.entrypoint(&container, &self.layout.init_script_path));
                args.push(container);
            }
            _ => args.push(container),
        }

        let command = ExecutionCommand {
            program: self.layout.runtime_bin.clone(),
            args,
            runtime_env: vec![(
                "UDOCKER_DIR".to_string(),
                self.udocker_dir.to_string_lossy().into_owned(),
            )],
        };
        debug!("Container command: {}", command.display());
        Ok(command)
    }

    fn entrypoint(&self, container: &str, script: &Path) -> String {
        let shell = self.detector.detect(&self.container_root(container));
        format!("--entrypoint={} {}", shell.interpreter(), script.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::ExecMode;
    use config_loader::{LayoutSettings, StaticCredentialProvider};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn config_with(user: &[(&str, &str)]) -> SupervisorConfig {
        SupervisorConfig {
            image_id: "alpine:3".to_string(),
            udocker_dir: PathBuf::from("/tmp/home/.udocker"),
            init_script_path: None,
            user_variables: user
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            layout: LayoutSettings::default(),
            enforce_deadline: false,
            store_root: None,
        }
    }

    fn host_credentials() -> StaticCredentialProvider {
        StaticCredentialProvider::new([
            ("AWS_ACCESS_KEY_ID", "host-key"),
            ("AWS_SECRET_ACCESS_KEY", "host-secret"),
            ("AWS_SESSION_TOKEN", "host-session"),
            ("AWS_SECURITY_TOKEN", "host-security"),
        ])
    }

    fn registration() -> ContainerRegistration {
        ContainerRegistration {
            container_name: "lambda_cont".to_string(),
            image_id: "alpine:3".to_string(),
            exec_mode: ExecMode::Fakechroot,
            freshly_provisioned: false,
        }
    }

    fn layout_in(root: &Path) -> WorkspaceLayout {
        let layout = WorkspaceLayout::from_settings(&LayoutSettings {
            tmp_root: root.to_path_buf(),
            ..LayoutSettings::default()
        });
        fs::create_dir_all(&layout.runtime_dir).unwrap();
        layout
    }

    #[test]
    fn environment_precedence() {
        let config = config_with(&[
            ("AWS_ACCESS_KEY_ID", "user-key"),
            ("AWS_SESSION_TOKEN", "user-session"),
            ("GREETING", "hi"),
        ]);

        let env = EnvironmentSet::assemble(&config, &host_credentials(), "req-1");

        assert_eq!(env.get("AWS_ACCESS_KEY_ID"), Some("user-key"));
        assert_eq!(env.get("AWS_SECRET_ACCESS_KEY"), Some("host-secret"));
        assert_eq!(env.get("AWS_SESSION_TOKEN"), Some("host-session"));
        assert_eq!(env.get("AWS_SECURITY_TOKEN"), Some("host-security"));
        assert_eq!(env.get("GREETING"), Some("hi"));
        assert_eq!(env.get("REQUEST_ID"), Some("req-1"));
    }

    #[test]
    fn user_declared_request_id_wins() {
        let config = config_with(&[("REQUEST_ID", "custom")]);
        let env = EnvironmentSet::assemble(&config, &host_credentials(), "req-1");
        assert_eq!(env.get("REQUEST_ID"), Some("custom"));
    }

    #[test]
    fn missing_host_credentials_are_skipped() {
        let config = config_with(&[("AWS_SESSION_TOKEN", "user-session")]);
        let env = EnvironmentSet::assemble(&config, &StaticCredentialProvider::default(), "req-1");

        assert_eq!(env.get("AWS_ACCESS_KEY_ID"), None);
        assert_eq!(env.get("AWS_SESSION_TOKEN"), Some("user-session"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn environment_flags_are_sorted() {
        let env: EnvironmentSet = [("ZED", "1"), ("ALPHA", "2")].into_iter().collect();
        assert_eq!(
            env.to_flags(),
            vec!["--env", "ALPHA=2", "--env", "ZED=1"]
        );
    }

    #[test]
    fn musl_probe_detects_marker() {
        let dir = TempDir::new().unwrap();
        assert_eq!(MuslMarkerProbe.detect(dir.path()), ShellKind::Posix);

        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join(MUSL_MARKER), "").unwrap();
        assert_eq!(MuslMarkerProbe.detect(dir.path()), ShellKind::Busybox);
    }

    #[test]
    fn arguments_follow_container_name_verbatim() {
        let dir = TempDir::new().unwrap();
        let layout = layout_in(dir.path());
        let posix = |_: &Path| ShellKind::Posix;
        let builder = CommandBuilder::new(&layout, Path::new("/unused"), true, &posix);
        let env: EnvironmentSet = [("REQUEST_ID", "req-1")].into_iter().collect();
        let event = TriggerEvent::InlineArguments {
            argv: vec!["echo".to_string(), "hello world".to_string(), "$HOME".to_string()],
        };

        let command = builder
            .build(&registration(), &env, &event, &InvocationContext::new("req-1"))
            .unwrap();

        let tmp = dir.path().to_string_lossy().into_owned();
        assert_eq!(command.program, layout.runtime_bin);
        assert_eq!(
            command.args,
            vec![
                "--quiet", "run", "-v", tmp.as_str(), "-v", "/dev", "-v", "/proc", "-v",
                "/etc/hosts", "--nosysdirs", "--env", "REQUEST_ID=req-1", "lambda_cont", "echo",
                "hello world", "$HOME",
            ]
        );
    }

    #[test]
    fn script_takes_priority_and_is_written() {
        let dir = TempDir::new().unwrap();
        let layout = layout_in(dir.path());
        let busybox = |_: &Path| ShellKind::Busybox;
        let builder = CommandBuilder::new(&layout, Path::new("/unused"), true, &busybox);
        let event = TriggerEvent::InlineScript {
            source_text: "echo from script".to_string(),
        };

        let command = builder
            .build(
                &registration(),
                &EnvironmentSet::default(),
                &event,
                &InvocationContext::new("req-1"),
            )
            .unwrap();

        let expected = format!("--entrypoint=/bin/busybox sh {}", layout.script_path.display());
        let tail = &command.args[command.args.len() - 2..];
        assert_eq!(tail, [expected, "lambda_cont".to_string()]);
        assert_eq!(
            fs::read_to_string(&layout.script_path).unwrap(),
            "echo from script"
        );
    }

    #[test]
    fn init_script_used_only_when_configured() {
        let dir = TempDir::new().unwrap();
        let layout = layout_in(dir.path());
        let posix = |_: &Path| ShellKind::Posix;
        let ctx = InvocationContext::new("req-1");
        let env = EnvironmentSet::default();

        let with_init = CommandBuilder::new(&layout, Path::new("/unused"), true, &posix)
            .build(&registration(), &env, &TriggerEvent::Bare, &ctx)
            .unwrap();
        let expected = format!("--entrypoint=/bin/sh {}", layout.init_script_path.display());
        assert_eq!(with_init.args[with_init.args.len() - 2], expected);
        assert_eq!(with_init.args.last().unwrap(), "lambda_cont");

        let bare = CommandBuilder::new(&layout, Path::new("/unused"), false, &posix)
            .build(&registration(), &env, &TriggerEvent::Bare, &ctx)
            .unwrap();
        assert_eq!(bare.args.last().unwrap(), "lambda_cont");
        assert!(!bare.args.iter().any(|arg| arg.starts_with("--entrypoint")));
    }

    #[test]
    fn storage_trigger_uses_init_script_shape() {
        let dir = TempDir::new().unwrap();
        let layout = layout_in(dir.path());
        let posix = |_: &Path| ShellKind::Posix;
        let event = TriggerEvent::StorageNotification {
            bucket_name: "b".to_string(),
            object_key: "k".to_string(),
            record_count: 1,
        };

        let command = CommandBuilder::new(&layout, Path::new("/unused"), true, &posix)
            .build(
                &registration(),
                &EnvironmentSet::default(),
                &event,
                &InvocationContext::new("req-1"),
            )
            .unwrap();
        assert!(command.args.iter().any(|arg| arg.starts_with("--entrypoint=/bin/sh")));
    }

    #[test]
    fn probe_receives_container_root() {
        let dir = TempDir::new().unwrap();
        let layout = layout_in(dir.path());
        let seen = std::sync::Mutex::new(None);
        let recorder = |root: &Path| {
            *seen.lock().unwrap() = Some(root.to_path_buf());
            ShellKind::Posix
        };
        let builder = CommandBuilder::new(&layout, Path::new("/tmp/home/.udocker"), false, &recorder);
        let event = TriggerEvent::InlineScript {
            source_text: "true".to_string(),
        };

        builder
            .build(
                &registration(),
                &EnvironmentSet::default(),
                &event,
                &InvocationContext::new("req-1"),
            )
            .unwrap();
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(PathBuf::from("/tmp/home/.udocker/containers/lambda_cont/ROOT"))
        );
    }
}
