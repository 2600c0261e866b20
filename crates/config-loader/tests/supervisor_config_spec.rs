use config_loader::{
    ConfigError, CredentialProvider, EnvCredentialProvider, SupervisorConfig,
};
use serial_test::serial;
use std::env;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const MANAGED_VARS: [&str; 6] = [
    "IMAGE_ID",
    "UDOCKER_DIR",
    "INIT_SCRIPT_PATH",
    "SUPERVISOR_LAYOUT_FILE",
    "CONT_VAR_MESSAGE",
    "AWS_ACCESS_KEY_ID",
];

fn clear_managed_vars() {
    for name in MANAGED_VARS {
        env::remove_var(name);
    }
}

#[test]
#[serial]
fn given_host_environment_when_loading_then_config_is_read_once() {
    clear_managed_vars();
    let temp_dir = TempDir::new().unwrap();
    let layout_path = temp_dir.path().join("layout.json");
    fs::write(
        &layout_path,
        r#"{ "tmpRoot": "/scratch", "taskRoot": "/opt/task", "execMode": "P1" }"#,
    )
    .unwrap();

    env::set_var("IMAGE_ID", "centos:7");
    env::set_var("UDOCKER_DIR", "/scratch/home/.udocker");
    env::set_var("INIT_SCRIPT_PATH", "/opt/task/init_script.sh");
    env::set_var("SUPERVISOR_LAYOUT_FILE", &layout_path);
    env::set_var("CONT_VAR_MESSAGE", "hello world");

    let config = SupervisorConfig::from_env().expect("config should load");

    // Later mutations of the host environment do not leak into a loaded config.
    env::set_var("IMAGE_ID", "ubuntu:22.04");
    assert_eq!(config.image_id, "centos:7");
    assert_eq!(
        config.init_script_path,
        Some(PathBuf::from("/opt/task/init_script.sh"))
    );
    assert_eq!(config.layout.tmp_root, PathBuf::from("/scratch"));
    assert_eq!(config.layout.task_root, PathBuf::from("/opt/task"));
    assert_eq!(config.layout.exec_mode, "P1");
    assert_eq!(config.user_variables["MESSAGE"], "hello world");

    clear_managed_vars();
}

#[test]
#[serial]
fn given_missing_udocker_dir_when_loading_then_reports_variable() {
    clear_managed_vars();
    env::set_var("IMAGE_ID", "centos:7");

    let result = SupervisorConfig::from_env();
    match result {
        Err(ConfigError::MissingVariable { name }) => assert_eq!(name, "UDOCKER_DIR"),
        other => panic!("expected missing UDOCKER_DIR, got {:?}", other),
    }

    clear_managed_vars();
}

#[test]
#[serial]
fn given_malformed_layout_file_when_loading_then_fails_with_parse_error() {
    clear_managed_vars();
    let temp_dir = TempDir::new().unwrap();
    let layout_path = temp_dir.path().join("layout.json");
    fs::write(&layout_path, "{ not json").unwrap();

    env::set_var("IMAGE_ID", "centos:7");
    env::set_var("UDOCKER_DIR", "/tmp/home/.udocker");
    env::set_var("SUPERVISOR_LAYOUT_FILE", &layout_path);

    let result = SupervisorConfig::from_env();
    assert!(matches!(result, Err(ConfigError::JsonParsingFailed { .. })));

    clear_managed_vars();
}

#[test]
#[serial]
fn given_empty_credential_when_resolving_then_treated_as_missing() {
    clear_managed_vars();
    env::set_var("AWS_ACCESS_KEY_ID", "");

    let provider = EnvCredentialProvider::new();
    assert!(provider.resolve("AWS_ACCESS_KEY_ID").is_err());

    clear_managed_vars();
}
