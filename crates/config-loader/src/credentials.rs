use std::collections::HashMap;
use std::env;
use thiserror::Error;
use tracing::debug;

/// Credential variables forwarded only when the user has not declared them.
pub const FORWARDED_CREDENTIALS: [&str; 2] = ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"];

/// Session variables forwarded on every invocation, overriding user declarations.
pub const SESSION_CREDENTIALS: [&str; 2] = ["AWS_SESSION_TOKEN", "AWS_SECURITY_TOKEN"];

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found: {name}")]
    CredentialNotFound { name: String },
}

pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, name: &str) -> Result<String, CredentialError>;
}

/// Reads credentials from the host process environment at resolution time.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn resolve(&self, name: &str) -> Result<String, CredentialError> {
        match env::var(name) {
            Ok(value) if !value.is_empty() => {
                debug!("Resolved credential {} from environment", name);
                Ok(value)
            }
            _ => Err(CredentialError::CredentialNotFound {
                name: name.to_string(),
            }),
        }
    }
}

/// Fixed credential set, used for local invocations and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialProvider {
    values: HashMap<String, String>,
}

impl StaticCredentialProvider {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, name: &str) -> Result<String, CredentialError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| CredentialError::CredentialNotFound {
                name: name.to_string(),
            })
    }
}

/// True for variable names whose values must not appear in logs.
pub fn is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    FORWARDED_CREDENTIALS.contains(&name)
        || SESSION_CREDENTIALS.contains(&name)
        || lower.contains("password")
        || lower.contains("secret")
        || lower.contains("token")
}

/// Replace the value half of a `KEY=VALUE` pair with `***` when the key is sensitive.
pub fn redact_assignment(assignment: &str) -> String {
    match assignment.split_once('=') {
        Some((name, _)) if is_sensitive(name) => format!("{}=***", name),
        _ => assignment.to_string(),
    }
}
