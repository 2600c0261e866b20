//! Client for the function host's runtime API.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::blocking::{Client, Response};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const API_VERSION: &str = "2018-06-01";
pub const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
pub const DEADLINE_HEADER: &str = "Lambda-Runtime-Deadline-Ms";

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Runtime API request to {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },

    #[error("Runtime API returned status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Runtime API response is missing header {name}")]
    MissingHeader { name: &'static str },

    #[error("Runtime API header {name} has invalid value '{value}'")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Runtime API configuration error: {message}")]
    Config { message: String },
}

impl HostError {
    pub fn code(&self) -> &'static str {
        match self {
            HostError::Http { .. } => "HOST_HTTP_ERROR",
            HostError::Status { .. } => "HOST_STATUS_ERROR",
            HostError::MissingHeader { .. } => "HOST_MISSING_HEADER",
            HostError::InvalidHeader { .. } => "HOST_INVALID_HEADER",
            HostError::Config { .. } => "HOST_CONFIG_ERROR",
        }
    }
}

/// One event handed out by the host.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request_id: String,
    pub deadline: Option<DateTime<Utc>>,
    /// The event body; `Err` holds the parse failure when the body was not JSON.
    pub event: Result<JsonValue, String>,
}

pub struct RuntimeApiClient {
    client: Client,
    base_url: String,
}

impl RuntimeApiClient {
    /// `api_addr` is the `host:port` from `AWS_LAMBDA_RUNTIME_API`, optionally with a scheme.
    pub fn new(api_addr: &str) -> Result<Self, HostError> {
        let addr = api_addr.trim().trim_end_matches('/');
        if addr.is_empty() {
            return Err(HostError::Config {
                message: "runtime API address is empty".to_string(),
            });
        }
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };

        // The next-invocation call long-polls, so only connects are bounded client-wide.
        let client = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|source| HostError::Http {
                url: base.clone(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: format!("{}/{}", base, API_VERSION),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Block until the host hands out the next event.
    pub fn next_invocation(&self) -> Result<Invocation, HostError> {
        let url = format!("{}/runtime/invocation/next", self.base_url);
        debug!("Polling {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|source| HostError::Http {
                url: url.clone(),
                source,
            })?;
        let response = ensure_success(&url, response)?;

        let request_id = header(&response, REQUEST_ID_HEADER)?.ok_or(HostError::MissingHeader {
            name: REQUEST_ID_HEADER,
        })?;
        let deadline = match header(&response, DEADLINE_HEADER)? {
            Some(raw) => Some(parse_deadline(&raw)?),
            None => None,
        };

        let body = response.text().map_err(|source| HostError::Http {
            url: url.clone(),
            source,
        })?;
        let event = serde_json::from_str(&body).map_err(|err| err.to_string());

        info!(request_id = %request_id, "Received invocation");
        Ok(Invocation {
            request_id,
            deadline,
            event,
        })
    }

    /// Post the plain-text result; the host expects it as a JSON string.
    pub fn post_response(&self, request_id: &str, text: &str) -> Result<(), HostError> {
        let url = format!("{}/runtime/invocation/{}/response", self.base_url, request_id);
        self.post_json(&url, &JsonValue::String(text.to_string()))
    }

    pub fn post_invocation_error(
        &self,
        request_id: &str,
        error_type: &str,
        message: &str,
    ) -> Result<(), HostError> {
        let url = format!("{}/runtime/invocation/{}/error", self.base_url, request_id);
        self.post_json(&url, &error_body(error_type, message))
    }

    pub fn post_init_error(&self, error_type: &str, message: &str) -> Result<(), HostError> {
        let url = format!("{}/runtime/init/error", self.base_url);
        self.post_json(&url, &error_body(error_type, message))
    }

    fn post_json(&self, url: &str, body: &JsonValue) -> Result<(), HostError> {
        let response = self
            .client
            .post(url)
            .timeout(Duration::from_secs(30))
            .json(body)
            .send()
            .map_err(|source| HostError::Http {
                url: url.to_string(),
                source,
            })?;
        ensure_success(url, response)?;
        Ok(())
    }
}

/// Poll, handle and respond until `max_invocations` events were processed or the
/// host stops answering. Returns the number of handled events.
pub fn serve<H>(
    client: &RuntimeApiClient,
    max_invocations: Option<u64>,
    mut handler: H,
) -> Result<u64, HostError>
where
    H: FnMut(&Invocation, &JsonValue) -> String,
{
    let mut handled = 0;
    while max_invocations.map_or(true, |max| handled < max) {
        let invocation = match client.next_invocation() {
            Ok(invocation) => invocation,
            Err(err) => {
                error!("Failed to obtain next invocation: {}", err);
                if let Err(report_err) = client.post_init_error(err.code(), &err.to_string()) {
                    warn!("Failed to report runtime error: {}", report_err);
                }
                return Err(err);
            }
        };

        match &invocation.event {
            Ok(event) => {
                let text = handler(&invocation, event);
                client.post_response(&invocation.request_id, &text)?;
            }
            Err(message) => {
                warn!(request_id = %invocation.request_id, "Event body is not JSON: {}", message);
                client.post_invocation_error(
                    &invocation.request_id,
                    "InvalidEvent",
                    &format!("Event body is not valid JSON: {}", message),
                )?;
            }
        }
        handled += 1;
    }
    Ok(handled)
}

fn ensure_success(url: &str, response: Response) -> Result<Response, HostError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(HostError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn header(response: &Response, name: &'static str) -> Result<Option<String>, HostError> {
    match response.headers().get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.to_string()))
            .map_err(|_| HostError::InvalidHeader {
                name,
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            }),
    }
}

fn parse_deadline(raw: &str) -> Result<DateTime<Utc>, HostError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| HostError::InvalidHeader {
            name: DEADLINE_HEADER,
            value: raw.to_string(),
        })
}

fn error_body(error_type: &str, message: &str) -> JsonValue {
    json!({
        "errorType": error_type,
        "errorMessage": message,
    })
}
