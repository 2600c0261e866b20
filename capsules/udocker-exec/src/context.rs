use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metadata the host supplies with each invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub request_id: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log_group_name: String,
    #[serde(default)]
    pub log_stream_name: String,
}

impl InvocationContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            deadline: None,
            log_group_name: String::new(),
            log_stream_name: String::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_log_names(
        mut self,
        group: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        self.log_group_name = group.into();
        self.log_stream_name = stream.into();
        self
    }

    /// Time left before the host deadline; `None` when no deadline is known.
    /// Zero once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Utc::now())
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let deadline = self.deadline?;
        Some((deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}
