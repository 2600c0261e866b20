use crate::envelope::*;
use chrono::Utc;
use std::time::Duration;

pub struct ResultEnvelopeBuilder<T> {
    result: Option<OperationResult<T>>,
    diagnostics: Vec<Diagnostic>,
    metrics: Option<Metrics>,
    provenance: Option<Provenance>,
}

impl<T> Default for ResultEnvelopeBuilder<T> {
    fn default() -> Self {
        Self {
            result: None,
            diagnostics: Vec::new(),
            metrics: None,
            provenance: None,
        }
    }
}

impl<T> ResultEnvelopeBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(mut self, result: OperationResult<T>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn success(mut self, data: T) -> Self {
        self.result = Some(OperationResult::success(data));
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.result = Some(OperationResult::error(message));
        self
    }

    pub fn error_with_code(mut self, message: impl Into<String>, code: impl Into<String>) -> Self {
        self.result = Some(OperationResult::error_with_code(message, code));
        self
    }

    pub fn add_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }

    pub fn add_info(self, message: impl Into<String>) -> Self {
        self.add_diagnostic(Diagnostic::info(message))
    }

    pub fn add_warning(self, message: impl Into<String>) -> Self {
        self.add_diagnostic(Diagnostic::warning(message))
    }

    pub fn add_error(self, message: impl Into<String>) -> Self {
        self.add_diagnostic(Diagnostic::error(message))
    }

    pub fn add_debug(self, message: impl Into<String>) -> Self {
        self.add_diagnostic(Diagnostic::debug(message))
    }

    pub fn diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Record the wall time of one named phase, creating the metrics block on first use.
    pub fn record_phase(mut self, phase: impl Into<String>, elapsed: Duration) -> Self {
        let metrics = self.metrics.get_or_insert_with(Metrics::default);
        let duration = metrics.duration.get_or_insert_with(DurationMetrics::default);
        duration
            .phases
            .insert(phase.into(), elapsed.as_secs_f64() * 1000.0);
        self
    }

    pub fn total_duration(mut self, elapsed: Duration) -> Self {
        let metrics = self.metrics.get_or_insert_with(Metrics::default);
        metrics
            .duration
            .get_or_insert_with(DurationMetrics::default)
            .total_ms = Some(elapsed.as_secs_f64() * 1000.0);
        self
    }

    pub fn counter(mut self, name: impl Into<String>, value: i64) -> Self {
        self.metrics
            .get_or_insert_with(Metrics::default)
            .counters
            .insert(name.into(), value);
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn with_timing<F, R>(self, f: F) -> (Self, R)
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        (self.total_duration(start.elapsed()), result)
    }

    pub fn with_source_info(
        mut self,
        system: impl Into<String>,
        version: Option<impl Into<String>>,
        instance: Option<impl Into<String>>,
    ) -> Self {
        let source_info = SourceInfo {
            system: system.into(),
            version: version.map(Into::into),
            instance: instance.map(Into::into),
        };

        let mut provenance = self.provenance.take().unwrap_or_default();
        provenance.source = Some(source_info);
        provenance.timestamp = Some(Utc::now());
        self.provenance(provenance)
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        let mut provenance = self.provenance.take().unwrap_or_default();
        provenance.trace_id = Some(trace_id.into());
        self.provenance = Some(provenance);
        self
    }

    pub fn add_step(mut self, step: ProcessingStep) -> Self {
        self.provenance
            .get_or_insert_with(Provenance::default)
            .chain
            .push(step);
        self
    }

    pub fn build(self) -> Result<ResultEnvelope<T>, BuildError> {
        let result = self.result.ok_or(BuildError::MissingResult)?;

        Ok(ResultEnvelope {
            result,
            diagnostics: self.diagnostics,
            metrics: self.metrics,
            provenance: self.provenance,
        })
    }
}

impl<T> ResultEnvelope<T> {
    pub fn builder() -> ResultEnvelopeBuilder<T> {
        ResultEnvelopeBuilder::new()
    }
}

impl Default for Provenance {
    fn default() -> Self {
        Self {
            source: None,
            timestamp: Some(Utc::now()),
            trace_id: None,
            chain: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Result is required to build an envelope")]
    MissingResult,
}
