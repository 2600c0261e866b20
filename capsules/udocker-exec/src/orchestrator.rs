use crate::command::{BuildError, CommandBuilder, EnvironmentSet, MuslMarkerProbe, ShellDetector};
use crate::context::InvocationContext;
use crate::event::{classify, TriggerEvent};
use crate::provisioner::{ExecMode, Provisioner, RuntimeTool, RuntimeToolError, UdockerCli};
use crate::runner::{ExecutionResult, ProcessRunner, RunError};
use crate::staging::{stage_input, stage_output, ObjectStore, OutputStaging, StoreError};
use crate::workspace::{Workspace, WorkspaceError, WorkspaceLayout};
use config_loader::{CredentialProvider, EnvCredentialProvider, SupervisorConfig};
use envelope::{Diagnostic, ProcessingStep, ResultEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, info_span, warn};

pub type Envelope = ResultEnvelope<InvocationOutput>;

const SOURCE: &str = "udocker-exec";

/// Lifecycle of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Preparing,
    Provisioning,
    StagingIn,
    Building,
    Executing,
    StagingOut,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Provisioning => "provisioning",
            Phase::StagingIn => "stagingIn",
            Phase::Building => "building",
            Phase::Executing => "executing",
            Phase::StagingOut => "stagingOut",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Workspace preparation failed")]
    Workspace(#[from] WorkspaceError),
    #[error("Container provisioning failed")]
    Provisioning(#[from] RuntimeToolError),
    #[error("Input staging failed")]
    InputStaging(#[from] StoreError),
    #[error("Container command could not be built")]
    Build(#[from] BuildError),
    #[error("Container execution failed")]
    Execution(#[from] RunError),
}

impl SupervisorError {
    pub fn phase(&self) -> Phase {
        match self {
            SupervisorError::Workspace(_) => Phase::Preparing,
            SupervisorError::Provisioning(_) => Phase::Provisioning,
            SupervisorError::InputStaging(_) => Phase::StagingIn,
            SupervisorError::Build(_) => Phase::Building,
            SupervisorError::Execution(_) => Phase::Executing,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Workspace(_) => "SUPERVISOR_WORKSPACE_ERROR",
            SupervisorError::Provisioning(_) => "SUPERVISOR_PROVISIONING_ERROR",
            SupervisorError::InputStaging(_) => "SUPERVISOR_INPUT_STAGING_ERROR",
            SupervisorError::Build(_) => "SUPERVISOR_BUILD_ERROR",
            SupervisorError::Execution(_) => "SUPERVISOR_EXECUTION_ERROR",
        }
    }
}

/// Successful invocation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationOutput {
    pub log_group_name: String,
    pub log_stream_name: String,
    pub output: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub uploaded_keys: Vec<String>,
    #[serde(default)]
    pub timed_out: bool,
}

/// Per-invocation bookkeeping: where we are and how long each phase took.
struct Progress {
    phase: Phase,
    timings: Vec<(Phase, Duration)>,
    diagnostics: Vec<Diagnostic>,
}

impl Progress {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            timings: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn run<T, E>(&mut self, phase: Phase, step: impl FnOnce() -> Result<T, E>) -> Result<T, SupervisorError>
    where
        E: Into<SupervisorError>,
    {
        self.phase = phase;
        let span = info_span!("phase", name = phase.as_str());
        let _entered = span.enter();
        let started = Instant::now();
        let outcome = step().map_err(Into::into);
        self.timings.push((phase, started.elapsed()));
        outcome
    }

    fn note(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic.with_source(SOURCE));
    }
}

/// Runs one event through workspace preparation, provisioning, staging and execution.
pub struct Supervisor {
    config: SupervisorConfig,
    layout: WorkspaceLayout,
    store: Box<dyn ObjectStore>,
    tool: Box<dyn RuntimeTool>,
    detector: Box<dyn ShellDetector>,
    credentials: Box<dyn CredentialProvider>,
    runner: ProcessRunner,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Box<dyn ObjectStore>,
        tool: Box<dyn RuntimeTool>,
        detector: Box<dyn ShellDetector>,
        credentials: Box<dyn CredentialProvider>,
    ) -> Self {
        let layout = WorkspaceLayout::from_settings(&config.layout);
        Self {
            config,
            layout,
            store,
            tool,
            detector,
            credentials,
            runner: ProcessRunner,
        }
    }

    /// Production wiring: the installed udocker binary, the musl probe and host
    /// environment credentials.
    pub fn with_defaults(config: SupervisorConfig, store: Box<dyn ObjectStore>) -> Self {
        let layout = WorkspaceLayout::from_settings(&config.layout);
        let tool = UdockerCli::new(&layout.runtime_bin, &config.udocker_dir);
        Self::new(
            config,
            store,
            Box::new(tool),
            Box::new(MuslMarkerProbe),
            Box::new(EnvCredentialProvider::new()),
        )
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Handle one event. Every failure is folded into the returned envelope.
    pub fn handle(&self, event: &JsonValue, ctx: &InvocationContext) -> Envelope {
        let span = info_span!("invocation", request_id = %ctx.request_id);
        let _entered = span.enter();
        info!("Received event: {}", event);

        let started = Instant::now();
        let mut progress = Progress::new();
        let outcome = self.pipeline(event, ctx, &mut progress);
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => {
                progress.phase = Phase::Done;
                info!(exit_code = ?output.exit_code, "Invocation finished");
                self.success_envelope(output, progress, ctx, elapsed)
            }
            Err(err) => {
                progress.phase = Phase::Failed;
                self.error_envelope(err, progress, ctx, elapsed)
            }
        }
    }

    fn pipeline(
        &self,
        event: &JsonValue,
        ctx: &InvocationContext,
        progress: &mut Progress,
    ) -> Result<InvocationOutput, SupervisorError> {
        let workspace = progress.run(Phase::Preparing, || -> Result<_, WorkspaceError> {
            let workspace = Workspace::prepare(
                &self.layout,
                &ctx.request_id,
                self.config.init_script_path.as_deref(),
            )?;
            workspace.write_event(event)?;
            Ok(workspace)
        })?;

        let trigger = classify(event);
        progress.note(Diagnostic::info(format!("Trigger classified as {}", trigger.kind())));

        let registration = progress.run(Phase::Provisioning, || {
            Provisioner::new(
                self.tool.as_ref(),
                self.config.layout.container_name.as_str(),
                ExecMode::from(self.config.layout.exec_mode.clone()),
            )
            .ensure(&self.config.image_id)
        })?;
        if registration.freshly_provisioned {
            progress.note(Diagnostic::info(format!(
                "Provisioned container {} from {}",
                registration.container_name, registration.image_id
            )));
        }

        if let TriggerEvent::StorageNotification {
            bucket_name,
            object_key,
            record_count,
        } = &trigger
        {
            if *record_count > 1 {
                progress.note(Diagnostic::warning(format!(
                    "Only the first of {} storage records was processed",
                    record_count
                )));
            }
            progress.run(Phase::StagingIn, || {
                stage_input(self.store.as_ref(), bucket_name, object_key, &workspace)
            })?;
        }

        let command = progress.run(Phase::Building, || {
            let environment =
                EnvironmentSet::assemble(&self.config, self.credentials.as_ref(), &ctx.request_id);
            CommandBuilder::new(
                &self.layout,
                &self.config.udocker_dir,
                self.config.init_script_path.is_some(),
                self.detector.as_ref(),
            )
            .build(&registration, &environment, &trigger, ctx)
        })?;
        progress.note(
            Diagnostic::debug("Container command").with_context(json!({ "command": command.display() })),
        );

        let budget = self.time_budget(ctx);
        let result: ExecutionResult = progress.run(Phase::Executing, || {
            self.runner.run(&command, &workspace.execution_log(), budget)
        })?;
        if result.timed_out {
            progress.note(Diagnostic::warning(format!(
                "Container killed after exhausting its {} ms time budget",
                budget.map(|b| b.as_millis()).unwrap_or_default()
            )));
        }
        match result.exit_code {
            Some(0) => {}
            Some(code) => progress.note(Diagnostic::warning(format!(
                "Container exited with status {}",
                code
            ))),
            None => progress.note(Diagnostic::warning("Container was terminated by a signal")),
        }

        let mut uploaded_keys = Vec::new();
        if let Some(bucket) = trigger.bucket() {
            let staging: OutputStaging = progress
                .run(Phase::StagingOut, || {
                    Ok::<_, StoreError>(stage_output(self.store.as_ref(), bucket, &workspace))
                })?;
            for failure in &staging.failures {
                progress.note(
                    Diagnostic::warning(format!("Failed to upload {}: {}", failure.key, failure.message))
                        .with_context(json!({ "bucket": bucket, "key": failure.key })),
                );
            }
            if let Some(message) = &staging.cleanup_error {
                progress.note(Diagnostic::warning(format!(
                    "Output directory cleanup failed: {}",
                    message
                )));
            }
            uploaded_keys = staging.uploaded;
        }

        Ok(InvocationOutput {
            log_group_name: ctx.log_group_name.clone(),
            log_stream_name: ctx.log_stream_name.clone(),
            output: result.output,
            exit_code: result.exit_code,
            uploaded_keys,
            timed_out: result.timed_out,
        })
    }

    /// Remaining host time minus the configured grace, when enforcement is on.
    fn time_budget(&self, ctx: &InvocationContext) -> Option<Duration> {
        if !self.config.enforce_deadline {
            return None;
        }
        let remaining = ctx.remaining()?;
        let budget = remaining.saturating_sub(self.config.layout.deadline_grace());
        if budget.is_zero() {
            warn!("Deadline already within the grace period; running with a minimal budget");
            return Some(Duration::from_millis(1));
        }
        Some(budget)
    }

    fn success_envelope(
        &self,
        output: InvocationOutput,
        progress: Progress,
        ctx: &InvocationContext,
        elapsed: Duration,
    ) -> Envelope {
        let uploaded = output.uploaded_keys.len() as i64;
        let exit_code = output.exit_code.map(i64::from).unwrap_or(-1);
        let builder = Envelope::builder()
            .success(output)
            .counter("uploadedFiles", uploaded)
            .counter("exitCode", exit_code);
        self.finish(builder, progress, ctx, elapsed)
    }

    fn error_envelope(
        &self,
        err: SupervisorError,
        progress: Progress,
        ctx: &InvocationContext,
        elapsed: Duration,
    ) -> Envelope {
        let phase = err.phase();
        let code = err.code();
        let message = err.to_string();
        let report = anyhow::Error::new(err);
        error!(phase = %phase, "Invocation failed: {:#}", report);
        let causes: Vec<String> = report.chain().skip(1).map(|cause| cause.to_string()).collect();

        let details = json!({ "phase": phase.as_str(), "causes": causes });
        let mut error: envelope::OperationResult<InvocationOutput> =
            envelope::OperationResult::error_with_code(&message, code);
        if let envelope::OperationResult::Error { error: info, .. } = &mut error {
            info.details = Some(details.clone());
        }

        let builder = Envelope::builder().result(error).add_diagnostic(
            Diagnostic::error(format!("{}: {}", message, causes.join(": ")))
                .with_source(SOURCE)
                .with_context(details),
        );
        self.finish(builder, progress, ctx, elapsed)
    }

    fn finish(
        &self,
        mut builder: envelope::ResultEnvelopeBuilder<InvocationOutput>,
        progress: Progress,
        ctx: &InvocationContext,
        elapsed: Duration,
    ) -> Envelope {
        builder = builder.diagnostics(progress.diagnostics);
        for (phase, took) in &progress.timings {
            builder = builder
                .record_phase(phase.as_str(), *took)
                .add_step(ProcessingStep::now(phase.as_str(), Some(SOURCE)));
        }
        builder
            .add_step(ProcessingStep::now(progress.phase.as_str(), Some(SOURCE)))
            .total_duration(elapsed)
            .with_source_info(
                SOURCE,
                Some(env!("CARGO_PKG_VERSION")),
                Some(self.config.layout.container_name.clone()),
            )
            .with_trace_id(ctx.request_id.clone())
            .build()
            .unwrap_or_else(|_| Envelope {
                result: envelope::OperationResult::error("Invocation failed"),
                diagnostics: vec![],
                metrics: None,
                provenance: None,
            })
    }
}
