//! Per-invocation supervisor that runs a user container image through `udocker`
//! inside a restricted function sandbox.
//!
//! A call to [`Supervisor::handle`] prepares the scratch workspace, makes sure the
//! image and the reserved container instance exist, stages the triggering object in,
//! runs the container, publishes anything written to the output directory and
//! reports the result as a [`envelope::ResultEnvelope`]. Failures never escape as
//! errors; they are reported in the envelope and rendered by
//! [`report::render_plain_text`].

pub mod command;
pub mod context;
pub mod event;
pub mod orchestrator;
pub mod process;
pub mod provisioner;
pub mod report;
pub mod runner;
pub mod staging;
pub mod workspace;

pub use command::{
    CommandBuilder, EnvironmentSet, ExecutionCommand, MuslMarkerProbe, ShellDetector, ShellKind,
};
pub use context::InvocationContext;
pub use event::{classify, TriggerEvent};
pub use orchestrator::{Envelope, InvocationOutput, Phase, Supervisor, SupervisorError};
pub use provisioner::{ContainerRegistration, ExecMode, Provisioner, RuntimeTool, UdockerCli};
pub use report::render_plain_text;
pub use runner::{ExecutionResult, ProcessRunner};
pub use staging::{stage_input, stage_output, FsObjectStore, ObjectStore, OutputStaging};
pub use workspace::{Workspace, WorkspaceLayout};
