use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config_loader::SupervisorConfig;
use serde_json::Value as JsonValue;
use std::io::Read;
use std::path::{Path, PathBuf};
use supervisor::host::{self, RuntimeApiClient};
use supervisor::{build_supervisor, respond, LogNames};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "supervisor", version)]
struct Cli {
    /// Log group name reported in the result header
    #[arg(long, global = true, env = "AWS_LAMBDA_LOG_GROUP_NAME", default_value = "")]
    log_group: String,
    /// Log stream name reported in the result header
    #[arg(long, global = true, env = "AWS_LAMBDA_LOG_STREAM_NAME", default_value = "")]
    log_stream: String,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process events from the host runtime API
    Serve {
        /// Runtime API address (host:port)
        #[arg(long, env = "AWS_LAMBDA_RUNTIME_API")]
        runtime_api: String,
        /// Stop after this many events
        #[arg(long)]
        max_invocations: Option<u64>,
    },
    /// Handle a single event read from a file, or stdin with "-"
    Invoke {
        #[arg(value_name = "EVENT", default_value = "-")]
        event: PathBuf,
        #[arg(long)]
        request_id: Option<String>,
        /// Print the result envelope as JSON instead of the plain-text report
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let names = LogNames {
        group: cli.log_group,
        stream: cli.log_stream,
    };

    match cli.cmd {
        Commands::Serve {
            runtime_api,
            max_invocations,
        } => {
            let client = RuntimeApiClient::new(&runtime_api)?;
            let config = match SupervisorConfig::from_env() {
                Ok(config) => config,
                Err(err) => {
                    if let Err(report_err) = client.post_init_error("ConfigError", &err.to_string()) {
                        tracing::warn!("Failed to report init error: {}", report_err);
                    }
                    return Err(err).context("Failed to load supervisor configuration");
                }
            };
            let supervisor = build_supervisor(config);

            let handled = host::serve(&client, max_invocations, |invocation, event| {
                respond(
                    &supervisor,
                    &invocation.request_id,
                    invocation.deadline,
                    event,
                    &names,
                )
            })?;
            tracing::info!("Processed {} invocation(s)", handled);
        }
        Commands::Invoke {
            event,
            request_id,
            json,
        } => {
            let config =
                SupervisorConfig::from_env().context("Failed to load supervisor configuration")?;
            let event = read_event(&event)?;
            let request_id =
                request_id.unwrap_or_else(|| format!("local-{}", Utc::now().timestamp_millis()));
            let supervisor = build_supervisor(config);

            if json {
                let ctx = capsules_udocker_exec::InvocationContext::new(&request_id)
                    .with_log_names(&names.group, &names.stream);
                let envelope = supervisor.handle(&event, &ctx);
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else {
                print!("{}", respond(&supervisor, &request_id, None, &event, &names));
            }
        }
    }
    Ok(())
}

fn read_event(path: &Path) -> Result<JsonValue> {
    let raw = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read event from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file {}", path.display()))?
    };
    serde_json::from_str(&raw).context("Event is not valid JSON")
}
