//! agent-launch CLI
//!
//! Entry point for the `agent-launch` command-line tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use agent_launch::cloud::{AwsCliProvider, CloudContext, CloudOp};
use agent_launch::config::{host_config_path, EffectiveConfig, PROJECT_CONFIG_FILE};
use agent_launch::signal::{SignalHandler, SignalState};
use agent_launch::state::state_path;
use agent_launch::{LaunchConfig, LaunchError, LaunchOutcome, LaunchReport, LaunchRequest, Launcher};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-launch")]
#[command(about = "Build and deploy an agent container to the managed runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bundle, build and deploy an agent
    Launch {
        /// Agent name (letters, digits and underscores)
        #[arg(long)]
        agent: Option<String>,

        /// Target region (default: us-east-1)
        #[arg(long)]
        region: Option<String>,

        /// Source directory holding the Dockerfile
        #[arg(long)]
        source: Option<PathBuf>,

        /// Deploy this image instead of building one
        #[arg(long, value_name = "URI")]
        prebuilt_image: Option<String>,

        /// Update an existing runtime with the same name instead of failing
        #[arg(long)]
        auto_update_on_conflict: bool,

        /// Build timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Runtime environment variable (repeatable)
        #[arg(long = "env", value_name = "K=V", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the current state of a build
    Status {
        /// Build job id printed by `launch`
        job_id: String,

        /// Region of the build (default: from config)
        #[arg(long)]
        region: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected K=V, got `{}`", raw)),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_launch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Launch {
            agent,
            region,
            source,
            prebuilt_image,
            auto_update_on_conflict,
            timeout,
            env,
            json,
        } => {
            let overrides = launch_overrides(
                agent,
                region,
                source,
                prebuilt_image,
                auto_update_on_conflict,
                timeout,
                env,
            );
            run_launch(overrides, json)
        }
        Commands::Status { job_id, region } => {
            let overrides = region.map(|r| json!({ "region": r }));
            run_status(&job_id, overrides)
        }
        Commands::Config => run_config(),
    };
    process::exit(code);
}

/// CLI flags as a config layer; unset flags leave lower layers alone
fn launch_overrides(
    agent: Option<String>,
    region: Option<String>,
    source: Option<PathBuf>,
    prebuilt_image: Option<String>,
    auto_update_on_conflict: bool,
    timeout: Option<u64>,
    env: Vec<(String, String)>,
) -> Value {
    let mut layer = Map::new();
    if let Some(agent) = agent {
        layer.insert("agent".into(), json!(agent));
    }
    if let Some(region) = region {
        layer.insert("region".into(), json!(region));
    }
    if let Some(source) = source {
        layer.insert("source".into(), json!(source));
    }
    if let Some(image) = prebuilt_image {
        layer.insert("prebuilt_image".into(), json!(image));
    }
    if auto_update_on_conflict {
        layer.insert("auto_update_on_conflict".into(), json!(true));
    }
    if let Some(secs) = timeout {
        layer.insert("timeouts".into(), json!({ "build_seconds": secs }));
    }
    if !env.is_empty() {
        let vars: BTreeMap<String, String> = env.into_iter().collect();
        layer.insert("env".into(), json!(vars));
    }
    Value::Object(layer)
}

fn load_config(overrides: Option<Value>) -> Result<EffectiveConfig, LaunchError> {
    let host = host_config_path();
    Ok(EffectiveConfig::build(
        host.as_deref(),
        Some(Path::new(PROJECT_CONFIG_FILE)),
        overrides,
    )?)
}

fn connect(config: &LaunchConfig) -> Result<CloudContext, LaunchError> {
    let provider = Arc::new(AwsCliProvider::new(config.aws_cli_config()));
    CloudContext::connect(provider, &config.region, &config.retry_policy())
        .map_err(|e| LaunchError::from_cloud("caller identity", CloudOp::GetCallerIdentity, e))
}

fn run_launch(overrides: Value, json_output: bool) -> i32 {
    let handler = SignalHandler::new();
    if let Err(e) = handler.install() {
        warn!(error = %e, "could not install the interrupt handler");
    }

    let report = match launch(overrides, handler.state()) {
        Ok(outcome) => LaunchReport::success(outcome),
        Err(e) => LaunchReport::failure(&e),
    };
    print_report(&report, json_output);
    report.exit_code
}

fn launch(overrides: Value, signals: Arc<SignalState>) -> Result<LaunchOutcome, LaunchError> {
    let config = load_config(Some(overrides))?.launch;
    let request = LaunchRequest::from_config(&config)?;
    let ctx = connect(&config)?;
    let state = state_path(&request.source_dir);
    Launcher::new(ctx, config, signals, state).launch(&request)
}

fn print_report(report: &LaunchReport, json_output: bool) {
    if json_output {
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error serializing report: {}", e),
        }
    } else {
        println!("{}", report.to_human());
    }
}

fn run_status(job_id: &str, overrides: Option<Value>) -> i32 {
    let result = load_config(overrides).and_then(|effective| {
        let config = effective.launch;
        let ctx = connect(&config)?;
        let state = state_path(&config.source);
        Launcher::new(ctx, config, Arc::new(SignalState::new()), state).status(job_id)
    });

    match result {
        Ok(snapshot) => {
            println!("{}: {}", snapshot.job_id, snapshot.status.as_str());
            for phase in &snapshot.phases {
                println!("  {:<16} {}", phase.name, phase.status.as_str());
                for message in &phase.messages {
                    println!("    {}", message);
                }
            }
            if let Some(log) = &snapshot.log {
                println!("  Logs: {}", log);
            }
            0
        }
        Err(e) => {
            print_report(&LaunchReport::failure(&e), false);
            e.exit_code()
        }
    }
}

fn run_config() -> i32 {
    match load_config(None) {
        Ok(effective) => match effective.to_json() {
            Ok(json) => {
                println!("{}", json);
                0
            }
            Err(e) => {
                eprintln!("Error serializing config: {}", e);
                1
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
