//! replbox — persistent Python REPL sandboxes in Docker
//!
//! Usage:
//!   replbox exec "print(1 + 1)"
//!   replbox repl --session analysis --shared-dir ./data
//!   replbox mcp --session agent-7

mod repl;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::info;

use replbox_core::config::{ReplboxConfig, default_config_path};
use replbox_core::doctor::{CheckStatus, run_doctor};
use replbox_core::sandbox::docker::{container_name, validate_session_id, volume_name};
use replbox_core::sandbox::engine::resolve_socket_path;
use replbox_core::sandbox::{
    ContainerRuntime, DockerEngine, DockerSandbox, ExecuteCodeResult, NetworkMode, SandboxConfig,
    SandboxError,
};
use replbox_core::tools::{ToolRegistry, shared_sandbox};
use replbox_mcp::{McpServer, McpToolAdapter};

#[derive(Parser, Debug)]
#[command(name = "replbox", version, about = "Persistent Python REPL sandboxes in Docker")]
struct Cli {
    /// Config file (default: ~/.replbox/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session id used to name the container and volume (default: random)
    #[arg(long, global = true)]
    session: Option<String>,

    /// Host directory mounted at /shared
    #[arg(long, global = true)]
    shared_dir: Option<PathBuf>,

    /// Network access: bridge or none
    #[arg(long, global = true)]
    network: Option<NetworkMode>,

    /// Per-cell timeout in seconds (0 disables)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Container image
    #[arg(long, global = true)]
    image: Option<String>,

    /// Skip installing the default package set
    #[arg(long, global = true)]
    no_pre_install: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one piece of code in a fresh sandbox
    Exec {
        /// Code to run; reads stdin when omitted or "-"
        code: Option<String>,
        /// Read code from a file instead
        #[arg(long, short, conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that packages install cleanly in a fresh sandbox
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Interactive session against one sandbox
    Repl,
    /// Serve execute_code and install_package over MCP on stdio
    Mcp,
    /// Force-remove the container and volume left by a session
    Cleanup,
    /// Check Docker and local setup
    Doctor,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = sandbox_config(&cli)?;

    match &cli.command {
        Command::Exec { code, file, json } => {
            let code = read_code(code.as_deref(), file.as_deref()).await?;
            cmd_exec(&session_id(&cli), config, &code, *json).await
        }
        Command::Install { packages, json } => {
            cmd_install(&session_id(&cli), config, packages, *json).await
        }
        Command::Repl => {
            let mut sandbox = start_sandbox(&session_id(&cli), config).await?;
            let result = repl::run(&mut sandbox).await;
            sandbox.stop().await;
            result.map(|_| ExitCode::SUCCESS)
        }
        Command::Mcp => cmd_mcp(&session_id(&cli), config).await,
        Command::Cleanup => {
            let Some(session) = cli.session.as_deref() else {
                bail!("cleanup needs --session");
            };
            cmd_cleanup(session, &config).await
        }
        Command::Doctor => cmd_doctor(cli.config.clone(), &config).await,
    }
}

/// Config file values with command-line overrides applied
fn sandbox_config(cli: &Cli) -> Result<SandboxConfig> {
    let mut config = ReplboxConfig::load(cli.config.as_deref())?.sandbox;
    if let Some(dir) = &cli.shared_dir {
        config.shared_dir = dir.clone();
    }
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(image) = &cli.image {
        config.image = image.clone();
    }
    if cli.no_pre_install {
        config.pre_install.clear();
    }
    Ok(config)
}

fn session_id(cli: &Cli) -> String {
    cli.session.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        id[..12].to_string()
    })
}

async fn read_code(code: Option<&str>, file: Option<&Path>) -> Result<String> {
    if let Some(path) = file {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    match code {
        Some(code) if code != "-" => Ok(code.to_string()),
        _ => {
            let mut code = String::new();
            tokio::io::stdin()
                .read_to_string(&mut code)
                .await
                .context("Failed to read code from stdin")?;
            Ok(code)
        }
    }
}

async fn start_sandbox(session: &str, config: SandboxConfig) -> Result<DockerSandbox> {
    let mut sandbox = DockerSandbox::new(session, config)?;
    info!("Starting sandbox {}", sandbox.container_name());
    sandbox.start().await.context("Failed to start sandbox")?;
    Ok(sandbox)
}

/// Process exit status for a cell's exit code. Codes outside 0..=255 are
/// reported as 1 so a failing cell never looks successful.
fn exit_code(code: i64) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn print_result(result: &ExecuteCodeResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
    }
    Ok(())
}

async fn cmd_exec(session: &str, config: SandboxConfig, code: &str, json: bool) -> Result<ExitCode> {
    if code.trim().is_empty() {
        bail!("No code to run");
    }
    let mut sandbox = start_sandbox(session, config).await?;
    let outcome = tokio::select! {
        r = sandbox.run_code(code, None) => Some(r),
        _ = tokio::signal::ctrl_c() => None,
    };
    sandbox.stop().await;

    match outcome {
        Some(Ok(result)) | Some(Err(SandboxError::Timeout { result, .. })) => {
            print_result(&result, json)?;
            Ok(exit_code(result.exit_code))
        }
        Some(Err(e)) => Err(e.into()),
        None => Ok(ExitCode::from(130)),
    }
}

async fn cmd_install(
    session: &str,
    config: SandboxConfig,
    packages: &[String],
    json: bool,
) -> Result<ExitCode> {
    let mut sandbox = start_sandbox(session, config).await?;
    let outcome = sandbox.run_install(packages).await;
    sandbox.stop().await;

    let result = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.output);
    }
    Ok(exit_code(result.exit_code))
}

async fn cmd_mcp(session: &str, config: SandboxConfig) -> Result<ExitCode> {
    let timeout_secs = config.timeout_secs;
    let sandbox = start_sandbox(session, config).await?;
    let instructions = format!(
        "Python sandbox session {}. Use execute_code to run code; state persists \
         between calls. Use install_package to add packages. Files in /shared are \
         visible to the host.",
        sandbox.session_id()
    );
    let shared = shared_sandbox(sandbox);
    let registry = ToolRegistry::for_sandbox(shared.clone(), timeout_secs);
    let server = McpServer::new(McpToolAdapter::new(Arc::new(registry)))
        .with_instructions(instructions);

    let served = tokio::select! {
        r = server.serve_stdio() => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };
    shared.lock().await.stop().await;
    served.map(|_| ExitCode::SUCCESS)
}

async fn cmd_cleanup(session: &str, config: &SandboxConfig) -> Result<ExitCode> {
    let session = validate_session_id(session)?;
    let engine = DockerEngine::new(resolve_socket_path(&config.docker_socket))?;
    let container = container_name(&config.name_prefix, &session);
    let volume = volume_name(&config.name_prefix, &session);

    let removed_container = engine.remove_container(&container).await?;
    let removed_volume = engine.remove_volume(&volume).await?;
    println!(
        "container {}: {}",
        container,
        if removed_container { "removed" } else { "not found" }
    );
    println!(
        "volume {}: {}",
        volume,
        if removed_volume { "removed" } else { "not found" }
    );
    Ok(ExitCode::SUCCESS)
}

async fn cmd_doctor(config_path: Option<PathBuf>, config: &SandboxConfig) -> Result<ExitCode> {
    let engine = DockerEngine::new(resolve_socket_path(&config.docker_socket))?;
    let config_path = config_path.or_else(default_config_path);
    let report = run_doctor(config_path.as_deref(), config, &engine).await;

    for check in &report.checks {
        println!("[{}] {}: {}", check.status, check.name, check.message);
        if check.status != CheckStatus::Pass
            && let Some(hint) = &check.fix_hint
        {
            println!("       fix: {}", hint);
        }
    }
    println!("\n{}", report.summary());

    Ok(if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
