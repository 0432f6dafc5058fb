//! omnilink - command-line front end for the analysis server layer.
//!
//! ```text
//! omnilink targets <dir>                      list launch targets
//! omnilink run <dir> [--command C --args J]   start, wait, request, stop
//! ```
//!
//! Logs go to `~/.omnilink/logs/omnilink.log` so stdout stays reserved for
//! command output.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use omnilink_config::{OmnilinkConfig, config_path};
use omnilink_server::types::DEFAULT_MAX_PROJECT_RESULTS;
use omnilink_server::{
    EngineDeps, EngineKind, LaunchTarget, StartRequest, create_engine, find_launch_targets,
};
use serde_json::Value;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    /// Line-delimited packets over stdio
    Stdio,
    /// Language server protocol
    Lsp,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Stdio => EngineKind::Stdio,
            EngineArg::Lsp => EngineKind::Lsp,
        }
    }
}

#[derive(Parser)]
#[command(name = "omnilink")]
#[command(about = "Launch a code analysis server for a workspace and talk to it", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.omnilink/config.toml
    #[arg(long, env = "OMNILINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the solutions, projects and folders the server can be launched on
    Targets {
        /// Workspace root
        dir: PathBuf,

        /// Print targets as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the server, wait for it to initialize, optionally send one request, then stop it
    Run {
        /// Workspace root
        dir: PathBuf,

        /// Index into the `targets` listing
        #[arg(long, default_value = "0")]
        target: usize,

        /// Request to send once the server is ready, e.g. `/projects`
        #[arg(long)]
        command: Option<String>,

        /// JSON arguments for the request
        #[arg(long, requires = "command")]
        args: Option<String>,

        /// Override the configured engine
        #[arg(long, value_enum)]
        engine: Option<EngineArg>,
    },
}

fn init_tracing(config: Option<&OmnilinkConfig>) {
    let configured = config.and_then(OmnilinkConfig::log_filter);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file(config);

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: keep stdout clean for command output.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn open_log_file(config: Option<&OmnilinkConfig>) -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates(config) {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates(config: Option<&OmnilinkConfig>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(file) = config.and_then(OmnilinkConfig::log_file) {
        candidates.push(file);
    }

    // Primary: ~/.omnilink/logs/omnilink.log
    if let Some(path) = config_path()
        && let Some(dir) = path.parent()
    {
        candidates.push(dir.join("logs").join("omnilink.log"));
    }

    // Fallback: ./.omnilink/logs/omnilink.log
    candidates.push(PathBuf::from(".omnilink").join("logs").join("omnilink.log"));

    candidates
}

fn load_config(path: Option<&Path>) -> Result<Option<OmnilinkConfig>> {
    let config = match path {
        Some(path) => OmnilinkConfig::load_from(path)?,
        None => OmnilinkConfig::load()?,
    };
    Ok(config)
}

fn workspace_targets(dir: &Path, max_results: usize) -> Result<(PathBuf, Vec<LaunchTarget>)> {
    let root = fs::canonicalize(dir)
        .with_context(|| format!("workspace {} is not accessible", dir.display()))?;
    let targets = find_launch_targets(&root, max_results);
    Ok((root, targets))
}

fn print_targets(targets: &[LaunchTarget], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(targets)?);
        return Ok(());
    }
    for (index, target) in targets.iter().enumerate() {
        println!(
            "{index}\t{:?}\t{}\t{}",
            target.kind,
            target.label,
            target.target.display()
        );
    }
    Ok(())
}

async fn run(
    config: Option<&OmnilinkConfig>,
    dir: &Path,
    target: usize,
    command: Option<&str>,
    args: Option<&str>,
    engine_kind: Option<EngineArg>,
) -> Result<()> {
    let mut options = config
        .map(OmnilinkConfig::server_options)
        .unwrap_or_default();
    if let Some(kind) = engine_kind {
        options.engine = kind.into();
    }

    let (root, targets) = workspace_targets(dir, options.max_project_results)?;
    let Some(target) = targets.into_iter().nth(target) else {
        bail!("no launch target #{target} in {}", root.display());
    };
    let arguments: Option<Value> = args
        .map(serde_json::from_str)
        .transpose()
        .context("--args is not valid JSON")?;

    let engine = create_engine(options, EngineDeps::default());
    tracing::info!(target = %target.target.display(), "starting server");
    engine
        .start(StartRequest {
            cwd: root,
            args: Vec::new(),
            target,
        })
        .await
        .context("starting server")?;

    let outcome = tokio::select! {
        outcome = async {
            engine.wait_for_initialize().await;
            match command {
                Some(command) => engine
                    .make_request(command, arguments, None)
                    .await
                    .map(Some)
                    .with_context(|| format!("request {command} failed")),
                None => Ok(None),
            }
        } => outcome,
        _ = signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(None)
        }
    };

    if let Err(e) = engine.stop().await {
        tracing::warn!("stopping server: {e}");
    }

    if let Some(body) = outcome? {
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(config.as_ref());

    match cli.command {
        Command::Targets { dir, json } => {
            let max_results = config
                .as_ref()
                .map_or(DEFAULT_MAX_PROJECT_RESULTS, |c| {
                    c.server_options().max_project_results
                });
            let (_, targets) = workspace_targets(&dir, max_results)?;
            print_targets(&targets, json)
        }
        Command::Run {
            dir,
            target,
            command,
            args,
            engine,
        } => {
            run(
                config.as_ref(),
                &dir,
                target,
                command.as_deref(),
                args.as_deref(),
                engine,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_request() {
        let cli = Cli::try_parse_from([
            "omnilink",
            "run",
            "/work",
            "--command",
            "/projects",
            "--args",
            "{}",
            "--engine",
            "lsp",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                command, engine, ..
            } => {
                assert_eq!(command.as_deref(), Some("/projects"));
                assert!(matches!(engine, Some(EngineArg::Lsp)));
            }
            Command::Targets { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn cli_args_require_command() {
        assert!(Cli::try_parse_from(["omnilink", "run", "/work", "--args", "{}"]).is_err());
    }

    #[test]
    fn log_candidates_end_with_local_fallback() {
        let candidates = log_file_candidates(None);
        assert_eq!(
            candidates.last(),
            Some(&PathBuf::from(".omnilink").join("logs").join("omnilink.log"))
        );
    }

    #[test]
    fn workspace_targets_lists_csx_folder() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("build.csx"), b"").unwrap();
        let (root, targets) = workspace_targets(dir.path(), 10).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].target, root);
    }
}
