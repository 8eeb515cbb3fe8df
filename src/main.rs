use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use storyloop::agent::ClaudeCliAgent;
use storyloop::config::Config;
use storyloop::gate::GateBroker;
use storyloop::orchestrator::{RunRequest, WorkflowRunner};
use storyloop::server::{start_server, AppState};
use storyloop::status::RunStreams;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "storyloop")]
#[command(about = "Story-driven background coding runs with human approval gates")]
#[command(version)]
struct Cli {
    /// Increase log verbosity
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a config file (defaults to ./storyloop.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one run against a repository, streaming events to stdout
    Run {
        /// Repository to work on (https://github.com/owner/repo)
        repo_url: String,

        /// What to build
        prompt: String,

        /// Skip story-by-story approval gates
        #[arg(long)]
        yolo: bool,

        /// Agent turn limit per story
        #[arg(long)]
        max_turns_per_story: Option<u32>,

        /// Port for the approval API while the run is active
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the HTTP API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("storyloop={default_level}"))),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            repo_url,
            prompt,
            yolo,
            max_turns_per_story,
            port,
        } => {
            run_once(
                config,
                RunRequest {
                    repo_url,
                    prompt,
                    yolo_mode: yolo,
                    max_turns_per_story,
                },
                port,
            )
            .await
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.port);
            let agent = Arc::new(ClaudeCliAgent::new(
                config.agent_cmd.clone(),
                config.model.clone(),
            ));
            let state = AppState::new(config, agent, GateBroker::new());
            start_server(state, port).await
        }
    }
}

/// Drive a single run from the CLI. The approval API stays up for the
/// duration so gates can be answered over HTTP; every status and chat event
/// goes to stdout as one JSON line.
async fn run_once(config: Config, request: RunRequest, port: Option<u16>) -> Result<()> {
    if !request.repo_url.starts_with("https://github.com/") {
        return Err(storyloop::errors::WorkflowError::InvalidRepoUrl(request.repo_url).into());
    }
    let port = port.unwrap_or(config.port);
    let gates = GateBroker::new();
    let agent = Arc::new(ClaudeCliAgent::new(
        config.agent_cmd.clone(),
        config.model.clone(),
    ));

    let state = AppState::new(config.clone(), agent.clone(), gates.clone());
    tokio::spawn(async move {
        if let Err(err) = start_server(state, port).await {
            tracing::error!(%err, "approval API failed to start");
        }
    });

    let streams = RunStreams::default();
    let mut status_rx = streams.status.subscribe();
    let mut chat_rx = streams.chat.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                line = status_rx.recv() => match line {
                    Ok(line) => println!("{line}"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
                line = chat_rx.recv() => match line {
                    Ok(line) => println!("{line}"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            }
        }
    });

    let runner = WorkflowRunner::new(config, agent, gates);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let result = runner.run(request, streams, cancel_rx).await;
    let _ = printer.await;

    match result {
        Ok(outcome) => {
            tracing::info!(
                stories_completed = outcome.stories_completed,
                stories_failed = outcome.stories_failed,
                branch_url = outcome.branch_url.as_deref().unwrap_or("-"),
                pr_url = outcome.pr_url.as_deref().unwrap_or("-"),
                "run finished"
            );
            Ok(())
        }
        Err(err) => {
            tracing::error!("{}", err.user_message());
            std::process::exit(1);
        }
    }
}
