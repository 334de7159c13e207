use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use swarm_core::config::{load_config, ConfigError, SwarmConfig, ValidationLevel};
use swarm_gateway::client::GatewayClient;
use swarm_web::{router, WebState};
use swarmd::{Orchestrator, OrchestratorError};

const DEFAULT_CONFIG: &str = "config/swarmops.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    config_path: PathBuf,
    bind_override: Option<String>,
    once: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Run(CliArgs),
    Help(String),
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("{0}")]
    Args(String),
    #[error("failed to load config at {path}: {source}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("{0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("failed to bind {bind}: {source}")]
    Bind {
        bind: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("swarm-web failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), MainError> {
    let mut argv = env::args();
    let program = argv.next().unwrap_or_else(|| "swarm-web".to_string());
    let command = parse_cli_args(argv.collect::<Vec<_>>(), &program)?;
    let args = match command {
        CliCommand::Run(args) => args,
        CliCommand::Help(text) => {
            println!("{text}");
            return Ok(());
        }
    };

    let config = load_config(&args.config_path).map_err(|source| MainError::LoadConfig {
        path: args.config_path.clone(),
        source,
    })?;
    validate_config(&config)?;
    let bind = args
        .bind_override
        .unwrap_or_else(|| config.web.bind.clone());

    let gateway = GatewayClient::new(config.gateway.url.clone(), config.gateway.token.clone());
    let orchestrator = Arc::new(Orchestrator::open(config.clone(), Box::new(gateway))?);

    println!(
        "swarm-web data_root={} projects_root={} gateway={}",
        config.data_root.display(),
        config.projects_root.display(),
        config.gateway.url
    );

    if args.once {
        orchestrator.tick()?;
        println!("swarm-web exiting after one tick (--once)");
        return Ok(());
    }

    // The watcher runs on a plain thread: its work is blocking file IO and
    // git subprocess calls.
    let tick_orchestrator = orchestrator.clone();
    let tick_interval = Duration::from_secs(config.watcher.tick_secs.max(1));
    thread::spawn(move || loop {
        if let Err(err) = tick_orchestrator.tick() {
            eprintln!("[swarm-web] watcher tick failed: {err}");
        }
        thread::sleep(tick_interval);
    });

    let app = router(WebState::new(orchestrator));
    println!("swarm-web listening on {bind}");
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|source| MainError::Bind {
            bind: bind.clone(),
            source,
        })?;
    axum::serve(listener, app).await.map_err(MainError::Serve)
}

fn parse_cli_args(args: Vec<String>, program: &str) -> Result<CliCommand, MainError> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG);
    let mut bind_override = None;
    let mut once = false;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| MainError::Args("--config requires a path".to_string()))?;
                config_path = PathBuf::from(value);
            }
            "--bind" => {
                let value = iter
                    .next()
                    .ok_or_else(|| MainError::Args("--bind requires an address".to_string()))?;
                bind_override = Some(value);
            }
            "--once" => once = true,
            "--help" | "-h" => return Ok(CliCommand::Help(help_text(program))),
            other => {
                return Err(MainError::Args(format!(
                    "unknown argument '{other}'; try --help"
                )))
            }
        }
    }

    Ok(CliCommand::Run(CliArgs {
        config_path,
        bind_override,
        once,
    }))
}

fn help_text(program: &str) -> String {
    format!(
        "usage: {program} [--config PATH] [--bind ADDR] [--once]\n\n\
         --config PATH  config file (default: {DEFAULT_CONFIG})\n\
         --bind ADDR    override the web bind address\n\
         --once         run a single watcher tick and exit"
    )
}

fn validate_config(config: &SwarmConfig) -> Result<(), MainError> {
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|issue| issue.level == ValidationLevel::Error)
        .map(|issue| format!("{}: {}", issue.code, issue.message))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(MainError::InvalidConfig(format!(
            "config validation failed ({})",
            errors.join("; ")
        )))
    }
}
