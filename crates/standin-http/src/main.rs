use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use standin_http::config::StandinConfig;
use standin_http::harness::TestEvaluator;
use standin_http::scripting::{ScriptCache, ScriptCacheConfig};
use standin_http::server::{ServerConfig, StandinServer};

#[derive(Parser, Debug)]
#[command(name = "standin-http", version, about = "Configurable HTTP stand-in server")]
struct Args {
    /// Endpoint/test configuration file (YAML or JSON)
    #[arg(short, long, env = "STANDIN_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the configured endpoints
    Serve {
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Add matcher/creator description headers to every response
        #[arg(long)]
        diagnostics: bool,
    },
    /// List the declared test cases
    ListTests,
    /// Run declared test cases and report pass/fail plus coverage
    Test {
        /// Run a single case by index instead of the whole batch
        #[arg(long)]
        case: Option<usize>,
        /// Show the fully rendered response instead of evaluating expectations
        #[arg(long)]
        show: bool,
        /// Propagate exceptions instead of capturing them per case
        #[arg(long)]
        error_passthrough: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let root = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = StandinConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let registry = Arc::new(config.build_registry(&root)?);
    let scripts = Arc::new(ScriptCache::new(ScriptCacheConfig::default()));

    match args.command {
        Command::Serve { port, diagnostics } => {
            let server_config = ServerConfig {
                port,
                diagnostics,
                ..Default::default()
            };
            StandinServer::new(server_config, registry, scripts)
                .run()
                .await
        }
        Command::ListTests => {
            let cases = config.build_tests(&root)?;
            let listing = TestEvaluator::list_tests(&cases);
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        Command::Test {
            case,
            show,
            error_passthrough,
        } => {
            let cases = config.build_tests(&root)?;
            let mut evaluator = TestEvaluator::new(&registry, &scripts);
            evaluator.error_passthrough = error_passthrough;

            if let Some(index) = case {
                let selected = cases
                    .get(index)
                    .with_context(|| format!("no test case with index {index}"))?;
                if show {
                    let report = evaluator.show_response(selected).await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    let result = evaluator.run_case(index, selected).await?;
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    if !result.passed() {
                        std::process::exit(1);
                    }
                }
                return Ok(());
            }

            let report = evaluator.run_all(&cases).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed > 0 || report.errored > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
