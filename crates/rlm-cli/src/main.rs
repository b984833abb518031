//! RLM - Recursive Language Model agent CLI
//!
//! ## Commands
//!
//! - `run`: answer one task
//! - `chat`: answer tasks read from stdin, one per line, keeping REPL state
//!   between them
//! - `config`: print the effective configuration as TOML

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};

use rlm_core::config::ModelSettings;
use rlm_core::llm::OpenAiCompatibleClient;
use rlm_core::metrics::METRICS;
use rlm_core::{
    Agent, AgentBuilder, AgentConfig, BudgetLedger, BudgetedModel, DuckDuckGoSearch,
    LanguageModel, ReplStateStore, Roles, RunContext,
};

const CHAT_TASK_ID: &str = "chat";

#[derive(Parser)]
#[command(name = "rlm")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Recursive Language Model agent", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (TOML); defaults apply when omitted
    #[arg(short, long, global = true, env = "RLM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Base directory for run directories (artifacts and report.md)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Read-only directory of input files
    #[arg(long)]
    context_dir: Option<PathBuf>,

    /// Override the step limit
    #[arg(long)]
    max_steps: Option<u32>,

    /// Leave `search_web` unconfigured
    #[arg(long)]
    no_search: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single task
    Run {
        /// The task to solve
        task: String,

        #[command(flatten)]
        args: RunArgs,
    },

    /// Answer tasks from stdin, one per line, as follow-ups of each other
    Chat {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    rlm_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_ref())?;

    let result = match cli.command {
        Commands::Run { task, args } => cmd_run(config, &task, args).await,
        Commands::Chat { args } => cmd_chat(config, args).await,
        Commands::Config => cmd_config(&config),
    };
    METRICS.flush();
    result
}

fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            let mut config = AgentConfig::default();
            config
                .apply_env_overrides()
                .context("Invalid environment override")?;
            config.validate().context("Invalid configuration")?;
            Ok(config)
        }
    }
}

fn apply_args(mut config: AgentConfig, args: &RunArgs) -> Result<AgentConfig> {
    if let Some(dir) = &args.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.context_dir {
        config.context_dir = Some(dir.clone());
    }
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Shared pieces every agent of one CLI invocation is built from.
struct Setup {
    config: AgentConfig,
    roles: Roles,
    sub_query: Arc<dyn LanguageModel>,
    ledger: Arc<BudgetLedger>,
    run: Option<Arc<RunContext>>,
    search: bool,
}

impl Setup {
    fn new(config: AgentConfig, args: &RunArgs) -> Result<Self> {
        let config = apply_args(config, args)?;
        let ledger = Arc::new(BudgetLedger::new(config.budget.max_usd));
        let models = &config.models;
        let roles = Roles::from_models(
            budgeted(&models.router, &ledger, "router")?,
            budgeted(&models.coder, &ledger, "coder")?,
            budgeted(&models.responder, &ledger, "responder")?,
            budgeted(&models.delegator, &ledger, "delegator")?,
            config.max_subtasks,
        );
        let sub_query = budgeted(&models.sub_query, &ledger, "sub_query")?;
        let run = match &config.output_dir {
            Some(base) => Some(Arc::new(
                RunContext::create(base)
                    .with_context(|| format!("Failed to create run directory under {}", base.display()))?,
            )),
            None => None,
        };
        Ok(Self {
            config,
            roles,
            sub_query,
            ledger,
            run,
            search: !args.no_search,
        })
    }

    fn builder(&self) -> AgentBuilder {
        let mut builder = Agent::builder(self.config.clone(), self.roles.clone())
            .ledger(Arc::clone(&self.ledger))
            .sub_query_model(Arc::clone(&self.sub_query));
        if let Some(run) = &self.run {
            builder = builder.run_context(Arc::clone(run));
        }
        if self.search {
            builder = builder.search(Arc::new(DuckDuckGoSearch::default()));
        }
        builder
    }

    fn report_cost(&self) {
        let snapshot = self.ledger.snapshot();
        info!(
            cost_usd = snapshot.current_cost,
            limit_usd = snapshot.max_usd,
            input_tokens = snapshot.total_input_tokens,
            output_tokens = snapshot.total_output_tokens,
            "budget"
        );
        if let Some(run) = &self.run {
            info!(run_id = %run.run_id(), dir = %run.working_dir().display(), "run directory");
        }
    }
}

fn budgeted(
    settings: &ModelSettings,
    ledger: &Arc<BudgetLedger>,
    role: &str,
) -> Result<Arc<dyn LanguageModel>> {
    let client = OpenAiCompatibleClient::from_settings(settings)
        .with_context(|| format!("Failed to configure the {role} model"))?;
    ledger.register_model(&settings.model, settings.pricing());
    Ok(Arc::new(BudgetedModel::new(Arc::new(client), Arc::clone(ledger))))
}

async fn cmd_run(config: AgentConfig, task: &str, args: RunArgs) -> Result<()> {
    let setup = Setup::new(config, &args)?;
    let mut agent = setup.builder().build().context("Failed to build agent")?;
    let answer = agent.run(task).await;
    setup.report_cost();
    let answer = answer.context("Agent run failed")?;
    println!("{answer}");
    Ok(())
}

async fn cmd_chat(config: AgentConfig, args: RunArgs) -> Result<()> {
    let setup = Setup::new(config, &args)?;
    let store = ReplStateStore::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        let mut builder = setup.builder();
        if let Some(repl) = store.take(CHAT_TASK_ID) {
            builder = builder.repl(repl);
        }
        let mut agent = builder.build().context("Failed to build agent")?;
        let result = agent.run(task).await;
        store.store(CHAT_TASK_ID, agent.into_repl());
        match result {
            Ok(answer) => println!("{answer}\n"),
            Err(e) if e.is_budget() => {
                setup.report_cost();
                return Err(e).context("Budget exhausted");
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }
    setup.report_cost();
    Ok(())
}

fn cmd_config(config: &AgentConfig) -> Result<()> {
    let text = toml::to_string_pretty(config).context("Failed to render config")?;
    print!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args() -> RunArgs {
        RunArgs {
            output_dir: None,
            context_dir: None,
            max_steps: None,
            no_search: false,
        }
    }

    #[test]
    fn test_load_config_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("rlm.toml");
        std::fs::write(&path, "max_depth = 2\n\n[budget]\nmax_usd = 0.5\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.budget.max_usd, 0.5);
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("missing.toml");
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().starts_with("Failed to load config from"));
    }

    #[test]
    fn test_apply_args_overrides_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            output_dir: Some(temp_dir.path().to_path_buf()),
            max_steps: Some(3),
            ..run_args()
        };
        let config = apply_args(AgentConfig::default(), &args).unwrap();
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.output_dir.as_deref(), Some(temp_dir.path()));
    }

    #[test]
    fn test_apply_args_rejects_zero_steps() {
        let args = RunArgs {
            max_steps: Some(0),
            ..run_args()
        };
        assert!(apply_args(AgentConfig::default(), &args).is_err());
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from(["rlm", "run", "What is 2+2?", "--max-steps", "4", "--no-search"])
            .unwrap();
        match cli.command {
            Commands::Run { task, args } => {
                assert_eq!(task, "What is 2+2?");
                assert_eq!(args.max_steps, Some(4));
                assert!(args.no_search);
            }
            _ => panic!("expected run command"),
        }
    }
}
