//! Baton CLI — run and inspect step-orchestrated agent workflows.
//!
//! Thin layer over baton-core: every command loads the config, wires the
//! collaborators for the chosen step store, and calls into the core.

use clap::{Parser, Subcommand};

use baton_cli::commands::{self, Overrides};
use baton_core::config::StoreBackend;

/// Baton — step orchestration for multi-agent media pipelines
#[derive(Parser)]
#[command(name = "baton", version, about = "Baton — step orchestration for multi-agent media pipelines")]
pub struct Cli {
    /// Path to the YAML config file (defaults to ./baton.yaml if present)
    #[arg(long, env = "BATON_CONFIG")]
    config: Option<String>,

    /// Base URL of the task/payment ledger
    #[arg(long, env = "BATON_LEDGER_URL")]
    ledger_url: Option<String>,

    /// API key for the ledger
    #[arg(long, env = "BATON_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Agent id this orchestrator listens as
    #[arg(long, env = "BATON_AGENT_ID")]
    agent_id: Option<String>,

    /// Step store backend: remote or sqlite
    #[arg(long, env = "BATON_STORE")]
    store: Option<StoreBackend>,

    /// Path to the SQLite database file (sqlite backend)
    #[arg(long, env = "BATON_DB_PATH")]
    db: Option<String>,

    /// Workflow definition to serve
    #[arg(long, env = "BATON_WORKFLOW")]
    workflow: Option<String>,

    /// How often the ledger is polled, in milliseconds
    #[arg(long, env = "BATON_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Upper bound on one delegation, in seconds
    #[arg(long, env = "BATON_DELEGATION_TIMEOUT_SECS")]
    delegation_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            ledger_url: self.ledger_url.clone(),
            api_key: self.api_key.clone(),
            agent_id: self.agent_id.clone(),
            store: self.store,
            db_path: self.db.clone(),
            workflow_file: self.workflow.clone(),
            poll_interval_ms: self.poll_interval_ms,
            delegation_timeout_secs: self.delegation_timeout_secs,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to step events and dispatch them until interrupted
    Run,

    /// Dispatch a single step once and print the result
    Dispatch {
        /// Step ID
        #[arg(long)]
        step_id: String,
    },

    /// Inspect workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Start and inspect workflow instances
    Step {
        #[command(subcommand)]
        action: StepAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Validate a workflow YAML file
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
    /// Print the resolved workflow and its step chain
    Show {
        /// Path to the workflow YAML file
        file: String,
    },
}

#[derive(Subcommand)]
enum StepAction {
    /// Start a workflow instance (sqlite backend)
    Trigger {
        /// Task ID for the instance (generated if omitted)
        #[arg(long)]
        task_id: Option<String>,
        /// User query the workflow runs on
        #[arg(long)]
        query: String,
    },
    /// Print one step
    Get {
        /// Step ID
        #[arg(long)]
        step_id: String,
    },
    /// List the steps of a workflow instance (sqlite backend)
    List {
        /// Task ID
        #[arg(long)]
        task_id: String,
    },
}

#[tokio::main]
async fn main() {
    // Before parsing, so .env values feed the env-backed flags.
    commands::load_dotenv();
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "baton_core=info,baton_cli=info".into()),
        )
        .init();

    let overrides = cli.overrides();
    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Some(Commands::Run) => async {
            let config = commands::load_config(config_path, &overrides)?;
            commands::run::run(&config).await
        }
        .await,

        Some(Commands::Dispatch { step_id }) => async {
            let config = commands::load_config(config_path, &overrides)?;
            commands::dispatch::run(&config, &step_id).await
        }
        .await,

        Some(Commands::Workflow { action }) => match action {
            WorkflowAction::Validate { file } => commands::workflow::validate(&file),
            WorkflowAction::Show { file } => commands::workflow::show(&file),
        },

        Some(Commands::Step { action }) => async {
            let config = commands::load_config(config_path, &overrides)?;
            match action {
                StepAction::Trigger { task_id, query } => {
                    commands::step::trigger(&config, task_id.as_deref(), &query).await
                }
                StepAction::Get { step_id } => commands::step::get(&config, &step_id).await,
                StepAction::List { task_id } => commands::step::list(&config, &task_id).await,
            }
        }
        .await,

        None => {
            // No subcommand: show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
