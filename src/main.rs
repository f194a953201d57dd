use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use procflow_core::{ExecutionContext, ProcflowConfig};
use procflow_engine::{read_spans, Engine, HealthReport, HealthScorer, SpanLogger};
use procflow_graph::{NodeKind, ProcessDefinition};
use procflow_tasks::TaskRegistry;

#[derive(Parser)]
#[command(name = "procflow", version, about = "Process-graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "procflow.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a process definition
    Validate {
        /// Definition file (.json or .toml)
        definition: PathBuf,
    },
    /// Execute a definition with the built-in handlers
    Run {
        /// Definition file (.json or .toml)
        definition: PathBuf,
        /// Initial context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Score a recorded span log
    Score {
        /// JSONL span log written by a previous run
        spans: PathBuf,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("procflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "procflow", &mut std::io::stdout());
            Ok(())
        }
        Commands::Validate { definition } => validate(&definition),
        Commands::Run {
            definition,
            context,
        } => {
            let config = load_config(&cli.config)?;
            run(&definition, context.as_deref(), config).await
        }
        Commands::Score { spans } => {
            let config = load_config(&cli.config)?;
            let scorer = HealthScorer::new(config.scoring)?;
            let spans = read_spans(&spans)?;
            let report = scorer.score(&spans);
            print_health(&report)?;
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ProcflowConfig> {
    if path.exists() {
        let config = ProcflowConfig::load(path)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    } else {
        Ok(ProcflowConfig::default())
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let definition = ProcessDefinition::load(path)?;
    TaskRegistry::with_builtins().validate_definition(&definition)?;

    let tasks = definition
        .nodes()
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Task(_) | NodeKind::MultiInstance(_)))
        .count();
    println!(
        "{} ({}): {} nodes, {} flows, {} task nodes",
        definition.id(),
        definition.name().unwrap_or("unnamed"),
        definition.nodes().len(),
        definition.flows().len(),
        tasks
    );
    for (split, join) in definition.join_pairs() {
        println!("  parallel {} -> {}", split, join);
    }
    println!("OK");
    Ok(())
}

async fn run(path: &Path, context: Option<&str>, config: ProcflowConfig) -> anyhow::Result<()> {
    let definition = ProcessDefinition::load(path)?;
    let initial = match context {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw)?;
            if !value.is_object() {
                anyhow::bail!("--context must be a JSON object");
            }
            ExecutionContext::from_json(value)
        }
        None => ExecutionContext::new(),
    };

    let scorer = HealthScorer::new(config.scoring.clone())?;
    let mut engine = Engine::new(
        definition,
        Arc::new(TaskRegistry::with_builtins()),
        config.engine.clone(),
    )?;
    if let Some(dir) = config.log_dir() {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        engine = engine.with_span_log(SpanLogger::new(dir, level));
    }

    let report = engine.run(initial, &scorer).await;

    println!("Run {}: {}", report.run_id, report.status);
    println!("{}", serde_json::to_string_pretty(&report.context.to_json())?);
    print_health(&report.health)?;
    if let Some(path) = &report.log_path {
        println!("Span log: {}", path.display());
    }
    for failure in &report.compensation_failures {
        warn!(error = %failure, "Compensation failure");
    }

    if let Some(failure) = report.failure {
        eprintln!("Error: {}", failure);
        std::process::exit(1);
    }
    Ok(())
}

fn print_health(report: &HealthReport) -> anyhow::Result<()> {
    println!(
        "Health: {:.3} ({})",
        report.overall, report.status
    );
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
