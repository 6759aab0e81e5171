//! CLI binary for serving, validating, and inspecting Cohort study pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use cohort_pipeline::{
    Pipeline, PipelineDefinition, Severity, Study, StudySettings, SummaryFilter,
    DEFAULT_TIMEOUT_SECONDS,
};
use cohort_server::{ServerConfig, SqliteStore};
use cohort_types::SessionStatus;

#[derive(Parser)]
#[command(name = "cohort", version, about = "Balanced assignment and session orchestration for online studies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve(ServerConfig),

    /// Lint a pipeline definition
    Validate {
        /// Path to the pipeline definition (YAML or JSON)
        pipeline: PathBuf,
    },

    /// Show factors, stages and variants of a pipeline
    Info {
        /// Path to the pipeline definition (YAML or JSON)
        pipeline: PathBuf,
    },

    /// Fail every session idle past the inactivity ceiling
    Reap {
        #[command(flatten)]
        target: StoreArgs,

        /// Seconds of inactivity after which a session counts as abandoned
        #[arg(long, env = "COHORT_INACTIVITY_SECONDS", default_value_t = DEFAULT_TIMEOUT_SECONDS)]
        inactivity_seconds: i64,
    },

    /// Print the admin summary as JSON
    Export {
        #[command(flatten)]
        target: StoreArgs,

        /// Only include sessions in this state
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only include sessions with this condition, as factor=value (repeatable)
        #[arg(long = "condition", value_parser = parse_condition)]
        conditions: Vec<(String, String)>,
    },
}

#[derive(clap::Args)]
struct StoreArgs {
    /// Path to the pipeline definition (YAML or JSON)
    #[arg(long, env = "COHORT_PIPELINE")]
    pipeline: PathBuf,

    /// SQLite database URL
    #[arg(long, env = "COHORT_DATABASE_URL", default_value = "sqlite://cohort.db")]
    database_url: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    InProgress,
    Completed,
    Failed,
}

impl From<StatusArg> for SessionStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::InProgress => SessionStatus::InStage,
            StatusArg::Completed => SessionStatus::Completed,
            StatusArg::Failed => SessionStatus::Failed,
        }
    }
}

fn parse_condition(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((factor, value)) if !factor.trim().is_empty() && !value.trim().is_empty() => {
            Ok((factor.trim().to_owned(), value.trim().to_owned()))
        }
        _ => Err(format!("expected factor=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve(config) => {
            cohort_server::serve(config).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
        Commands::Reap {
            target,
            inactivity_seconds,
        } => {
            cmd_reap(&target, inactivity_seconds).await?;
        }
        Commands::Export {
            target,
            status,
            conditions,
        } => {
            let filter = SummaryFilter {
                status: status.map(SessionStatus::from),
                conditions: conditions.into_iter().collect(),
            };
            cmd_export(&target, &filter).await?;
        }
    }

    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let def = PipelineDefinition::load(path)?;
    let diagnostics = cohort_pipeline::validate(&def);

    let mut has_error = false;
    for diag in &diagnostics {
        if diag.severity == Severity::Error {
            has_error = true;
        }
        match &diag.stage_id {
            Some(stage) => println!("[{}] {} ({}): {}", diag.severity, diag.rule, stage, diag.message),
            None => println!("[{}] {}: {}", diag.severity, diag.rule, diag.message),
        }
        if let Some(fix) = &diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }

    // Lint passed; validators may still reject their own parameters.
    if let Err(e) = Pipeline::from_definition(def) {
        println!("[ERROR] compile: {e}");
        std::process::exit(1);
    }

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let def = PipelineDefinition::load(path)?;

    println!("Pipeline: {}", def.code);

    println!("\nFactors:");
    for factor in &def.factors {
        println!(
            "  {} = [{}] mode={}",
            factor.name,
            factor.values.join(", "),
            format!("{:?}", factor.mode).to_lowercase()
        );
    }

    println!("\nStages:");
    for (index, stage) in def.stages.iter().enumerate() {
        let active = if stage.active { "" } else { " (inactive)" };
        println!(
            "  {}. {}{} mode={}",
            index + 1,
            stage.id,
            active,
            format!("{:?}", stage.mode).to_lowercase()
        );
        if let Some(key) = &stage.override_key {
            println!("     override: ?{key}=<variant>");
        }
        if let Some(key) = &stage.stratify_by {
            println!("     stratify: {key}");
        }
        for variant in &stage.variants {
            let kind = stage
                .validators
                .get(variant)
                .map(|v| v.kind())
                .unwrap_or("(none)");
            println!("     - {variant} validator={kind}");
        }
    }

    Ok(())
}

async fn open_study(target: &StoreArgs, settings: StudySettings) -> anyhow::Result<Study> {
    let pipeline = Pipeline::load(&target.pipeline)?;
    let store = SqliteStore::connect(&target.database_url).await?;
    Ok(Study::new(Arc::new(pipeline), Arc::new(store), settings))
}

async fn cmd_reap(target: &StoreArgs, inactivity_seconds: i64) -> anyhow::Result<()> {
    let settings = StudySettings {
        inactivity_seconds,
        ..Default::default()
    };
    let study = open_study(target, settings).await?;
    let report = study.reap().await?;

    println!(
        "Scanned {} active session(s); failed {} as abandoned",
        report.scanned,
        report.failed.len()
    );
    for participant in &report.failed {
        println!("  {participant}");
    }
    Ok(())
}

async fn cmd_export(target: &StoreArgs, filter: &SummaryFilter) -> anyhow::Result<()> {
    let study = open_study(target, StudySettings::default()).await?;
    let summary = study.summary(filter).await?;

    tracing::info!(
        total = summary.stats.total,
        completed = summary.stats.completed,
        failed = summary.stats.failed,
        "Exporting summary"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
