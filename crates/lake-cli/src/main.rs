use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lake_adapters::{migration_registry, plan_for, run_plugin};
use lake_pipeline::{load_pipelines, LakeConfig, Orchestrator, RunStatus, TaskInvocation};
use lake_storage::Store;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lake")]
#[command(about = "Collect, extract and convert engineering data into the lake")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending schema migrations.
    Migrate,
    /// Migrate, then run every pipeline in the pipelines file.
    Run {
        #[arg(long)]
        file: Option<PathBuf>,
        /// Only run pipelines of this plugin.
        #[arg(long)]
        only: Option<String>,
    },
    /// Print the resolved subtask plan of each pipeline.
    Plan {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

/// Logs go to stderr so stdout stays machine readable.
fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_output = std::env::var("LAKE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?;
    }
    Ok(())
}

async fn connect_and_migrate(config: &LakeConfig) -> Result<Store> {
    let store = Store::connect(&config.store_config())
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let applied = migration_registry()?.execute(&store).await?;
    for migration in &applied {
        info!(owner = %migration.owner, version = migration.version, name = %migration.name, "migration applied");
    }
    Ok(store)
}

async fn pipelines(file: Option<PathBuf>, config: &LakeConfig) -> Result<Vec<TaskInvocation>> {
    let path = file.unwrap_or_else(|| config.pipelines_file.clone());
    Ok(load_pipelines(&path).await?)
}

async fn run(config: LakeConfig, file: Option<PathBuf>, only: Option<String>) -> Result<ExitCode> {
    let mut invocations = pipelines(file, &config).await?;
    if let Some(only) = &only {
        invocations.retain(|invocation| &invocation.plugin == only);
    }
    if invocations.is_empty() {
        warn!("no pipelines to run");
        return Ok(ExitCode::SUCCESS);
    }

    let store = connect_and_migrate(&config).await?;
    let orchestrator = Orchestrator::new(config, store.clone());
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling runs");
                cancel.cancel();
            }
        })
    };

    let results = orchestrator.run_all(invocations, &cancel, run_plugin).await;
    interrupt.abort();

    let mut failed = false;
    for result in results {
        match result {
            Ok(report) => {
                failed |= report.status != RunStatus::Completed;
                println!("{}", serde_json::to_string(&report)?);
            }
            Err(err) => {
                failed = true;
                error!(kind = err.kind(), error = %err, "pipeline did not start");
            }
        }
    }
    store.close().await;

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging()?;
    let cli = Cli::parse();
    let config = LakeConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = Store::connect(&config.store_config()).await?;
            let applied = migration_registry()?.execute(&store).await?;
            if applied.is_empty() {
                println!("schema is up to date");
            }
            for migration in applied {
                println!("{} {} {}", migration.owner, migration.version, migration.name);
            }
            store.close().await;
        }
        Commands::Plan { file } => {
            for invocation in pipelines(file, &config).await? {
                let plan = plan_for(&invocation)?;
                let rendered = json!({ "plugin": invocation.plugin, "steps": plan.steps });
                println!("{}", serde_json::to_string_pretty(&rendered)?);
            }
        }
        Commands::Run { file, only } => return run(config, file, only).await,
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_file_and_plugin_filter() {
        let cli = Cli::parse_from(["lake", "run", "--file", "p.yaml", "--only", "jira"]);
        match cli.command {
            Commands::Run { file, only } => {
                assert_eq!(file, Some(PathBuf::from("p.yaml")));
                assert_eq!(only.as_deref(), Some("jira"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["lake"]).is_err());
    }
}
