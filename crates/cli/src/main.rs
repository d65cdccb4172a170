//! `stowage` binary: register archive tasks and run resumable uploads.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_catalog::models::NewTask;
use stowage_catalog::{Catalog, FileCatalogRepo, SqliteCatalog, TaskRepo};
use stowage_core::config::{default_config_dir, AppConfig};
use stowage_core::format::human_bytes;
use stowage_engine::archive::{Archiver, TarGzArchiver};
use stowage_engine::Orchestrator;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_TOML: &str = r#"provider = "aws"
archive_format = "targz"

[aws]
access_key = "aws-access-key"
secret_key = "aws-secret-key"
account_id = "000000000000"
region = "aws-region-name"
bucket_name = "aws-s3-bucket-name"
storage_class = "aws-s3-storage-class"
"#;

/// Archive a directory and upload it to object storage as a resumable,
/// parallel multipart transfer.
#[derive(Parser)]
#[command(name = "stowage")]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "STOWAGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "stowage_engine=debug"
    #[arg(short = 'L', long, env = "STOWAGE_LOG", default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new archive+upload task
    Add {
        /// Directory to archive
        input_path: PathBuf,

        /// Where the archive file lands (defaults next to the input)
        #[arg(short, long)]
        output_path: Option<PathBuf>,
    },
    /// Run a task: archive if needed, then upload
    Run {
        /// Task id from `stowage add`
        task_id: i64,

        /// Concurrent upload workers
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
    },
    /// List registered tasks
    Tasks,
    /// Print the resolved configuration path, creating a default config
    /// if none exists
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config_path = resolve_config_path(cli.config.as_deref())?;
    match cli.command {
        Commands::Config => {
            println!("{}", config_path.display());
            Ok(())
        }
        Commands::Add {
            input_path,
            output_path,
        } => add_task(&config_path, &input_path, output_path.as_deref()).await,
        Commands::Run { task_id, jobs } => run_task(&config_path, task_id, jobs).await,
        Commands::Tasks => list_tasks().await,
    }
}

/// Locate the config file, writing the default template on first use.
fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("config file {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }

    let dir = default_config_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create {}", dir.display()))?;
    let path = dir.join("config.toml");
    if !path.exists() {
        std::fs::write(&path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("cannot write {}", path.display()))?;
        eprintln!(
            "Created a default config at {}; edit it before running uploads.",
            path.display()
        );
    }
    Ok(path)
}

fn load_config(config_path: &Path) -> Result<AppConfig> {
    let config: AppConfig = Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("STOWAGE_").split("__"))
        .extract()
        .with_context(|| format!("cannot parse config {}", config_path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn open_catalog() -> Result<SqliteCatalog> {
    let db_path = default_config_dir()?.join("stowage.db");
    Ok(SqliteCatalog::new(&db_path).await?)
}

/// A cancellation token that fires on SIGINT/SIGTERM.
fn signal_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived kill signal, terminating gracefully...");
            trigger.cancel();
        }
    });
    token
}

async fn add_task(config_path: &Path, input_path: &Path, output_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let input_path = input_path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", input_path.display()))?;
    if !input_path.is_dir() {
        bail!("{} is not a directory", input_path.display());
    }

    let output_path = match output_path {
        Some(path) => path.to_path_buf(),
        None => {
            let name = input_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string());
            default_config_dir()?
                .join("archives")
                .join(format!("{name}{}", config.archive_format.extension()))
        }
    };

    let cancel = signal_token();
    let archiver = TarGzArchiver::new(&input_path, &output_path);
    let plan = archiver.plan(cancel).await?;
    println!(
        "Planned: {} files ({})",
        plan.info.readable_file_count,
        human_bytes(plan.info.size_in_bytes, 2)
    );

    let catalog = open_catalog().await?;
    let task_id = catalog
        .create_task(&NewTask {
            input_path: input_path.display().to_string(),
            output_path: output_path.display().to_string(),
            config_path: config_path.display().to_string(),
            provider: config.provider.to_string(),
            archive_format: config.archive_format.to_string(),
            content_hash: plan.info.content_hash.clone(),
            size: plan.info.size_in_bytes as i64,
            file_count: plan.info.total_file_count as i64,
        })
        .await?;
    catalog.replace_file_catalog(task_id, &plan.entries).await?;

    println!("Task {task_id} registered; run it with: stowage run {task_id}");
    Ok(())
}

async fn run_task(config_path: &Path, task_id: i64, jobs: usize) -> Result<()> {
    if jobs == 0 {
        bail!("--jobs must be at least 1");
    }
    let config = load_config(config_path)?;
    let catalog = Arc::new(open_catalog().await?) as Arc<dyn Catalog>;

    let cancel = signal_token();
    let orchestrator = Orchestrator::new(catalog, config, cancel);
    orchestrator.run_task(task_id, jobs).await?;

    println!("Upload: OK");
    Ok(())
}

async fn list_tasks() -> Result<()> {
    let catalog = open_catalog().await?;
    let tasks = catalog.list_tasks().await?;
    if tasks.is_empty() {
        println!("No tasks registered; add one with: stowage add <dir>");
        return Ok(());
    }
    for task in tasks {
        println!(
            "#{:<4} {:<18} {:>10}  {} -> {}",
            task.id,
            format!("{:?}", task.status),
            human_bytes(task.size.max(0) as u64, 1),
            task.input_path,
            task.output_path,
        );
    }
    Ok(())
}
