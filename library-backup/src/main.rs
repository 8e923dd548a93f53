//! Library Backup - Main entry point
//!
//! One-shot backup of SharePoint document libraries.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use library_backup::config::{Config, INTERACTIVE_CONFIG_PATH};
use library_backup::executor::manifest::ManifestStore;
use library_backup::executor::BackupExecutor;
use library_backup::remote::auth::ClientCredentials;
use library_backup::remote::graph::GraphClient;
use library_backup::storage::StorageBackend;
use library_backup::utils;
use library_backup::utils::logger::LogHandle;
use library_backup::BackupError;
use std::collections::HashMap;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the manifest of the last run (overrides config)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backup (default)
    Run,

    /// Prompt for credentials and backend settings and write a credentials file
    Configure {
        /// Where to write the file
        #[arg(long, value_name = "FILE", default_value = INTERACTIVE_CONFIG_PATH)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging before anything reads configuration
    let log = utils::logger::init(args.log_level.as_deref().unwrap_or("info"))?;

    match args.command {
        Some(Command::Configure { ref path }) => configure(path),
        Some(Command::Run) | None => run(&args, &log).await,
    }
}

async fn run(args: &Args, log: &LogHandle) -> Result<()> {
    let interactive = io::stdin().is_terminal();
    let setup_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(INTERACTIVE_CONFIG_PATH));

    let config = match load_config(args, log) {
        Err(e) if interactive && needs_setup(&e) => {
            println!("No usable configuration ({}), starting setup.", e);
            configure(&setup_path)?;
            load_config(args, log)?
        }
        other => other?,
    };

    match backup(&config).await {
        Err(e) if interactive => {
            eprintln!("Backup failed: {:#}", e);
            if !confirm("Reconfigure and retry? [y/N]")? {
                return Err(e);
            }
            configure(&setup_path)?;
            let config = load_config(args, log)?;
            backup(&config).await
        }
        other => other,
    }
}

/// Load configuration, apply command-line overrides and the configured log level
fn load_config(args: &Args, log: &LogHandle) -> library_backup::Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }

    if args.log_level.is_none() {
        if let Err(e) = log.set_level(&config.log.level) {
            tracing::warn!("Ignoring log level {:?}: {}", config.log.level, e);
        }
    }

    Ok(config)
}

/// Errors that interactive setup can resolve
fn needs_setup(error: &BackupError) -> bool {
    match error {
        BackupError::Config(_) => true,
        BackupError::Io(e) => e.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

async fn backup(config: &Config) -> Result<()> {
    tracing::info!(
        "Starting library-backup v{} (backend: {:?}, {} configured site(s))",
        env!("CARGO_PKG_VERSION"),
        config.backup_backend,
        config.sites.len()
    );

    let backend = StorageBackend::from_config(config).await?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("library-backup/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let auth = ClientCredentials::new(
        http.clone(),
        &config.tenant_id,
        &config.client_id,
        &config.client_secret,
    );
    let graph = GraphClient::new(http);
    let store = ManifestStore::new(&config.state_dir);

    let executor = BackupExecutor::new(&auth, &graph, &backend, store);
    let result = executor.run(&config.sites, config.snapshot_daily).await?;

    println!(
        "Backup finished: {} files ({}) into {}",
        result.files_written,
        library_backup::transfer::format_bytes(result.bytes_written),
        result.snapshot_base
    );
    if !result.deleted_ids.is_empty() {
        println!(
            "Deleted since last run: {} ({} archived, {} no longer in previous snapshot)",
            result.deleted_ids.len(),
            result.archived,
            result.missing_sources
        );
    }
    if !result.archive_failures.is_empty() {
        tracing::warn!(
            "{} deleted item(s) could not be archived",
            result.archive_failures.len()
        );
    }

    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} ", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(answered_yes(&line))
}

fn answered_yes(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Prompt on the terminal and write a TOML credentials file.
/// Secrets are read without echo.
fn configure(path: &Path) -> Result<()> {
    let stdin = io::stdin();
    let config = prompt_config(&mut stdin.lock(), |prompt| {
        rpassword::prompt_password(format!("{}: ", prompt))
    })?;
    write_config(path, &config)
}

fn prompt_config<R, F>(input: &mut R, mut read_secret: F) -> Result<Config>
where
    R: BufRead,
    F: FnMut(&str) -> io::Result<String>,
{
    let mut answers: HashMap<&str, String> = HashMap::new();

    let mut ask = |key: &'static str,
                   prompt: &str,
                   secret: bool,
                   answers: &mut HashMap<&str, String>|
     -> Result<()> {
        let answer = if secret {
            read_secret(prompt)?
        } else {
            print!("{}: ", prompt);
            io::stdout().flush()?;
            let mut line = String::new();
            input.read_line(&mut line)?;
            line
        };
        answers.insert(key, answer.trim().to_string());
        Ok(())
    };

    ask("TENANT_ID", "Tenant ID", false, &mut answers)?;
    ask("CLIENT_ID", "Client ID", false, &mut answers)?;
    ask("CLIENT_SECRET", "Client secret", true, &mut answers)?;
    ask("BACKUP_BACKEND", "Backend (local, s3, azure_blob) [local]", false, &mut answers)?;

    match answers.get("BACKUP_BACKEND").map(String::as_str) {
        Some("s3") => {
            ask("S3_BUCKET_NAME", "S3 bucket name", false, &mut answers)?;
            ask("S3_REGION_NAME", "S3 region", false, &mut answers)?;
            ask("AWS_ACCESS_KEY_ID", "AWS access key id", false, &mut answers)?;
            ask("AWS_SECRET_ACCESS_KEY", "AWS secret access key", true, &mut answers)?;
        }
        Some("azure_blob") => {
            ask("AZURE_CONNECTION_STRING", "Azure connection string", true, &mut answers)?;
            ask("AZURE_CONTAINER_NAME", "Azure container name", false, &mut answers)?;
        }
        _ => ask("BACKUP_DIR", "Backup directory [backups]", false, &mut answers)?,
    }

    ask("SITES", "Sites, comma-separated (empty for the root site)", false, &mut answers)?;
    ask("SNAPSHOT_DAILY", "One snapshot per day? [yes]", false, &mut answers)?;

    Ok(Config::from_lookup(|key| answers.get(key).cloned())?)
}

fn write_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, config.to_toml()?)
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("Configuration written to {}", path.display());
    Ok(())
}
