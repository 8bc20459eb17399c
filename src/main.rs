//! Main module for the powermem CLI.
//!
//! This module parses the command line, loads the configuration, opens a
//! [`MemoryBackend`] and runs one command against it. Commands that change the vector
//! index close (and therefore checkpoint) the backend before exiting; read-only commands
//! leave the snapshot files alone.
//!
//! # Examples
//!
//! ```sh
//! cargo run -- init
//! powermem stats --owner u1
//! ```

use clap::Parser;
use once_cell::sync::OnceCell;
use powermem::backend::MemoryBackend;
use powermem::commands::{Cli, Commands, parse_embedding};
use powermem::config::{self, BackendConfig};
use powermem::models::MemoryRecord;
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    });
    run()
}

/// Parse arguments, then either write a config (`init`) or run a backend command.
fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => powermem::config_dir()?.join("config.yaml"),
    };
    dispatch(&config_path, cli.command)
}

fn dispatch(config_path: &Path, command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Init {
            db_path,
            dimension,
            force,
        } => init(config_path, db_path, dimension, force),
        command => {
            debug!("Loading config from: {}", config_path.display());
            let backend_config = config::load_config(&config_path.to_string_lossy())?;
            let backend = MemoryBackend::open(backend_config)?;
            let writes_index = command.writes_index();
            execute(&backend, command)?;
            if writes_index {
                backend.close()?;
            } else {
                debug!("Read-only command, snapshot left as is");
            }
            Ok(())
        }
    }
}

fn execute(backend: &MemoryBackend, command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        // Handled in `run` before a backend exists.
        Commands::Init { .. } => {}
        Commands::Store {
            owner,
            session,
            text,
            embedding,
            metadata,
        } => {
            let embedding = parse_embedding(&embedding)?;
            let metadata = match metadata {
                Some(raw) => {
                    let value: serde_json::Value = serde_json::from_str(&raw)?;
                    Some(serde_json::to_vec(&value)?)
                }
                None => None,
            };
            let id =
                backend.store_memory(&owner, &session, &text, &embedding, metadata.as_deref())?;
            println!("{id}");
        }
        Commands::Search {
            owner,
            embedding,
            top_k,
        } => {
            let embedding = parse_embedding(&embedding)?;
            let hits = backend.search_memory(&owner, &embedding, top_k)?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Commands::List { owner, limit } => {
            let records: Vec<serde_json::Value> = backend
                .list_memories(&owner, limit)?
                .iter()
                .map(record_json)
                .collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Stats { owner } => {
            let stats = backend.stats(&owner)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::DeleteSession { session } => {
            let deleted = backend.delete_session(&session)?;
            println!("{deleted}");
        }
        Commands::Checkpoint => {
            // `close` in `run` writes the snapshot.
            info!("Checkpoint requested");
        }
    }
    Ok(())
}

/// JSON view of a record with metadata decoded when it holds JSON.
fn record_json(record: &MemoryRecord) -> serde_json::Value {
    let metadata = record
        .metadata
        .as_deref()
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(bytes).ok());
    serde_json::json!({
        "id": record.id,
        "session_id": record.session_id,
        "text": record.text,
        "created_at": record.created_at_raw,
        "metadata": metadata,
    })
}

/// Writes a default configuration file.
///
/// # Errors
///
/// Returns an error if the file exists and `force` is not set, or if the directories or
/// file cannot be created.
fn init(
    config_path: &Path,
    db_path: Option<PathBuf>,
    dimension: usize,
    force: bool,
) -> Result<(), Box<dyn Error>> {
    if config_path.exists() && !force {
        return Err(format!(
            "{} already exists; pass --force to overwrite it",
            config_path.display()
        )
        .into());
    }

    let db_path = match db_path {
        Some(path) => path,
        None => powermem::data_dir()?.join("powermem.db"),
    };
    let backend_config = BackendConfig::new(db_path).with_dimension(dimension);
    backend_config.validate()?;

    if let Some(dir) = config_path.parent() {
        info!("Creating config directory: {}", dir.display());
        fs::create_dir_all(dir)?;
    }
    info!("Creating config file: {}", config_path.display());
    fs::write(config_path, serde_yaml::to_string(&backend_config)?)?;
    Ok(())
}
