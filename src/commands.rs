//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! a `Commands` enum with the available subcommands, and [`parse_embedding`] for the
//! `--embedding` argument shared by `store` and `search`.
//!
//! # Examples
//!
//! ```sh
//! powermem init
//! powermem store -o u1 -s s1 -t "likes green tea" -e '[0.1, 0.7, 0.2]'
//! powermem search -o u1 -e @query.json -k 3
//! powermem delete-session -s s1
//! ```

use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use crate::config::DEFAULT_DIMENSION;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Config file to use instead of `<config_dir>/config.yaml`.
    #[arg(long, short = 'c', env = "POWERMEM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default config file.
    Init {
        /// Database path to put in the config (defaults to the platform data dir).
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Embedding dimension.
        #[arg(long, default_value_t = DEFAULT_DIMENSION)]
        dimension: usize,

        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Store one memory and checkpoint the index.
    #[clap(alias = "s")]
    Store {
        #[arg(long, short = 'o')]
        owner: String,

        #[arg(long, short = 's')]
        session: String,

        #[arg(long, short = 't')]
        text: String,

        /// JSON array of floats, or `@path` to read it from a file.
        #[arg(long, short = 'e')]
        embedding: String,

        /// JSON metadata stored alongside the record.
        #[arg(long, short = 'm')]
        metadata: Option<String>,
    },

    /// Semantic search over one owner's memories.
    #[clap(alias = "q")]
    Search {
        #[arg(long, short = 'o')]
        owner: String,

        /// JSON array of floats, or `@path` to read it from a file.
        #[arg(long, short = 'e')]
        embedding: String,

        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,
    },

    /// Most recent memories for an owner.
    List {
        #[arg(long, short = 'o')]
        owner: String,

        #[arg(long, short = 'l', default_value_t = 50)]
        limit: usize,
    },

    /// Record, session and index counts for an owner.
    Stats {
        #[arg(long, short = 'o')]
        owner: String,
    },

    /// Delete every memory in a session.
    DeleteSession {
        #[arg(long, short = 's')]
        session: String,
    },

    /// Write the vector index snapshot.
    Checkpoint,
}

impl Commands {
    /// Whether the command changes the vector index and so must checkpoint on exit.
    pub fn writes_index(&self) -> bool {
        matches!(self, Commands::Store { .. } | Commands::Checkpoint)
    }
}

/// Parse an `--embedding` argument: inline JSON, or `@path` to a JSON file.
pub fn parse_embedding(arg: &str) -> Result<Vec<f32>, Box<dyn Error>> {
    let json = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    let embedding: Vec<f32> = serde_json::from_str(&json)?;
    Ok(embedding)
}
