//! # powermem (library root)
//!
//! Durable memory backend that keeps a relational record store consistent with an
//! append-only vector index:
//! - Record storage in SQLite (`record_store`, `models`, `schema`).
//! - Exact nearest-neighbour index and its position → record id mapping
//!   (`vector_store`, `id_mapping`).
//! - Paired, checksummed snapshot files for the index (`snapshot`).
//! - The coordinator that callers use (`backend`).
//! - Configuration and CLI plumbing (`config`, `commands`).
//!
//! ## Files on disk
//! Everything derives from one database path:
//!
//! ```text
//! <dir>/powermem.db            SQLite record store (WAL mode)
//! <dir>/powermem.vector_index  vector index snapshot
//! <dir>/powermem.id_mapping    id mapping snapshot
//! ```
//!
//! By default the CLI keeps its `config.yaml` in [`config_dir`] and the database in
//! [`data_dir`].
//!
//! ## Modules
//! - [`backend`], [`commands`], [`config`], [`error`], [`id_mapping`], [`models`],
//!   [`record_store`], [`schema`], [`snapshot`], [`vector_store`]

use directories::ProjectDirs;

pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod id_mapping;
pub mod models;
pub mod record_store;
pub mod schema;
pub mod snapshot;
pub mod vector_store;

pub use backend::MemoryBackend;
pub use config::BackendConfig;
pub use error::{MemoryError, Result};
pub use models::{BackendStats, MemoryRecord, RecordId, SearchHit};

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "voxflame", "powermem").ok_or_else(|| {
        MemoryError::InvalidConfig("unable to determine the user's home directory".into())
    })
}

/// Return the per-platform configuration directory used by powermem.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "voxflame", "powermem")`, so you get the right place on each OS
/// (e.g., `~/.config/powermem` on Linux).
///
/// The directory is **not** created by this function; callers that need it should
/// create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
pub fn config_dir() -> Result<std::path::PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Return the per-platform data directory where the default database lives.
///
/// Like [`config_dir`], the directory is not created here.
pub fn data_dir() -> Result<std::path::PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
