use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "strongbox")]
#[command(about = "Deduplicating backup and restore", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Back up every configured item into the destination
    Backup,
    /// List the catalogs published at the destination
    List,
    /// Show the folders and files of a catalog
    Browse {
        /// Catalog file name, e.g. 2024-03-01_18-30-00.db
        catalog: String,
        /// Folder id to show instead of the catalog roots
        #[arg(long)]
        folder: Option<i64>,
    },
    /// Restore a catalog, or one folder of it, into a target directory
    Restore {
        catalog: String,
        target: PathBuf,
        #[arg(long)]
        folder: Option<i64>,
    },
    /// Re-hash every stored blob and delete unreferenced ones
    Validate,
    /// Print configuration values
    PrintConfig,
}
