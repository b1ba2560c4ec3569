use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory holding config, model cache and the index
    #[clap(long, env = "VOGUE_DATA_DIR", default_value = ".vogue")]
    pub data_dir: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the index from a catalog file and persist it.
    Build {
        /// Catalog file: a JSON array or JSON-lines of product records
        input: PathBuf,

        /// Embedding batch size
        #[clap(long, default_value = "256")]
        batch_size: usize,
    },
    /// Start vogue as a service.
    Daemon {},
    /// Run one query against the persisted index.
    Search {
        /// Free-text query
        query: Option<String>,

        /// Path to a query image
        #[clap(short, long)]
        image: Option<PathBuf>,

        /// Number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Apply the cross-encoder stage
        #[clap(long, default_value = "false")]
        rerank: bool,

        /// Filter by gender: men, women or unisex
        #[clap(short, long)]
        gender: Option<String>,

        #[clap(long)]
        min_price: Option<f64>,

        #[clap(long)]
        max_price: Option<f64>,

        #[clap(long)]
        min_rating: Option<f64>,
    },
}
