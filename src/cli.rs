use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Search a local image collection by image or by text", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct QueryArgs {
    /// Query image file
    #[clap(short, long)]
    pub image: Option<PathBuf>,

    /// Query text
    #[clap(short, long)]
    pub text: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add an image file
    Insert {
        /// Image file to add
        path: PathBuf,

        /// Treat the file as raw interleaved RGB bytes of this height,width
        #[clap(long, value_delimiter = ',', num_args = 2, value_names = ["HEIGHT", "WIDTH"])]
        raw: Option<Vec<usize>>,
    },
    /// Add every image file found in a directory
    Import {
        /// Directory to scan (not recursive)
        dir: PathBuf,

        /// Don't draw a progress bar
        #[clap(long, default_value = "false")]
        no_progress: bool,
    },
    /// Remove an entry
    Delete {
        /// Entry id or stored image path
        entry: String,
    },
    /// Find images similar to an image or matching a text
    Search {
        #[command(flatten)]
        query: QueryArgs,

        /// Maximum number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Similarity lower bound for image queries
        #[clap(long)]
        threshold: Option<f32>,

        /// Print ids instead of file paths
        #[clap(long, default_value = "false")]
        ids: bool,
    },
    /// Print the stored file path of an entry
    Get {
        id: u64,

        /// Write the stored image as PNG to this file instead
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// List all entries
    List {},
    /// Verify that vectors and images are in sync
    Check {},
}
