use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "agrorisk",
    version,
    about = "Agronomic risk indicators from declarative rule trees"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to model.yaml
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// JSON array of weather records (stdin when omitted)
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Where to write the results (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the model over the data (default)
    Run,
    /// Build every rule graph of the model without data
    Check,
    /// List registered rule types
    Rules,
}
