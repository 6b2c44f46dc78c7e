use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use talksearch::pipeline::DEFAULT_PARSER_WORKERS;

#[derive(Debug, Parser)]
#[command(
    name = "talksearch",
    about = "Build, serve and refresh a search index of conference talks"
)]
pub struct Cli {
    /// Path to the talk data folder (a git checkout)
    #[arg(long, env = "TALKSEARCH_DATA_PATH")]
    pub data_path: PathBuf,

    /// Folder holding index builds [default: XDG data home]
    #[arg(long, env = "TALKSEARCH_INDEX_PATH")]
    pub index_path: Option<PathBuf>,

    /// Start the HTTP query API
    #[arg(long)]
    pub http: bool,

    /// Address the HTTP API listens on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub http_addr: SocketAddr,

    /// Build a new index even if one already exists
    #[arg(long)]
    pub force_rebuild: bool,

    /// Origin allowed to make cross-site requests (repeatable)
    #[arg(long = "allowed-origin", default_value = "http://localhost:8000")]
    pub allowed_origins: Vec<String>,

    /// How often to pull the data repository, e.g. "10m". 0 disables
    /// watching
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    pub check_interval: Duration,

    /// Git remote to pull from
    #[arg(long, default_value = "origin")]
    pub remote: String,

    /// Git branch to pull
    #[arg(long, default_value = "master")]
    pub branch: String,

    /// Number of threads parsing collections during a build
    #[arg(long, default_value_t = DEFAULT_PARSER_WORKERS)]
    pub parser_workers: usize,

    /// Leave replaced index builds on disk
    #[arg(long)]
    pub keep_old_indexes: bool,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}
