//! Command-line interface.
//!
//! Flags provide the lowest-precedence defaults; values from the YAML
//! configuration file override them and environment variables override
//! both (see `config::Config::load`).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(name = "terraboard")]
#[clap(about = "Index, query and compare infrastructure state snapshots", version)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[clap(short = 'c', long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Database host
    #[clap(long, default_value = "localhost")]
    pub db_host: String,

    /// Database port
    #[clap(long, default_value_t = 5432)]
    pub db_port: u16,

    /// Database user
    #[clap(long, default_value = "terraboard")]
    pub db_user: String,

    /// Database password
    #[clap(long, default_value = "")]
    pub db_password: String,

    /// Database name
    #[clap(long, default_value = "terraboard")]
    pub db_name: String,

    /// Database SSL mode
    #[clap(long, default_value = "require")]
    pub db_sslmode: String,

    /// Disable the background sync loop
    #[clap(long)]
    pub no_sync: bool,

    /// Minutes between sync sweeps
    #[clap(long, default_value_t = 1)]
    pub sync_interval: u64,

    /// Log level (debug, info, warn, error, fatal, panic)
    #[clap(long, default_value = "info")]
    pub log_level: String,

    /// Log format (plain, json)
    #[clap(long, default_value = "plain")]
    pub log_format: String,
}
