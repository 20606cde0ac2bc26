pub mod commands;

use clap::{Args, ValueEnum};
use stratus_core::LocalBehavior;

/// Connection settings shared by every command that talks to the server.
#[derive(Args, Clone, Debug)]
pub struct ServerArgs {
    /// Base URL of the server, e.g. https://cloud.example.com
    #[arg(long, env = "STRATUS_SERVER")]
    pub server: String,
    #[arg(long, env = "STRATUS_USER")]
    pub user: String,
    /// Bearer token sent with every request
    #[arg(long, env = "STRATUS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Server accepts the legacy chunked upload protocol
    #[arg(long)]
    pub chunking: bool,
    #[arg(short, long, default_value_t = stratus_config::DEFAULT_WORKERS)]
    pub workers: usize,
    /// Upload/download bandwidth cap in KiB/s
    #[arg(long)]
    pub limit_kb: Option<u64>,
}

#[derive(ValueEnum, Clone, Debug, Copy, Default)]
pub enum CliBehavior {
    /// Leave the local file in place
    #[default]
    Copy,
    /// Delete the local file once the upload succeeded
    Move,
}

impl From<CliBehavior> for LocalBehavior {
    fn from(b: CliBehavior) -> Self {
        match b {
            CliBehavior::Copy => LocalBehavior::Copy,
            CliBehavior::Move => LocalBehavior::Move,
        }
    }
}
