use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use stratus_cli::{commands, CliBehavior, ServerArgs};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Where the transfer database lives (defaults to the platform data dir)
    #[arg(long, global = true, env = "STRATUS_DATA_DIR")]
    data_dir: Option<Utf8PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Upload {
        local: Utf8PathBuf,
        remote: String,
        #[command(flatten)]
        server: ServerArgs,
        #[arg(long, help = "Upload into this space instead of the personal home")]
        space: Option<String>,
        #[arg(long, help = "Only overwrite the server copy if it still has this etag")]
        if_match: Option<String>,
        #[arg(long, value_enum, default_value_t = CliBehavior::Copy)]
        behavior: CliBehavior,
    },
    /// Download a remote file
    Download {
        remote: String,
        local: Utf8PathBuf,
        #[command(flatten)]
        server: ServerArgs,
        #[arg(long)]
        space: Option<String>,
    },
    /// Bring one local/remote file pair in line
    Sync {
        local: Utf8PathBuf,
        remote: String,
        #[command(flatten)]
        server: ServerArgs,
        #[arg(long)]
        space: Option<String>,
        #[arg(long, help = "On conflict, keep the local edit as a conflicted copy")]
        keep_both: bool,
    },
    /// List recorded transfers
    Status {
        #[arg(long)]
        account: Option<String>,
    },
    /// Retry a failed transfer, or resume everything queued
    Retry {
        id: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Remove a transfer and release its server-side session
    Cancel {
        id: String,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Show what upload protocols the server offers
    Probe {
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = cli.data_dir;
    match cli.command {
        Commands::Upload {
            local,
            remote,
            server,
            space,
            if_match,
            behavior,
        } => {
            commands::cmd_upload(&server, data_dir, local, remote, space, if_match, behavior)
                .await?;
        }
        Commands::Download {
            remote,
            local,
            server,
            space,
        } => {
            commands::cmd_download(&server, data_dir, remote, local, space).await?;
        }
        Commands::Sync {
            local,
            remote,
            server,
            space,
            keep_both,
        } => {
            commands::cmd_sync(&server, data_dir, local, remote, space, keep_both).await?;
        }
        Commands::Status { account } => commands::cmd_status(data_dir, account)?,
        Commands::Retry { id, server } => {
            commands::cmd_retry(&server, data_dir, id).await?;
        }
        Commands::Cancel { id, server } => commands::cmd_cancel(&server, data_dir, id).await?,
        Commands::Probe { server } => {
            commands::cmd_probe(&server, data_dir).await?;
        }
    }

    Ok(())
}
