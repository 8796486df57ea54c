use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "fpush")]
#[command(about = "Push a directory of files to a server over plain TCP", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// JSON configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Port to connect to or listen on (default: 9000)
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    /// Read chunk size in bytes (default: 4096)
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Network read/write timeout, e.g. "30s" or "2m"
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Disable progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send every file in a directory
    Send {
        /// Directory to send (default: client_files)
        dir: Option<PathBuf>,

        /// Server to connect to (default: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,
    },

    /// Accept files from senders
    Receive {
        /// Directory to write received files to (default: server_files)
        dir: Option<PathBuf>,

        /// Address to listen on (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
