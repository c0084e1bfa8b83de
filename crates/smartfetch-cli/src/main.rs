//! Smartfetch CLI - fetch from Git smart HTTP remotes.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Smartfetch - Git smart HTTP fetch client
#[derive(Parser, Debug)]
#[command(name = "smartfetch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty bare repository
    Init {
        /// Directory to initialize
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// List the refs of a remote
    LsRemote {
        /// Remote repository URL
        url: String,
        /// Print refs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fetch objects and refs from a remote
    Fetch(FetchArgs),

    /// Show version information
    Version,
}

#[derive(clap::Args, Debug)]
struct FetchArgs {
    /// Remote repository URL
    url: String,

    /// Repository to fetch into (work tree or git directory)
    #[arg(long, default_value = ".")]
    git_dir: PathBuf,

    /// Refspec to fetch; may be repeated
    #[arg(long = "refspec", value_name = "REFSPEC")]
    refspecs: Vec<String>,

    /// Limit history to this many commits
    #[arg(long)]
    depth: Option<u32>,

    /// Fetch the full history of a shallow repository
    #[arg(long, conflicts_with = "depth")]
    unshallow: bool,

    /// Maximum number of negotiation rounds
    #[arg(long)]
    max_rounds: Option<usize>,

    /// Haves sent in the first negotiation round
    #[arg(long)]
    initial_window: Option<usize>,

    /// Do not print server progress
    #[arg(short, long)]
    quiet: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable output.
    Pretty,
    /// One JSON object per event.
    Json,
}

fn init_logging(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("smartfetch_git={level},smartfetch_storage={level},smartfetch={level}").into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let result = match cli.command {
        Commands::Init { path } => commands::init(&path).await,
        Commands::LsRemote { url, json } => commands::ls_remote(&url, json).await,
        Commands::Fetch(args) => commands::fetch(args.into()).await,
        Commands::Version => {
            println!("smartfetch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

impl From<FetchArgs> for commands::FetchCommand {
    fn from(args: FetchArgs) -> Self {
        Self {
            url: args.url,
            git_dir: args.git_dir,
            refspecs: args.refspecs,
            depth: args.depth,
            unshallow: args.unshallow,
            max_rounds: args.max_rounds,
            initial_window: args.initial_window,
            quiet: args.quiet,
            json: args.json,
        }
    }
}
