// ABOUTME: CLI entry point: parses URLs and flags, then launches the helper processes
// ABOUTME: Exit code is zero only when every helper exits cleanly

use anyhow::bail;
use clap::{ArgAction, Parser};

use kitchen_sync::db_url::DbUrl;
use kitchen_sync::launcher::{self, LaunchOptions};

#[derive(Parser)]
#[command(name = "ks")]
#[command(about = "Copies one database's contents to another, moving only the rows that differ")]
#[command(version)]
struct Cli {
    /// The URL of the database to copy data from
    #[arg(long)]
    from: String,
    /// The URL of the database to copy data to
    #[arg(long)]
    to: String,
    /// Server to run the 'from' end on, for when the link to the source
    /// database is the bottleneck
    #[arg(long)]
    via: Option<String>,
    /// Number of concurrent workers at each end
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Comma-separated list of tables to skip
    #[arg(long, value_delimiter = ',')]
    ignore: Vec<String>,
    /// Comma-separated list of tables to sync, skipping all others
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    /// Attempt to commit changes even if some workers hit errors
    #[arg(long)]
    partial: bool,
    /// Log more as the program works; twice for per-command detail
    #[arg(long, short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    kitchen_sync::helper::init_logging(&cli.verbose.to_string());

    let from = DbUrl::parse(&cli.from)?;
    let to = DbUrl::parse(&cli.to)?;

    // a name in both sets would silently vanish (ignore wins); make the
    // caller pick one
    for name in &cli.only {
        if cli.ignore.contains(name) {
            bail!("table {:?} is listed in both --ignore and --only", name);
        }
    }

    if cli.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let options = LaunchOptions {
        from,
        to,
        via: cli.via,
        workers: cli.workers,
        ignore: cli.ignore,
        only: cli.only,
        partial: cli.partial,
        verbose: cli.verbose,
    };

    println!("Kitchen Sync");
    if launcher::run(&options)? {
        println!("Finished Kitchen Syncing.");
        Ok(())
    } else {
        println!("Kitchen Syncing failed.");
        std::process::exit(1);
    }
}
