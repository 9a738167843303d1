// ABOUTME: Shared argv handling and worker wiring for the ks_<protocol> helpers
// ABOUTME: from-mode serves stdio; to-mode adopts the launcher's descriptor range

use std::collections::HashSet;
use std::fs::File;
use std::os::fd::FromRawFd;

use anyhow::{bail, Context, Result};

use crate::client::DatabaseClient;
use crate::db_url::dash_to_empty;
use crate::sync::from::run_sync_from;
use crate::sync::to::{run_sync_to, SyncToOptions};

/// Connection fields handed to a helper, already stripped of the dash
/// encoding used to survive SSH argument flattening.
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub host: String,
    pub port: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Entry point shared by the per-protocol helper binaries. `connect` builds
/// one database client; to-mode calls it once per worker since connections
/// are never shared across threads.
pub fn run_helper<C, F>(connect: F) -> Result<()>
where
    C: DatabaseClient + Send,
    F: Fn(&ConnectArgs) -> Result<C>,
{
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = args.first().map(String::as_str);
    match mode {
        Some("from") => {
            if args.len() != 7 {
                bail!("usage: <helper> from host port database username password verbose");
            }
            let connect_args = connect_args(&args[1..6]);
            init_logging(&args[6]);
            let client = connect(&connect_args)?;
            run_sync_from(client, std::io::stdin(), std::io::stdout())?;
            Ok(())
        }
        Some("to") => {
            if args.len() != 13 {
                bail!(
                    "usage: <helper> to host port database username password \
                     ignore only workers startfd verbose partial snapshot"
                );
            }
            let connect_args = connect_args(&args[1..6]);
            let ignore = name_set(&args[6]);
            let only = name_set(&args[7]);
            let workers: usize = args[8].parse().context("bad workers count")?;
            let startfd: i32 = args[9].parse().context("bad starting descriptor")?;
            init_logging(&args[10]);
            let partial = args[11] == "1";
            let snapshot = args[12] == "1";

            let options = SyncToOptions {
                ignore,
                only,
                snapshot,
                partial,
                ..SyncToOptions::default()
            };

            let mut connections = Vec::with_capacity(workers);
            for worker in 0..workers as i32 {
                let client = connect(&connect_args)?;
                // the launcher dup'd our read descriptors to startfd.. and
                // our write descriptors to startfd+workers..
                let input = unsafe { File::from_raw_fd(startfd + worker) };
                let output = unsafe { File::from_raw_fd(startfd + workers as i32 + worker) };
                connections.push((client, input, output));
            }
            run_sync_to(connections, &options)?;
            Ok(())
        }
        _ => bail!("usage: <helper> from|to ..."),
    }
}

fn connect_args(fields: &[String]) -> ConnectArgs {
    ConnectArgs {
        host: dash_to_empty(&fields[0]).to_string(),
        port: dash_to_empty(&fields[1]).to_string(),
        database: fields[2].clone(),
        username: dash_to_empty(&fields[3]).to_string(),
        password: dash_to_empty(&fields[4]).to_string(),
    }
}

fn name_set(csv: &str) -> HashSet<String> {
    dash_to_empty(csv)
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// RUST_LOG wins when set; otherwise the launcher's verbosity picks the
/// level the same way on both sides of the wire.
pub fn init_logging(verbose: &str) {
    let default_level = match verbose {
        "0" => "info",
        "1" => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
