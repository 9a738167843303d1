// ABOUTME: Forks the per-protocol helper processes and wires their pipe plumbing
// ABOUTME: N From helpers (optionally via SSH) and one To helper per run

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::db_url::{empty_to_dash, DbUrl};

/// First descriptor of the To process's read range; its write range starts
/// `workers` further up. Arbitrary, but comfortably above anything inherited.
pub const TO_DESCRIPTOR_LIST_START: i32 = 1000;

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub from: DbUrl,
    pub to: DbUrl,
    pub via: Option<String>,
    pub workers: usize,
    pub ignore: Vec<String>,
    pub only: Vec<String>,
    pub partial: bool,
    pub verbose: u8,
}

/// Forks and wires up the helpers, then waits for all of them. Returns
/// whether every child exited successfully.
pub fn run(options: &LaunchOptions) -> Result<bool> {
    let from_binary = helper_binary(&options.from.protocol)?;
    let to_binary = helper_binary(&options.to.protocol)?;
    let workers = options.workers.max(1);

    let mut children: Vec<Child> = Vec::new();
    let mut read_fds: Vec<OwnedFd> = Vec::new();
    let mut write_fds: Vec<OwnedFd> = Vec::new();

    for worker in 0..workers {
        // one pipe per direction; the From helper talks on its stdio
        let (stdout_read, stdout_write) = create_pipe()?;
        let (stdin_read, stdin_write) = create_pipe()?;

        let mut command = from_command(&from_binary, options);
        command.stdin(Stdio::from(stdin_read));
        command.stdout(Stdio::from(stdout_write));
        let child = command
            .spawn()
            .with_context(|| format!("failed to start From helper for worker {}", worker))?;
        debug!("started From worker {} (pid {})", worker, child.id());
        children.push(child);

        read_fds.push(stdout_read);
        write_fds.push(stdin_write);
    }

    children.push(spawn_to(&to_binary, options, workers, read_fds, write_fds)?);

    let mut success = true;
    for mut child in children {
        let status = child.wait().context("failed to wait for a helper process")?;
        success &= status.success();
    }
    Ok(success)
}

/// The per-protocol helpers are installed next to this binary.
fn helper_binary(protocol: &str) -> Result<PathBuf> {
    let current = std::env::current_exe().context("cannot locate the current executable")?;
    let directory = current
        .parent()
        .context("the current executable has no parent directory")?;
    let path = directory.join(format!("ks_{}", protocol));
    if !path.exists() {
        bail!(
            "no helper for protocol {:?}: expected {}",
            protocol,
            path.display()
        );
    }
    Ok(path)
}

fn from_command(from_binary: &PathBuf, options: &LaunchOptions) -> Command {
    let url = &options.from;
    let helper_args = vec![
        "from".to_string(),
        empty_to_dash(&url.host).to_string(),
        empty_to_dash(&url.port).to_string(),
        url.database.clone(),
        empty_to_dash(&url.username).to_string(),
        empty_to_dash(&url.password).to_string(),
        options.verbose.to_string(),
    ];

    match &options.via {
        Some(via) => {
            info!("running the From end on {} over SSH", via);
            let mut command = Command::new("/usr/bin/ssh");
            command.arg("-C").arg("-c").arg("blowfish").arg(via);
            command.arg(from_binary);
            command.args(helper_args);
            command
        }
        None => {
            let mut command = Command::new(from_binary);
            command.args(helper_args);
            command
        }
    }
}

fn spawn_to(
    to_binary: &PathBuf,
    options: &LaunchOptions,
    workers: usize,
    read_fds: Vec<OwnedFd>,
    write_fds: Vec<OwnedFd>,
) -> Result<Child> {
    let url = &options.to;
    // engines without snapshot export make every worker take the
    // WITHOUT_SNAPSHOT path; the launcher knows the source protocol, the To
    // helper does not
    let snapshot = matches!(options.from.protocol.as_str(), "postgres" | "postgresql");

    let mut command = Command::new(to_binary);
    command.args(vec![
        "to".to_string(),
        empty_to_dash(&url.host).to_string(),
        empty_to_dash(&url.port).to_string(),
        url.database.clone(),
        empty_to_dash(&url.username).to_string(),
        empty_to_dash(&url.password).to_string(),
        empty_to_dash(&options.ignore.join(",")).to_string(),
        empty_to_dash(&options.only.join(",")).to_string(),
        workers.to_string(),
        TO_DESCRIPTOR_LIST_START.to_string(),
        options.verbose.to_string(),
        (if options.partial { "1" } else { "0" }).to_string(),
        (if snapshot { "1" } else { "0" }).to_string(),
    ]);

    let raw_reads: Vec<i32> = read_fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let raw_writes: Vec<i32> = write_fds.iter().map(|fd| fd.as_raw_fd()).collect();
    unsafe {
        command.pre_exec(move || {
            // dup2 clears O_CLOEXEC on the 1000+ duplicates; the flagged
            // sources close at exec, leaving the child exactly one copy of
            // each endpoint
            for (index, &fd) in raw_reads.iter().enumerate() {
                if libc::dup2(fd, TO_DESCRIPTOR_LIST_START + index as i32) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            for (index, &fd) in raw_writes.iter().enumerate() {
                if libc::dup2(fd, TO_DESCRIPTOR_LIST_START + (workers + index) as i32) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn().context("failed to start the To helper")?;
    debug!("started To helper (pid {})", child.id());
    // the parent's copies close here; the To process holds the dup'd ones
    drop(read_fds);
    drop(write_fds);
    Ok(child)
}

/// Pipe EOF only fires once every copy of the write end, in every process,
/// has closed, so no helper may inherit another pair's endpoints: abort
/// teardown depends on EOF arriving promptly. O_CLOEXEC keeps these
/// descriptors out of every child; the ends a child is meant to keep
/// survive its exec because dup2 (in `spawn_to`'s pre_exec hook, and in the
/// standard library's stdio setup for the From helpers) clears the flag on
/// the duplicate, while the flagged originals close at exec.
fn create_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error()).context("failed to create a pipe");
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
