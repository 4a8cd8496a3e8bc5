//! Sweeps up `podman container cleanup` helpers that detach from the engine
//! and would otherwise hang around after we exit.

use memchr::memmem;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::error::LaunchError;

/// argv of the helper as it shows up in /proc/<pid>/cmdline
pub const CLEANUP_MARKER: &[u8] = b"container\0cleanup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    /// NUL separated, as the kernel hands it out
    pub cmdline: Vec<u8>,
}

/// - Lists running processes with their command lines
/// - Entries that vanish or can't be read are skipped, only failing to list
///   at all is an error
pub trait ProcessLister {
    fn processes(&self) -> Result<Vec<ProcessEntry>, LaunchError>;
}

/// Delivers signals, swapped out in tests so nothing real gets killed
pub trait Signaller {
    fn signal(&self, pid: Pid, signal: Signal) -> nix::Result<()>;
}

/// kill(2)
#[derive(Debug, Default, Clone, Copy)]
pub struct Kill;

impl Signaller for Kill {
    fn signal(&self, pid: Pid, signal: Signal) -> nix::Result<()> {
        signal::kill(pid, signal)
    }
}

/// Walks a procfs mount
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ProcessLister for ProcFs {
    fn processes(&self) -> Result<Vec<ProcessEntry>, LaunchError> {
        let entries = fs::read_dir(&self.root).map_err(|source| LaunchError::Scan {
            path: self.root.clone(),
            source,
        })?;

        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
                Some(pid) => Pid::from_raw(pid),
                None => continue,
            };

            // raced with the process exiting, or not ours to read
            let cmdline = match fs::read(entry.path().join("cmdline")) {
                Ok(cmdline) => cmdline,
                Err(_) => continue,
            };

            processes.push(ProcessEntry { pid, cmdline });
        }

        Ok(processes)
    }
}

/// Sends SIGTERM to every process whose command line contains `marker`,
/// except ourselves: `podman-launcher container cleanup` carries the marker
/// in its own argv.
///
/// A failed kill is logged and skipped. Returns the pids that were signalled.
pub fn reap<L, S>(lister: &L, signaller: &S, marker: &[u8]) -> Result<Vec<Pid>, LaunchError>
where
    L: ProcessLister + ?Sized,
    S: Signaller + ?Sized,
{
    let me = Pid::this();
    let mut reaped = Vec::new();

    for ProcessEntry { pid, cmdline } in lister.processes()? {
        if pid == me || memmem::find(&cmdline, marker).is_none() {
            continue;
        }

        debug!("{pid} matches cleanup marker");
        match signaller.signal(pid, Signal::SIGTERM) {
            Ok(()) => {
                info!("terminated leftover cleanup process {pid}");
                reaped.push(pid);
            }
            Err(e) => warn!("failed to terminate {pid}: {e}"),
        }
    }

    Ok(reaped)
}
