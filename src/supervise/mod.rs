//! Runs the engine in the foreground and cleans up after it.

pub mod reap;

use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{waitid, Id, WaitPidFlag},
    },
    unistd::Pid,
};
use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

use self::reap::{reap, ProcessLister, Signaller, CLEANUP_MARKER};
use crate::{config::LaunchConfig, error::LaunchError};

/// Environment handed to the engine: everything we inherited with our
/// overrides appended after it. Later entries win, same as `Command::envs`.
#[derive(Debug, Clone, Default)]
pub struct ChildEnv {
    vars: Vec<(OsString, OsString)>,
}

impl ChildEnv {
    pub fn new<I>(conf: &LaunchConfig, inherited: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut vars: Vec<_> = inherited.into_iter().collect();

        let mut path = conf.bin_dir().into_os_string();
        let inherited_path = vars
            .iter()
            .rev()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.clone())
            .filter(|value| !value.is_empty());
        if let Some(inherited_path) = inherited_path {
            path.push(":");
            path.push(inherited_path);
        }

        // https://docs.podman.io/en/latest/markdown/podman.1.html#environment-variables
        let overrides: [(&str, OsString); 5] = [
            ("CONTAINERS_CONF", conf.containers_conf().into()),
            ("CONTAINERS_REGISTRIES_CONF", conf.registries_conf().into()),
            ("CONTAINERS_STORAGE_CONF", conf.storage_conf().into()),
            ("PATH", path),
            ("XDG_RUNTIME_DIR", conf.runtime_dir().into()),
        ];
        vars.extend(
            overrides
                .into_iter()
                .map(|(key, value)| (OsString::from(key), value)),
        );

        Self { vars }
    }

    /// In order, duplicates included
    pub fn vars(&self) -> &[(OsString, OsString)] {
        &self.vars
    }

    /// What the child actually sees
    pub fn resolved(&self) -> BTreeMap<&OsStr, &OsStr> {
        self.vars
            .iter()
            .map(|(key, value)| (key.as_os_str(), value.as_os_str()))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_os_str())
    }
}

/// The engine's terminal size detection can race with its start and then
/// sit waiting for a resize that never comes. Poke it with one SIGWINCH.
#[derive(Debug, Clone, Copy)]
pub struct ResizeNudge {
    pub interval: Duration,
    /// gives up if the child never shows up
    pub max_attempts: u32,
}

impl Default for ResizeNudge {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    Started(Pid),
    /// the child has exited (but is not reaped yet), stop
    Exited,
}

impl ResizeNudge {
    /// Waits for the pid, then signals it once an interval later. Returns
    /// whether a signal was delivered.
    pub fn run<S>(&self, events: flume::Receiver<ChildEvent>, signaller: &S) -> bool
    where
        S: Signaller + ?Sized,
    {
        let mut pid = None;

        for _ in 0..self.max_attempts {
            match events.recv_timeout(self.interval) {
                Ok(ChildEvent::Started(started)) => pid = Some(started),
                Ok(ChildEvent::Exited) | Err(flume::RecvTimeoutError::Disconnected) => {
                    return false
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    let pid = match pid {
                        Some(pid) => pid,
                        None => continue,
                    };

                    return match signaller.signal(pid, Signal::SIGWINCH) {
                        Ok(()) => {
                            debug!("sent SIGWINCH to {pid}");
                            true
                        }
                        Err(e) => {
                            debug!("SIGWINCH to {pid} failed: {e}");
                            false
                        }
                    };
                }
            }
        }

        false
    }
}

pub struct Supervisor<L, S> {
    lister: L,
    signaller: S,
    nudge: ResizeNudge,
}

impl<L, S> Supervisor<L, S>
where
    L: ProcessLister,
    S: Signaller + Sync,
{
    pub fn new(lister: L, signaller: S) -> Self {
        Self {
            lister,
            signaller,
            nudge: ResizeNudge::default(),
        }
    }

    pub fn with_nudge(mut self, nudge: ResizeNudge) -> Self {
        self.nudge = nudge;
        self
    }

    /// Runs `program` attached to our stdio and waits for it. Leftover
    /// cleanup helpers are swept afterwards no matter how the child went; a
    /// failed sweep is only logged.
    pub fn supervise(
        &self,
        program: &Path,
        args: &[OsString],
        env: &ChildEnv,
    ) -> Result<ExitStatus, LaunchError> {
        let status = self.run(program, args, env);

        match reap(&self.lister, &self.signaller, CLEANUP_MARKER) {
            Ok(reaped) if !reaped.is_empty() => {
                info!("terminated {} leftover cleanup processes", reaped.len())
            }
            Ok(_) => {}
            Err(e) => warn!("cleanup sweep failed: {e}"),
        }

        status
    }

    fn run(
        &self,
        program: &Path,
        args: &[OsString],
        env: &ChildEnv,
    ) -> Result<ExitStatus, LaunchError> {
        info!("starting {}", program.display());
        debug!("{} {:?}", program.display(), args);

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(env.resolved())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let (tx, rx) = flume::unbounded();
        let nudge = self.nudge;
        let signaller = &self.signaller;

        // the nudge can't outlive this scope, and the child stays unreaped
        // (so its pid can't be reused) until the nudge is done
        let child = thread::scope(|s| {
            s.spawn(move || nudge.run(rx, signaller));

            let child = command.spawn().map_err(|source| LaunchError::Spawn {
                program: program.to_path_buf(),
                source,
            });

            if let Ok(child) = &child {
                let pid = Pid::from_raw(child.id() as i32);
                tx.send(ChildEvent::Started(pid)).ok();
                wait_exited(pid);
            }

            tx.send(ChildEvent::Exited).ok();
            child
        })?;

        reap_child(child, program)
    }
}

/// Blocks until `pid` has exited without reaping it.
fn wait_exited(pid: Pid) {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                // Child::wait below still does the job
                debug!("waitid({pid}) failed: {e}");
                return;
            }
            Ok(_) => return,
        }
    }
}

fn reap_child(mut child: Child, program: &Path) -> Result<ExitStatus, LaunchError> {
    let status = child.wait().map_err(|source| LaunchError::Wait {
        program: program.to_path_buf(),
        source,
    })?;

    debug!("{} exited with {status}", program.display());
    Ok(status)
}
