//! Materializes the bundled archive into the target directory.
//!
//! Presence is decided by probing a fixed list of files. If any one of them
//! is missing the whole archive is unpacked again over whatever is there, so
//! an interrupted unpack just gets retried on the next run. Contents are never
//! verified, a stale or corrupt file that exists counts as installed.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};
use tracing::{debug, info};

use crate::{config::Payload, error::LaunchError};

/// Files that must exist under the target directory for the bundle to count
/// as installed
pub const MANIFEST: &[&str] = &[
    "bin/crun",
    "bin/fuse-overlayfs",
    "bin/fusermount3",
    "bin/podman",
    "bin/runc",
    "bin/slirp4netns",
    "conf/cni/net.d/87-podman-bridge.conflist",
    "conf/containers/containers.conf",
    "conf/containers/policy.json",
    "conf/containers/registries.conf",
    "conf/containers/storage.conf",
    "lib/cni/bridge",
    "lib/cni/firewall",
    "lib/cni/host-local",
    "lib/cni/loopback",
    "lib/cni/portmap",
    "lib/cni/tuning",
    "lib/podman/catatonit",
    "lib/podman/conmon",
    "lib/podman/rootlessport",
];

#[derive(thiserror::Error, Debug)]
pub enum UnpackError {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("{} exited with {status}", program.display())]
    Failed { program: PathBuf, status: ExitStatus },
}

/// - Takes a compressed archive and writes its contents into `dst`
/// - `dst` already exists when this is called
pub trait Unpack {
    fn unpack(&self, archive: &[u8], dst: &Path) -> Result<(), UnpackError>;
}

/// Shells out to the host `tar`, feeding it the archive on stdin
#[derive(Debug, Clone)]
pub struct Tar {
    path: PathBuf,
}

impl Tar {
    /// Finds `tar` on PATH. Not having it is fatal, so check this before
    /// doing anything else.
    pub fn locate() -> Result<Self, LaunchError> {
        which::which("tar")
            .map(|path| Tar { path })
            .map_err(|_| LaunchError::MissingDependency("tar"))
    }
}

impl Unpack for Tar {
    fn unpack(&self, archive: &[u8], dst: &Path) -> Result<(), UnpackError> {
        debug!("{} -xzf - -C {}", self.path.display(), dst.display());

        let mut child = Command::new(&self.path)
            .args(["-xzf", "-", "-C"])
            .arg(dst)
            .stdin(Stdio::piped())
            .spawn()?;

        // tar may bail out early and close its end, its exit status is the
        // more useful error in that case
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(archive),
            None => Ok(()),
        };

        let status = child.wait()?;
        if !status.success() {
            return Err(UnpackError::Failed {
                program: self.path.clone(),
                status,
            });
        }

        Ok(written?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Install {
    /// every manifest file was already there, nothing was touched
    Present,
    /// the archive was unpacked on this run
    Unpacked,
}

/// First manifest entry that does not exist under `target`
pub fn first_missing<'m>(target: &Path, manifest: &[&'m str]) -> Option<&'m str> {
    manifest
        .iter()
        .copied()
        .find(|file| fs::metadata(target.join(file)).is_err())
}

/// Unpacks `payload` into `target` unless every manifest file is present.
pub fn ensure_assets<U>(
    target: &Path,
    manifest: &[&str],
    payload: &Payload,
    unpacker: &U,
) -> Result<Install, LaunchError>
where
    U: Unpack + ?Sized,
{
    let missing = match first_missing(target, manifest) {
        Some(missing) => missing,
        None => {
            debug!("all assets present in {}", target.display());
            return Ok(Install::Present);
        }
    };

    info!("{missing} is missing, unpacking assets into {}", target.display());

    fs::create_dir_all(target).map_err(LaunchError::fs("create", target))?;

    let archive = payload.bytes()?;
    unpacker
        .unpack(&archive, target)
        .map_err(|source| LaunchError::Unpack {
            path: target.to_path_buf(),
            source,
        })?;

    Ok(Install::Unpacked)
}
