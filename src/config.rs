//! Everything the launcher needs to know about where things live, resolved
//! once at startup. Components get a `&LaunchConfig` and never look at the
//! process environment themselves.

use std::{
    borrow::Cow,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use crate::error::LaunchError;

pub const TARGET_DIR_VAR: &str = "PODMAN_STATIC_TARGET_DIR";
pub const TMP_DIR_VAR: &str = "PODMAN_STATIC_TMP_DIR";
pub const ASSETS_VAR: &str = "PODMAN_LAUNCHER_ASSETS";

const DEFAULT_TARGET_DIR: &str = ".local/share/podman-static";
const DEFAULT_TMP_DIR: &str = "/var/tmp";

/// Subdirectory of the scratch base, keeps us away from a system podman in
/// /run/user/$UID/containers
const NAMESPACE: &str = "podman-static";

/// Where the asset archive comes from
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Cow<'static, [u8]>),
    /// read lazily, only when an unpack is actually needed
    File(PathBuf),
    Missing,
}

impl Payload {
    /// Picks the compiled-in archive.
    #[cfg(feature = "embedded-assets")]
    pub fn from_env<F>(_var: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        Payload::Bytes(Cow::Borrowed(include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/assets/assets.tar.gz"
        ))))
    }

    /// Whatever file `PODMAN_LAUNCHER_ASSETS` points to, if anything.
    #[cfg(not(feature = "embedded-assets"))]
    pub fn from_env<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        match non_empty(&var, ASSETS_VAR) {
            Some(path) => Payload::File(PathBuf::from(path)),
            None => Payload::Missing,
        }
    }

    pub fn bytes(&self) -> Result<Cow<'_, [u8]>, LaunchError> {
        match self {
            Payload::Bytes(bytes) => Ok(Cow::Borrowed(bytes.as_ref())),
            Payload::File(path) => fs::read(path)
                .map(Cow::Owned)
                .map_err(LaunchError::fs("read asset payload", path)),
            Payload::Missing => Err(LaunchError::NoPayload),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    target_dir: PathBuf,
    tmp_dir: PathBuf,
    runtime_dir: PathBuf,
    containers_conf: PathBuf,
    registries_conf: PathBuf,
    storage_conf: PathBuf,
    policy_json: PathBuf,
    payload: Payload,
}

impl LaunchConfig {
    pub fn new(
        target_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        uid: u32,
        payload: Payload,
    ) -> Self {
        let target_dir = target_dir.into();
        let tmp_dir = tmp_dir.into();
        let runtime_dir = tmp_dir.join(NAMESPACE).join(uid.to_string());
        let containers = target_dir.join("conf/containers");

        Self {
            containers_conf: containers.join("containers.conf"),
            registries_conf: containers.join("registries.conf"),
            storage_conf: containers.join("storage.conf"),
            policy_json: containers.join("policy.json"),
            target_dir,
            tmp_dir,
            runtime_dir,
            payload,
        }
    }

    /// `HOME`, `PODMAN_STATIC_TARGET_DIR` and `PODMAN_STATIC_TMP_DIR`, empty
    /// values count as unset
    pub fn from_env<F>(var: F, uid: u32, payload: Payload) -> Result<Self, LaunchError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let target_dir = match non_empty(&var, TARGET_DIR_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = non_empty(&var, "HOME").ok_or(LaunchError::NoHome)?;
                PathBuf::from(home).join(DEFAULT_TARGET_DIR)
            }
        };

        let tmp_dir = non_empty(&var, TMP_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TMP_DIR));

        Ok(Self::new(target_dir, tmp_dir, uid, payload))
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// `<tmp>/podman-static/<uid>`
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn containers_conf(&self) -> &Path {
        &self.containers_conf
    }

    pub fn registries_conf(&self) -> &Path {
        &self.registries_conf
    }

    pub fn storage_conf(&self) -> &Path {
        &self.storage_conf
    }

    pub fn policy_json(&self) -> &Path {
        &self.policy_json
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.target_dir.join("bin")
    }

    /// The engine binary, doubles as the "is it installed" marker
    pub fn engine_binary(&self) -> PathBuf {
        self.target_dir.join("bin/podman")
    }

    /// Pristine defaults shipped in the archive
    pub fn etc_dir(&self) -> PathBuf {
        self.target_dir.join("etc")
    }

    /// Working copy of the defaults, the user may edit these
    pub fn conf_dir(&self) -> PathBuf {
        self.target_dir.join("conf")
    }

    pub fn storage_root(&self) -> PathBuf {
        self.target_dir.join("share/containers/storage")
    }

    pub fn run_root(&self) -> PathBuf {
        self.runtime_dir.join("containers")
    }
}

fn non_empty<F>(var: &F, key: &str) -> Option<OsString>
where
    F: Fn(&str) -> Option<OsString>,
{
    var(key).filter(|value| !value.is_empty())
}
