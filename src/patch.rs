//! Turns the shipped defaults under `etc/` into a working `conf/` tree that
//! points into the target directory.
//!
//! storage.conf is patched by plain substring replacement and containers.conf
//! is rendered from a fixed template. Neither is parsed. The output is
//! byte-for-byte what tooling built around this layout expects, and it keeps
//! us independent of the config format's own versioning. The catch is that
//! `/var` is replaced anywhere it appears, not only as a path prefix.
//!
//! Every file is written at most once: if it already exists it is left
//! alone, so user edits survive later runs and re-unpacks.

use memchr::memmem;
use std::{
    fs, io,
    os::unix::{ffi::OsStrExt, fs::PermissionsExt},
    path::Path,
};
use tracing::{debug, info};

use crate::{config::LaunchConfig, error::LaunchError};

/// System-wide prefix the default storage.conf uses for its storage roots
pub const SYSTEM_VAR_DIR: &str = "/var";
/// Where the default storage.conf expects fuse-overlayfs
pub const SYSTEM_FUSE_OVERLAYFS: &str = "/usr/local/bin/fuse-overlayfs";

/// What `ensure_configs` actually wrote on this run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Patched {
    pub conf_tree: bool,
    pub storage_conf: bool,
    pub containers_conf: bool,
}

pub fn ensure_configs(conf: &LaunchConfig) -> Result<Patched, LaunchError> {
    let mut patched = Patched::default();

    // look before copying the tree, a fresh copy still has to be patched
    let storage_missing = fs::metadata(conf.storage_conf()).is_err();
    let containers_missing = fs::metadata(conf.containers_conf()).is_err();

    let etc = conf.etc_dir();
    let conf_dir = conf.conf_dir();
    if fs::metadata(&conf_dir).is_err() {
        info!("copying default configs into {}", conf_dir.display());
        copy_tree(&etc, &conf_dir).map_err(LaunchError::fs("copy", &etc))?;
        patched.conf_tree = true;
    }

    if storage_missing {
        copy_default(&etc.join("containers/storage.conf"), conf.storage_conf())?;
        setup_storage_conf(conf)?;
        patched.storage_conf = true;
    }

    if containers_missing {
        copy_default(&etc.join("containers/containers.conf"), conf.containers_conf())?;
        setup_containers_conf(conf)?;
        patched.containers_conf = true;
    }

    Ok(patched)
}

/// Points storage roots and the fuse-overlayfs mount program at the target
/// directory.
fn setup_storage_conf(conf: &LaunchConfig) -> Result<(), LaunchError> {
    let path = conf.storage_conf();
    let content = fs::read(path).map_err(LaunchError::fs("read", path))?;

    let content = substitute_storage(&content, conf.target_dir());

    fs::write(path, content).map_err(LaunchError::fs("write", path))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(LaunchError::fs("chmod", path))?;

    info!("patched {}", path.display());
    Ok(())
}

fn setup_containers_conf(conf: &LaunchConfig) -> Result<(), LaunchError> {
    let path = conf.containers_conf();
    let content = render_containers_conf(conf.target_dir(), conf.runtime_dir());

    fs::write(path, content).map_err(LaunchError::fs("write", path))?;

    info!("rendered {}", path.display());
    Ok(())
}

/// `/var` becomes `target`, the system fuse-overlayfs becomes
/// `target/bin/fuse-overlayfs`. Nothing else changes.
pub fn substitute_storage(content: &[u8], target: &Path) -> Vec<u8> {
    let fuse = target.join("bin/fuse-overlayfs");

    let content = replace_all(
        content,
        SYSTEM_VAR_DIR.as_bytes(),
        target.as_os_str().as_bytes(),
    );
    replace_all(
        &content,
        SYSTEM_FUSE_OVERLAYFS.as_bytes(),
        fuse.as_os_str().as_bytes(),
    )
}

pub fn render_containers_conf(target: &Path, runtime: &Path) -> String {
    let path = target.display();
    let runtime = runtime.display();

    format!(
        r#"[containers]
init_path = "{path}/lib/podman/catatonit"
[engine]
conmon_env_vars = [
    "CONTAINERS_CONF={path}/conf/containers/containers.conf",
    "CONTAINERS_REGISTRIES_CONF={path}/conf/containers/registries.conf",
    "CONTAINERS_STORAGE_CONF={path}/conf/containers/storage.conf",
    "XDG_RUNTIME_DIR={runtime}",
    "PATH={path}/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
]
conmon_path=[ "{path}/lib/podman/conmon" ]
helper_binaries_dir = [ "{path}/lib/podman" ]
runtime = "crun"
network_cmd_path = "{path}/bin/slirp4netns"
static_dir = "{path}/share/podman/libpod"
volume_path = "{path}/share/podman/volume"
[engine.runtimes]
crun = [ "{path}/bin/crun" ]
runc = [ "{path}/bin/runc" ]
[network]
cni_plugin_dirs = [ "{path}/lib/cni" ]"#
    )
}

fn copy_default(from: &Path, to: &Path) -> Result<(), LaunchError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(LaunchError::fs("create", parent))?;
    }

    debug!("{} -> {}", from.display(), to.display());
    fs::copy(from, to).map_err(LaunchError::fs("copy", from))?;
    Ok(())
}

/// `cp -r src dst`, symlinks are recreated rather than followed
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let to = dst.join(entry.file_name());

        if kind.is_dir() {
            copy_tree(&entry.path(), &to)?;
        } else if kind.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }

    Ok(())
}

fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    // an empty pattern matches everywhere, treat it as nothing to replace
    if from.is_empty() {
        return haystack.to_vec();
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut last = 0;
    for at in memmem::find_iter(haystack, from) {
        out.extend_from_slice(&haystack[last..at]);
        out.extend_from_slice(to);
        last = at + from.len();
    }

    out.extend_from_slice(&haystack[last..]);
    out
}
