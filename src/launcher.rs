use std::{
    ffi::{OsStr, OsString},
    fs::{self, DirBuilder},
    os::unix::{
        fs::{DirBuilderExt, PermissionsExt},
        process::ExitStatusExt,
    },
    path::Path,
    process::ExitStatus,
};
use tracing::debug;

use crate::{
    args::{self, VERSION},
    assets::{self, Install, Tar, Unpack, MANIFEST},
    config::LaunchConfig,
    error::LaunchError,
    patch,
    supervise::{
        reap::{Kill, ProcFs, ProcessLister, Signaller},
        ChildEnv, Supervisor,
    },
};

/// One invocation: unpack if needed, patch configs if we just unpacked,
/// rewrite the arguments and run the engine.
pub struct Launcher<U, L, S> {
    conf: LaunchConfig,
    unpacker: U,
    supervisor: Supervisor<L, S>,
    inherited_env: Vec<(OsString, OsString)>,
}

impl Launcher<Tar, ProcFs, Kill> {
    pub fn new(conf: LaunchConfig, tar: Tar, inherited_env: Vec<(OsString, OsString)>) -> Self {
        Self::with_parts(
            conf,
            tar,
            Supervisor::new(ProcFs::default(), Kill),
            inherited_env,
        )
    }
}

impl<U, L, S> Launcher<U, L, S>
where
    U: Unpack,
    L: ProcessLister,
    S: Signaller + Sync,
{
    pub fn with_parts(
        conf: LaunchConfig,
        unpacker: U,
        supervisor: Supervisor<L, S>,
        inherited_env: Vec<(OsString, OsString)>,
    ) -> Self {
        Self {
            conf,
            unpacker,
            supervisor,
            inherited_env,
        }
    }

    pub fn conf(&self) -> &LaunchConfig {
        &self.conf
    }

    /// `args` excludes argv\[0\]
    pub fn run(&self, args: Vec<OsString>) -> Result<ExitStatus, LaunchError> {
        let args = self.prepare(args)?;
        let env = ChildEnv::new(&self.conf, self.inherited_env.iter().cloned());

        self.supervisor
            .supervise(&self.conf.engine_binary(), &args, &env)
    }

    /// Everything up to exec: returns the engine's arguments.
    pub fn prepare(&self, args: Vec<OsString>) -> Result<Vec<OsString>, LaunchError> {
        if let Some(banner) = version_banner(&args) {
            eprintln!("{banner}");
        }

        // before unpacking, an upgrade has to remove the engine first
        let args = args::rewrite(&self.conf, args)?;

        let target = self.conf.target_dir();
        fs::create_dir_all(target).map_err(LaunchError::fs("create", target))?;
        ensure_runtime_dir(self.conf.runtime_dir())?;

        let install =
            assets::ensure_assets(target, MANIFEST, self.conf.payload(), &self.unpacker)?;
        if install == Install::Unpacked {
            let patched = patch::ensure_configs(&self.conf)?;
            debug!("{patched:?}");
        }

        Ok(args)
    }
}

/// Our own version line, printed ahead of the engine's `version` output
pub fn version_banner(args: &[OsString]) -> Option<String> {
    (args.first().map(OsString::as_os_str) == Some(OsStr::new(VERSION)))
        .then(|| format!("Launcher:     {}", env!("CARGO_PKG_VERSION")))
}

/// The engine refuses to start without it. Never removed by us.
///
/// The namespace directory above it is shared by every user of the scratch
/// directory, so whoever creates it makes it sticky and world writable like
/// `/tmp`. The per-uid directory itself is private.
fn ensure_runtime_dir(path: &Path) -> Result<(), LaunchError> {
    if let Some(namespace) = path.parent() {
        if let Some(scratch) = namespace.parent() {
            fs::create_dir_all(scratch).map_err(LaunchError::fs("create", scratch))?;
        }

        // umask applies to the mkdir, so set the mode afterwards
        if create_dir(namespace, 0o777)? {
            fs::set_permissions(namespace, fs::Permissions::from_mode(0o1777))
                .map_err(LaunchError::fs("chmod", namespace))?;
        }
    }

    create_dir(path, 0o700)?;
    Ok(())
}

/// Whether the directory was created by us
fn create_dir(path: &Path, mode: u32) -> Result<bool, LaunchError> {
    match DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => Ok(false),
        Err(e) => Err(LaunchError::fs("create", path)(e)),
    }
}

/// What the launcher should exit with to look like the engine did
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_runtime_dir, exit_code, version_banner, Launcher};
    use crate::{
        assets::tests::FakeBundle,
        config::{LaunchConfig, Payload},
        error::LaunchError,
        patch::render_containers_conf,
        supervise::{
            reap::tests::{Recorder, Table},
            Supervisor,
        },
    };
    use std::{
        borrow::Cow,
        ffi::OsString,
        fs,
        os::unix::{fs::PermissionsExt, process::ExitStatusExt},
        path::Path,
        process::ExitStatus,
    };

    type TestLauncher = Launcher<FakeBundle, Table, Recorder>;

    fn launcher(root: &Path, env: Vec<(OsString, OsString)>) -> TestLauncher {
        let conf = LaunchConfig::new(
            root.join("target"),
            root.join("tmp"),
            1000,
            Payload::Bytes(Cow::Borrowed(b"payload")),
        );
        let supervisor = Supervisor::new(Table::default(), Recorder::default());
        Launcher::with_parts(conf, FakeBundle::new(), supervisor, env)
    }

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn first_run_installs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path(), vec![]);
        let conf = launcher.conf();

        let args = launcher.prepare(os(&["pull", "alpine"])).unwrap();

        assert_eq!(launcher.unpacker.calls.get(), 1);
        assert!(conf.engine_binary().is_file());
        assert_eq!(
            fs::read_to_string(conf.containers_conf()).unwrap(),
            render_containers_conf(conf.target_dir(), conf.runtime_dir())
        );
        assert!(fs::read_to_string(conf.storage_conf())
            .unwrap()
            .contains(&format!("{}/lib/containers", conf.target_dir().display())));

        let mode = fs::metadata(conf.runtime_dir()).unwrap().permissions().mode();
        assert!(conf.runtime_dir().is_dir());
        assert_eq!(mode & 0o777, 0o700);
        let namespace = conf.runtime_dir().parent().unwrap();
        let mode = fs::metadata(namespace).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o1777);

        assert_eq!(args[4], "pull");
        assert_eq!(args[5], "--signature-policy");
        assert_eq!(args[6], conf.policy_json().as_os_str());
    }

    #[test]
    fn later_runs_touch_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path(), vec![]);
        let conf = launcher.conf();

        launcher.prepare(os(&["ps"])).unwrap();
        fs::write(conf.containers_conf(), "# tuned by hand\n").unwrap();

        launcher.prepare(os(&["ps"])).unwrap();

        assert_eq!(launcher.unpacker.calls.get(), 1);
        assert_eq!(
            fs::read_to_string(conf.containers_conf()).unwrap(),
            "# tuned by hand\n"
        );
    }

    #[test]
    fn upgrade_reinstalls_but_keeps_configs() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path(), vec![]);
        let conf = launcher.conf();

        launcher.prepare(os(&["ps"])).unwrap();
        fs::write(conf.containers_conf(), "# tuned by hand\n").unwrap();

        let args = launcher.prepare(os(&["upgrade"])).unwrap();

        assert_eq!(launcher.unpacker.calls.get(), 2);
        assert!(conf.engine_binary().is_file());
        assert_eq!(args.last(), Some(&OsString::from("info")));
        assert_eq!(
            fs::read_to_string(conf.containers_conf()).unwrap(),
            "# tuned by hand\n"
        );
    }

    #[test]
    fn missing_payload_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let conf = LaunchConfig::new(
            dir.path().join("target"),
            dir.path().join("tmp"),
            0,
            Payload::Missing,
        );
        let supervisor = Supervisor::new(Table::default(), Recorder::default());
        let launcher = Launcher::with_parts(conf, FakeBundle::new(), supervisor, vec![]);

        let err = launcher.prepare(os(&["ps"])).unwrap_err();
        assert!(matches!(err, LaunchError::NoPayload));
    }

    #[test]
    fn runs_the_installed_engine() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("argv");
        let env = vec![(OsString::from("OUT"), out.clone().into_os_string())];
        let launcher = launcher(dir.path(), env);
        let conf = launcher.conf();

        launcher.prepare(os(&["ps"])).unwrap();

        // stand-in engine that records what it was given
        let engine = conf.engine_binary();
        fs::write(
            &engine,
            "#!/bin/sh\nprintf '%s\\n' \"$@\" \"$XDG_RUNTIME_DIR\" > \"$OUT\"\nexit 4\n",
        )
        .unwrap();
        fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();

        let status = launcher.run(os(&["run", "--rm", "alpine"])).unwrap();
        assert_eq!(exit_code(status), 4);

        let recorded = fs::read_to_string(out).unwrap();
        let lines: Vec<_> = recorded.lines().collect();
        let storage_root = conf.storage_root().display().to_string();
        let run_root = conf.run_root().display().to_string();
        let policy = conf.policy_json().display().to_string();
        let runtime = conf.runtime_dir().display().to_string();
        assert_eq!(
            lines,
            [
                "--root",
                storage_root.as_str(),
                "--runroot",
                run_root.as_str(),
                "run",
                "--signature-policy",
                policy.as_str(),
                "--rm",
                "alpine",
                runtime.as_str(),
            ]
        );
        assert_eq!(launcher.unpacker.calls.get(), 1);
    }

    #[test]
    fn existing_namespace_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let namespace = dir.path().join("podman-static");
        fs::create_dir(&namespace).unwrap();
        fs::set_permissions(&namespace, fs::Permissions::from_mode(0o755)).unwrap();
        let runtime = namespace.join("1000");

        ensure_runtime_dir(&runtime).unwrap();
        ensure_runtime_dir(&runtime).unwrap();

        let mode = fs::metadata(&namespace).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o755);
        let mode = fs::metadata(&runtime).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn version_banner_only_for_version() {
        let banner = version_banner(&os(&["version"])).unwrap();
        assert_eq!(
            banner,
            format!("Launcher:     {}", env!("CARGO_PKG_VERSION"))
        );

        assert_eq!(version_banner(&os(&["version", "--format", "json"])), Some(banner));
        assert_eq!(version_banner(&os(&["ps", "version"])), None);
        assert_eq!(version_banner(&os(&["--version"])), None);
        assert_eq!(version_banner(&[]), None);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // killed by SIGKILL
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }
}
