use std::{
    ffi::{OsStr, OsString},
    fs, io,
    path::Path,
};
use tracing::{debug, info};

use crate::{config::LaunchConfig, error::LaunchError};

/// Pseudo-command: drop the installed engine so this run re-unpacks
pub const UPGRADE: &str = "upgrade";
/// Pseudo-command: also print the launcher's own version
pub const VERSION: &str = "version";
/// Harmless command that replaces an `upgrade`
pub const INTROSPECTION: &str = "info";

pub const SIGNATURE_POLICY_FLAG: &str = "--signature-policy";

/// Sub-commands that take `--signature-policy`.
///
/// There is no config key for the policy file other than the system-wide
/// /etc/containers/policy.json, so it has to go on the command line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::AsRefStr, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum PolicyCommand {
    Build,
    Create,
    Import,
    Load,
    Pull,
    Push,
    Run,
    Save,
    Play,
}

impl PolicyCommand {
    pub fn from_arg(arg: &OsStr) -> Option<Self> {
        arg.to_str()?.parse().ok()
    }
}

/// Turns the launcher's own arguments (without argv\[0\]) into the engine's.
///
/// Handles `upgrade` (removes the engine binary as a side effect), then puts
/// `--root`/`--runroot` in front and `--signature-policy` after the first
/// sub-command that accepts it. Our flags come first so a user flag with the
/// same name still wins.
pub fn rewrite(conf: &LaunchConfig, args: Vec<OsString>) -> Result<Vec<OsString>, LaunchError> {
    let args = handle_upgrade(conf, args)?;
    let args = engine_args(conf, args);

    debug!("engine args: {:?}", args);
    Ok(args)
}

fn handle_upgrade(
    conf: &LaunchConfig,
    args: Vec<OsString>,
) -> Result<Vec<OsString>, LaunchError> {
    if args.first().map(OsString::as_os_str) != Some(OsStr::new(UPGRADE)) {
        return Ok(args);
    }

    let binary = conf.engine_binary();
    match fs::remove_file(&binary) {
        Ok(()) => info!("removed {} to force a fresh unpack", binary.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(LaunchError::fs("remove", binary)(e)),
    }

    Ok(vec![OsString::from(INTROSPECTION)])
}

fn engine_args(conf: &LaunchConfig, mut args: Vec<OsString>) -> Vec<OsString> {
    if let Some(command) = inject_signature_policy(&mut args, conf.policy_json()) {
        debug!("injected signature policy after {}", command.as_ref());
    }

    let mut out = vec![
        OsString::from("--root"),
        conf.storage_root().into_os_string(),
        OsString::from("--runroot"),
        conf.run_root().into_os_string(),
    ];
    out.extend(args);
    out
}

/// Inserts the policy flag right after the first (by position) argument
/// that names a [`PolicyCommand`]. Only one insertion ever happens.
///
/// Positional and flag-value arguments are not told apart, `--filter pull`
/// counts as a `pull`.
pub fn inject_signature_policy(args: &mut Vec<OsString>, policy: &Path) -> Option<PolicyCommand> {
    let (idx, command) = args
        .iter()
        .enumerate()
        .find_map(|(idx, arg)| PolicyCommand::from_arg(arg).map(|command| (idx, command)))?;

    args.splice(
        idx + 1..idx + 1,
        [
            OsString::from(SIGNATURE_POLICY_FLAG),
            policy.as_os_str().to_os_string(),
        ],
    );

    Some(command)
}
