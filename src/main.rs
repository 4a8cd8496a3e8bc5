use anyhow::Context;
use podman_launcher::{assets::Tar, exit_code, LaunchConfig, Launcher, Payload};
use std::{env, process::exit};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_VAR: &str = "PODMAN_LAUNCHER_LOG";

fn main() {
    // stderr only, stdout belongs to the engine
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_VAR)
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let tar = match Tar::locate() {
        Ok(tar) => tar,
        Err(e) => {
            eprintln!("{e}");
            exit(127);
        }
    };

    match run(tar) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("Error: {e:?}");
            exit(1);
        }
    }
}

fn run(tar: Tar) -> anyhow::Result<i32> {
    let var = |key: &str| env::var_os(key);

    let uid = nix::unistd::getuid().as_raw();
    let conf = LaunchConfig::from_env(var, uid, Payload::from_env(var))
        .context("failed to resolve install directories")?;

    let launcher = Launcher::new(conf, tar, env::vars_os().collect());
    let status = launcher
        .run(env::args_os().skip(1).collect())
        .context("failed to run podman")?;

    Ok(exit_code(status))
}
