use std::{io, path::PathBuf};

use crate::assets::UnpackError;

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("missing dependency {0}")]
    MissingDependency(&'static str),
    #[error("HOME is not set and no target directory override was given")]
    NoHome,
    #[error("no asset payload available, set {}", crate::config::ASSETS_VAR)]
    NoPayload,
    #[error("failed to {action} {}", path.display())]
    Fs {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to unpack assets into {}", path.display())]
    Unpack {
        path: PathBuf,
        #[source]
        source: UnpackError,
    },
    #[error("failed to start {}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for {}", program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to scan process table {}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    /// Wraps an io error with what we were doing and where.
    pub(crate) fn fs(
        action: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| LaunchError::Fs {
            action,
            path,
            source,
        }
    }
}
