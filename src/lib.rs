//! Ships a statically linked podman as a self-contained, isolated install.
//!
//! The bundle is unpacked into a private target directory on first run, its
//! configs are rewritten to point only inside that directory, and every
//! invocation is forwarded to the bundled engine with isolated storage flags
//! and environment. Nothing is shared with a podman installed by a package
//! manager.

pub mod args;
pub mod assets;
pub mod config;
pub mod error;
pub mod launcher;
pub mod patch;
pub mod supervise;

pub use config::{LaunchConfig, Payload};
pub use error::LaunchError;
pub use launcher::{exit_code, Launcher};
