//! Startup guard
//!
//! Runs once, strictly before any window or protected content exists.
//! Launch arguments are checked first, then either the dev bypass applies or
//! the integrity chain runs: entry module, archive presence, recomputed
//! digest against the anchor carried in from the startup artifact. Every
//! failure is all-or-nothing; there is no degraded mode.

use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::{self, ContentKey};

/// Launch-argument substrings that force immediate termination
pub const BLOCKED_ARG_MARKERS: [&str; 3] = ["--inspect", "--remote-debugging-port", "--proxy"];

/// Environment value carrying the dev content URL. The same value decides
/// how the window loads its content, so clearing it to skip verification
/// also breaks content loading.
pub const DEV_SERVER_ENV: &str = "SHROUD_DEV_SERVER_URL";

/// Scheme prefix the dev value must carry to count as a dev environment
pub const DEV_SCHEME_PREFIX: &str = "http://";

/// Fatal startup failures, in the order they are checked
#[derive(Error, Debug)]
pub enum GuardError {
    /// A debugger/inspector/proxy argument was passed at launch
    #[error("Launch rejected: argument not permitted ({arg})")]
    ArgumentRejected { arg: String },

    /// The running module was not loaded by the designated entry module
    #[error("Application entry point is abnormal")]
    EntryTampered,

    /// The application package is not at its install location
    #[error("Application package is missing: {path}")]
    ArchiveMissing { path: PathBuf },

    /// The package exists but could not be read for digesting
    #[error("Application package could not be read: {path} ({reason})")]
    ArchiveUnreadable { path: PathBuf, reason: String },

    /// No anchor reached the process; the startup artifact is absent or
    /// replaced by a default one
    #[error("Application package anchor is missing")]
    AnchorMissing,

    /// The recomputed package digest disagrees with the embedded anchor
    #[error("Application package integrity check failed")]
    DigestMismatch { expected: String, actual: String },
}

/// Successful guard outcomes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Integrity verified against the anchor
    Pass,
    /// Dev environment; verification skipped
    DevBypass,
}

/// Anchor carried into the process. The value is injected as a compile-time
/// constant, the build-time analog of substituting it into the startup
/// artifact's source before compiling it; runtime code can only read it.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    anchor: Option<String>,
}

impl VerificationContext {
    /// Context backed by the constant injected at build time via the
    /// `SHROUD_PACKAGE_ANCHOR` compile-time environment value.
    pub fn from_embedded() -> Self {
        VerificationContext {
            anchor: option_env!("SHROUD_PACKAGE_ANCHOR").map(str::to_string),
        }
    }

    /// Context with an explicit anchor (hosts that load the startup
    /// artifact themselves, and tests)
    pub fn with_anchor(anchor: impl Into<String>) -> Self {
        VerificationContext {
            anchor: Some(anchor.into()),
        }
    }

    /// Context with no anchor present
    pub fn empty() -> Self {
        VerificationContext { anchor: None }
    }

    pub fn anchor(&self) -> Option<&str> {
        self.anchor.as_deref()
    }
}

/// Host-shell facts the guard cannot derive itself
pub trait HostEnv {
    /// Whether the running module's parent is the designated process entry
    /// module. Loading through any other entry is sideloading.
    fn entry_module_is_designated(&self) -> bool;
}

/// Startup guard over one process launch
pub struct StartupGuard<'a> {
    args: &'a [String],
    dev_server_url: Option<String>,
    host: &'a dyn HostEnv,
    archive_path: PathBuf,
    key: &'a ContentKey,
}

impl<'a> StartupGuard<'a> {
    pub fn new(
        args: &'a [String],
        dev_server_url: Option<String>,
        host: &'a dyn HostEnv,
        archive_path: PathBuf,
        key: &'a ContentKey,
    ) -> Self {
        StartupGuard {
            args,
            dev_server_url,
            host,
            archive_path,
            key,
        }
    }

    /// Run the state machine: argument check, then dev bypass or the
    /// integrity chain. The argument scan happens before anything else —
    /// no filesystem access precedes it.
    pub fn evaluate(&self, ctx: &VerificationContext) -> Result<Verdict, GuardError> {
        self.check_arguments()?;

        if self.is_dev_environment() {
            info!("Dev environment detected; integrity check skipped");
            return Ok(Verdict::DevBypass);
        }

        self.check_integrity(ctx)?;
        Ok(Verdict::Pass)
    }

    fn check_arguments(&self) -> Result<(), GuardError> {
        for arg in self.args {
            for marker in BLOCKED_ARG_MARKERS {
                if arg.contains(marker) {
                    return Err(GuardError::ArgumentRejected { arg: arg.clone() });
                }
            }
        }
        Ok(())
    }

    /// Dev only when the value is present and carries the network-scheme
    /// prefix. Checking the prefix (not mere presence) stops an attacker
    /// from flipping the value to skip verification without also breaking
    /// how the window loads content.
    fn is_dev_environment(&self) -> bool {
        self.dev_server_url
            .as_deref()
            .is_some_and(|url| url.starts_with(DEV_SCHEME_PREFIX))
    }

    fn check_integrity(&self, ctx: &VerificationContext) -> Result<(), GuardError> {
        if !self.host.entry_module_is_designated() {
            return Err(GuardError::EntryTampered);
        }

        if !self.archive_path.exists() {
            return Err(GuardError::ArchiveMissing {
                path: self.archive_path.clone(),
            });
        }

        let digest = crypto::digest_file(&self.archive_path).map_err(|err| {
            GuardError::ArchiveUnreadable {
                path: self.archive_path.clone(),
                reason: format!("{err:#}"),
            }
        })?;

        let anchor = ctx.anchor().ok_or(GuardError::AnchorMissing)?;

        let actual = crypto::seal_digest(self.key, &digest).map_err(|err| {
            GuardError::ArchiveUnreadable {
                path: self.archive_path.clone(),
                reason: format!("{err:#}"),
            }
        })?;

        if actual != anchor {
            debug!("Anchor comparison failed: expected {anchor}, recomputed {actual}");
            return Err(GuardError::DigestMismatch {
                expected: anchor.to_string(),
                actual,
            });
        }

        debug!("Package digest matches embedded anchor");
        Ok(())
    }
}

/// Evaluate the guard and terminate the process on any failure, after
/// surfacing the fatal message. Hosts with their own dialog plumbing should
/// call [`StartupGuard::evaluate`] and present the error themselves.
pub fn enforce(guard: &StartupGuard<'_>, ctx: &VerificationContext) -> Verdict {
    match guard.evaluate(ctx) {
        Ok(verdict) => verdict,
        Err(err) => {
            tracing::error!(target: "security", "STARTUP ABORTED: {err}");
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
