//! Privilege elevation for firewall tooling
//!
//! fwconverge may run as an unprivileged user and only elevates for the
//! commands that read or change the live rule store:
//!
//! - **iptables / ip6tables / ebtables** and their `-save` counterparts
//! - **install**: writing a saved rule set to its durable location
//! - the configured persist command, if one is used
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `FWCONVERGE_ELEVATION_METHOD`: force `sudo`, `run0`, or `pkexec`.
//!   Useful for scripts with sudoers NOPASSWD rules.
//!   Example: `FWCONVERGE_ELEVATION_METHOD=sudo fwconverge apply site.json`
//!
//! - `FWCONVERGE_TEST_NO_ELEVATION`: run commands directly (testing only).
//!
//! # Security
//!
//! - Commands are constructed as argument vectors, never through a shell
//! - Callers decide which programs may be elevated (see
//!   [`SystemRunner`](crate::core::backend::SystemRunner))
//!
//! # Example
//!
//! ```no_run
//! use fwconverge::elevation::create_elevated_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_command("iptables-save", &[])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FWCONVERGE_ELEVATION_METHOD`
    #[error("Invalid FWCONVERGE_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ElevationError> for io::Error {
    fn from(e: ElevationError) -> Self {
        match e {
            ElevationError::Io(inner) => inner,
            ElevationError::PkexecNotFound | ElevationError::MethodNotAvailable(_) => {
                io::Error::new(io::ErrorKind::NotFound, e.to_string())
            }
            ElevationError::InvalidMethod(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
        }
    }
}

/// Checks if a binary exists in PATH (or at the given path, if it has a slash)
pub(crate) fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Helper used to run a command as root
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    Run0,
    Sudo,
    Pkexec,
}

impl ElevationMethod {
    fn binary(self) -> &'static str {
        match self {
            Self::Run0 => "run0",
            Self::Sudo => "sudo",
            Self::Pkexec => "pkexec",
        }
    }

    fn command(self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(self.binary());
        cmd.arg(program).args(args);
        cmd
    }
}

/// Picks the elevation helper, or `None` when commands should run directly.
///
/// # Errors
///
/// Returns `Err` if `FWCONVERGE_ELEVATION_METHOD` names an unknown or missing
/// helper, or if no helper can be found.
pub fn select_method() -> Result<Option<ElevationMethod>, ElevationError> {
    use std::os::fd::AsFd;

    if std::env::var("FWCONVERGE_TEST_NO_ELEVATION").is_ok() || nix::unistd::getuid().is_root() {
        return Ok(None);
    }

    if let Ok(forced) = std::env::var("FWCONVERGE_ELEVATION_METHOD")
        && !forced.is_empty()
    {
        let method: ElevationMethod = forced
            .parse()
            .map_err(|_| ElevationError::InvalidMethod(forced.to_lowercase()))?;
        if !binary_exists(method.binary()) {
            return Err(ElevationError::MethodNotAvailable(method.to_string()));
        }
        return Ok(Some(method));
    }

    if binary_exists("run0") {
        return Ok(Some(ElevationMethod::Run0));
    }
    if nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false) {
        return Ok(Some(ElevationMethod::Sudo));
    }
    if binary_exists("pkexec") {
        Ok(Some(ElevationMethod::Pkexec))
    } else {
        Err(ElevationError::PkexecNotFound)
    }
}

/// Builds a command that runs `program` with root privileges.
///
/// Preference order: a forced method, then `run0`, then `sudo` on a
/// terminal, then `pkexec`. Set `FWCONVERGE_TEST_NO_ELEVATION=1` to run
/// `program` directly.
///
/// # Errors
///
/// See [`select_method`].
pub fn create_elevated_command(program: &str, args: &[String]) -> Result<Command, ElevationError> {
    Ok(match select_method()? {
        Some(method) => method.command(program, args),
        None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    })
}
