//! Socket path naming and filesystem preparation.
//!
//! A server named `name` listens on `<prefix>.<name>`. Each client listens for
//! the server's reverse dial on `<prefix>.<name><postfix>`, where the postfix is
//! unique within the host (`<pid>-<counter>`).

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Conservative `sun_path` limit (104 bytes on macOS, 108 on Linux).
pub const MAX_SOCKET_PATH: usize = 104;

/// Errors raised while preparing a socket path.
#[derive(Debug, Error)]
pub enum PathError {
    /// The path does not fit in `sun_path`.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    TooLong {
        /// Offending path.
        path: String,
        /// Its length in bytes.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Filesystem failure.
    #[error("{action} {path}: {source}")]
    Io {
        /// What was attempted.
        action: &'static str,
        /// Path involved.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Path of the server's command socket.
pub fn server_socket_path(prefix: &str, name: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.{name}"))
}

/// Path of a client's reverse (message) socket.
pub fn reverse_socket_path(prefix: &str, name: &str, postfix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.{name}{postfix}"))
}

/// Next host-unique postfix for this process.
pub fn next_postfix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{seq}", std::process::id())
}

/// Reject paths that would not fit in a `sockaddr_un`.
pub fn validate_socket_path(path: &Path) -> Result<(), PathError> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        return Err(PathError::TooLong {
            path: path.display().to_string(),
            len,
            max: MAX_SOCKET_PATH - 1,
        });
    }
    Ok(())
}

/// Validate the path, remove a stale socket file and create the parent directory.
pub fn prepare_socket_path(path: &Path) -> Result<(), PathError> {
    validate_socket_path(path)?;

    if path.exists() {
        log::debug!("Removing stale socket {}", path.display());
        fs::remove_file(path).map_err(|source| PathError::Io {
            action: "Failed to remove stale socket",
            path: path.display().to_string(),
            source,
        })?;
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PathError::Io {
            action: "Failed to create socket directory",
            path: parent.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Apply permission bits to a freshly bound socket file.
pub fn apply_socket_mode(path: &Path, mode: u32) -> Result<(), PathError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| PathError::Io {
        action: "Failed to set permissions on",
        path: path.display().to_string(),
        source,
    })
}

/// Remove a socket file, ignoring "not found".
pub fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove socket {}: {e}", path.display()),
    }
}
