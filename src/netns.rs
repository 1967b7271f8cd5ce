//! Network namespace handles.
//!
//! `setns(2)` changes the namespace of the calling *thread* only. Work that
//! has to happen inside a container namespace therefore runs on a dedicated
//! OS thread that enters the namespace, does its work and exits. The thread
//! is never returned to a pool, so no other task can observe the changed
//! namespace, and the async runtime's own threads never leave the host
//! namespace.
//!
//! ```text
//!   runtime thread ──run(f)──▶ spawn "netns" thread
//!                                 │ setns(fd, CLONE_NEWNET)
//!                                 │ f()
//!                                 ▼ exit (namespace dies with the thread)
//!   runtime thread ◀──oneshot── result
//! ```

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// An open network namespace.
///
/// The file descriptor is closed when the handle is dropped, on every exit
/// path of the operation that opened it.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    /// Opens the namespace at `path`.
    ///
    /// A missing path yields [`Error::NamespaceNotFound`] so callers can tell
    /// a vanished sandbox apart from a namespace they cannot access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NamespaceNotFound(path.clone())
            } else {
                Error::NamespaceUnavailable {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            }
        })?;
        debug!(path = %path.display(), "Opened network namespace");
        Ok(Self { path, file })
    }

    /// Returns the namespace path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` on a fresh thread inside this namespace.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let file = self.file.try_clone().map_err(|e| Error::NamespaceUnavailable {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let path = self.path.clone();
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("netns".to_string())
            .spawn(move || {
                let result = setns(&file, CloneFlags::CLONE_NEWNET)
                    .map_err(|e| Error::NamespaceUnavailable {
                        path,
                        reason: format!("setns failed: {e}"),
                    })
                    .and_then(|()| f());
                let _ = tx.send(result);
            })
            .map_err(|e| Error::Internal(format!("failed to spawn namespace thread: {e}")))?;

        rx.await
            .map_err(|_| Error::Internal("namespace thread terminated without a result".to_string()))?
    }
}

/// Path of the calling process's network namespace.
///
/// Refers to the thread group leader, which never leaves the host
/// namespace, so it is valid from inside a namespace thread as well.
pub fn host_netns_path() -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/net", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_namespace() {
        let err = NetNs::open("/nonexistent/netns/path").unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_open_keeps_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let ns = NetNs::open(file.path()).unwrap();
        assert_eq!(ns.path(), file.path());
    }

    #[test]
    fn test_host_netns_path_names_this_process() {
        let path = host_netns_path();
        assert!(path
            .to_string_lossy()
            .contains(&std::process::id().to_string()));
    }
}
