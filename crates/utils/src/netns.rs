//! Network namespace execution primitive.
//!
//! `setns(2)` with `CLONE_NEWNET` only affects the calling OS thread. Instead of
//! pinning and restoring a shared thread, every switch gets a dedicated thread
//! that enters the namespace, runs the closure to completion and exits, so no
//! other work ever observes the swapped namespace. Child processes spawned from
//! the closure inherit the namespace of that thread.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::thread;

use nix::sched::setns;
use nix::sched::CloneFlags;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetNsError {
    #[error("failed to open netns {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to enter netns {path:?}: {source}")]
    Enter { path: PathBuf, source: nix::Error },

    #[error("failed to spawn netns worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("netns worker thread for {path:?} panicked")]
    WorkerPanicked { path: PathBuf },
}

/// A network namespace operations can be scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetNs {
    /// The namespace of the calling thread, closures run inline.
    Current,
    /// A namespace handle such as `/var/run/netns/cni-1234` or `/proc/<pid>/ns/net`.
    Path(PathBuf),
}

impl NetNs {
    /// The namespace of the process main thread.
    ///
    /// Captured once at startup so work scheduled on any thread targets the
    /// namespace the operator was launched in.
    pub fn main_thread() -> Self {
        let pid = std::process::id();
        NetNs::Path(PathBuf::from(format!("/proc/{pid}/task/{pid}/ns/net")))
    }

    pub fn from_path<P: Into<PathBuf>>(path: P) -> Self {
        NetNs::Path(path.into())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            NetNs::Current => None,
            NetNs::Path(path) => Some(path),
        }
    }

    /// Whether the namespace handle is still there. `Current` always exists.
    pub fn exists(&self) -> bool {
        self.path().map(Path::exists).unwrap_or(true)
    }

    /// Runs `f` with the calling context switched into this namespace.
    pub fn run<F, T>(&self, f: F) -> Result<T, NetNsError>
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        let path = match self {
            NetNs::Current => return Ok(f()),
            NetNs::Path(path) => path,
        };

        let handle = File::open(path).map_err(|source| NetNsError::Open {
            path: path.clone(),
            source,
        })?;

        thread::scope(|scope| {
            let worker = thread::Builder::new()
                .name("netns".to_string())
                .spawn_scoped(scope, move || {
                    setns(&handle, CloneFlags::CLONE_NEWNET).map_err(|source| {
                        NetNsError::Enter {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    Ok(f())
                })
                .map_err(NetNsError::Spawn)?;

            worker.join().map_err(|_| NetNsError::WorkerPanicked {
                path: path.clone(),
            })?
        })
    }
}

impl fmt::Display for NetNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetNs::Current => write!(f, "current"),
            NetNs::Path(path) => write!(f, "{}", path.display()),
        }
    }
}
