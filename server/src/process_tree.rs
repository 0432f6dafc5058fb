//! Terminating the server together with everything it spawned.
//!
//! The server forks helper processes (build hosts, analyzers) that do not
//! exit with their parent. On POSIX the tree is discovered from a `ps`
//! snapshot and its descendants are signalled first, then the root; on
//! Windows `taskkill /T` walks it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;

use crate::types::Platform;

pub type TreeFut<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Operating-system view of the process table.
pub trait ProcessTree: Send + Sync {
    /// Every `(parent pid, pid)` pair currently running.
    fn snapshot(&self) -> TreeFut<'_, Vec<(u32, u32)>>;

    /// Ask one process to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forcefully end `pid` and all of its descendants in one step.
    fn kill_tree(&self, pid: u32) -> TreeFut<'_, ()>;
}

/// [`ProcessTree`] backed by `ps`, `kill(2)` and `taskkill`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTree;

impl ProcessTree for SystemProcessTree {
    fn snapshot(&self) -> TreeFut<'_, Vec<(u32, u32)>> {
        Box::pin(async {
            let output = Command::new("ps")
                .args(["-A", "-o", "ppid,pid"])
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                return Err(io::Error::other(format!("ps exited with {}", output.status)));
            }
            Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
        })
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid: libc::pid_t = pid.try_into().map_err(io::Error::other)?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // Already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signals are not available on this platform",
        ))
    }

    fn kill_tree(&self, pid: u32) -> TreeFut<'_, ()> {
        Box::pin(async move {
            let status = Command::new("taskkill")
                .args(["/F", "/T", "/PID"])
                .arg(pid.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await?;
            if status.success() {
                Ok(())
            } else {
                Err(io::Error::other(format!("taskkill exited with {status}")))
            }
        })
    }
}

/// Parse `ps -A -o ppid,pid` output. The header and malformed rows are skipped.
pub(crate) fn parse_ps_output(text: &str) -> Vec<(u32, u32)> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let ppid = cols.next()?.parse().ok()?;
            let pid = cols.next()?.parse().ok()?;
            Some((ppid, pid))
        })
        .collect()
}

/// Descendants of `root` in breadth-first order, excluding `root`.
fn descendants(pairs: &[(u32, u32)], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(ppid, pid) in pairs {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for &child in children.get(&parent).into_iter().flatten() {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// Terminate `root` and its descendants, returning the pids signalled.
///
/// On POSIX every descendant is signalled before the root. Failures on
/// descendants are logged and skipped; only a failure to signal the root
/// is returned.
pub(crate) async fn terminate_tree(
    tree: &dyn ProcessTree,
    platform: Platform,
    root: u32,
) -> io::Result<Vec<u32>> {
    if platform == Platform::Windows {
        tree.kill_tree(root).await?;
        return Ok(vec![root]);
    }

    let pairs = match tree.snapshot().await {
        Ok(pairs) => pairs,
        Err(e) => {
            tracing::warn!(pid = root, "failed to list child processes: {e}");
            Vec::new()
        }
    };

    let mut signalled = Vec::new();
    for pid in descendants(&pairs, root) {
        match tree.terminate(pid) {
            Ok(()) => signalled.push(pid),
            Err(e) => tracing::debug!(pid, "failed to signal child process: {e}"),
        }
    }
    tree.terminate(root)?;
    signalled.push(root);
    Ok(signalled)
}
