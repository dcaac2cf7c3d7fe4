//! MicroVM lifecycle: handles, boot readiness, and teardown.
//!
//! A [`VmHandle`] is owned by exactly one place at a time (a pool slot or
//! the dispatcher currently running a job) and [`VmHandle::shutdown`]
//! consumes it, so every VM is torn down exactly once.

mod factory;
mod machine;
mod network;

pub use factory::create;

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent;

const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(3);
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(7);
const ROOTFS_DELETE_ATTEMPTS: u32 = 30;
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum VmError {
    #[error("no rootfs image for language '{0}'")]
    UnknownLanguage(String),
    #[error("failed to prepare rootfs copy at {path:?}: {source}")]
    RootfsPrep {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("firecracker binary {0:?} does not exist")]
    BinaryMissing(PathBuf),
    #[error("firecracker binary {0:?} is a directory")]
    BinaryIsDirectory(PathBuf),
    #[error("firecracker binary {0:?} is not executable, check its permissions")]
    BinaryNotExecutable(PathBuf),
    #[error("failed to attach VM network: {0}")]
    NetworkSetup(String),
    #[error("failed to start VMM: {0}")]
    VmmStart(String),
    #[error("VM agent not ready before the deadline")]
    BootTimeout,
    #[error("VM scope cancelled")]
    Cancelled,
}

pub struct VmHandle {
    pub id: String,
    pub ip: Ipv4Addr,
    pub(crate) token: CancellationToken,
    pub(crate) machine: machine::Machine,
}

/// Writable rootfs copy for one VM. Always under /tmp, keyed by VM id.
pub(crate) fn scratch_rootfs_path(vm_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/rootfs-{vm_id}.ext4"))
}

impl VmHandle {
    /// Poll the in-guest agent until it answers `/health` with 200. Each
    /// probe has a 1 s budget with 1 s between attempts; the deadline bounds
    /// the whole wait. Cancelling the VM's scope aborts the wait early.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), VmError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(VmError::Cancelled),
            ready = await_agent(self.ip, deadline) => {
                if ready.is_ok() {
                    tracing::info!(ip = %self.ip, "VM agent ready");
                }
                ready
            }
        }
    }

    /// Tear the VM down: graceful stop, bounded wait, force kill, then
    /// remove the socket and the rootfs copy. Every step is best-effort;
    /// a failed step never blocks the ones after it.
    pub async fn shutdown(self) {
        let VmHandle {
            id,
            ip,
            token,
            mut machine,
        } = self;
        let rootfs = scratch_rootfs_path(&id);

        tracing::info!(%ip, vm_id = %id, "stopping VM");
        tracing::debug!(rootfs = %rootfs.display(), socket = %machine.sock_path().display(), "deleting VM resources");

        // 1) try a graceful shutdown first
        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, machine.send_ctrl_alt_del()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(err = %format!("{err:#}"), "Graceful shutdown failed; will force stop if still running")
            }
            Err(_) => {
                tracing::warn!("Graceful shutdown timed out; will force stop if still running")
            }
        }

        // 2) wait for the VMM to exit and release its network attachment
        match tokio::time::timeout(EXIT_WAIT_TIMEOUT, machine.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let msg = format!("{err:#}");
                if is_benign_wait_error(&msg) {
                    tracing::debug!(err = %msg, "Ignoring non-fatal wait error");
                } else {
                    tracing::warn!(err = %msg, "Wait returned error");
                }
            }
            Err(_) => tracing::debug!("Ignoring non-fatal wait error: deadline exceeded"),
        }

        // 3) make sure the VMM is gone
        if let Err(err) = machine.force_stop() {
            tracing::debug!(%err, "Force stop returned error (likely already stopped)");
        }

        // 4) remove the control socket if it still exists
        match tokio::fs::remove_file(machine.sock_path()).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => tracing::error!(%err, "Failed to delete firecracker socket"),
        }

        // 5) the rootfs can stay busy for a moment after the VMM exits
        if let Err(err) = remove_rootfs_with_retry(&rootfs).await {
            tracing::error!(%err, "Failed to delete firecracker rootfs after retries");
        }

        // 6) release anything still scoped to this VM
        token.cancel();
    }
}

/// Retry `/health` until it answers 200 or the deadline passes. Transport
/// errors and non-200 answers both just mean another attempt.
async fn await_agent(ip: Ipv4Addr, deadline: Duration) -> Result<(), VmError> {
    let probing = async {
        loop {
            match agent::ping(ip).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::debug!(%ip, %err, "VM not ready yet");
                    tokio::time::sleep(PROBE_INTERVAL).await;
                }
            }
        }
    };

    tokio::time::timeout(deadline, probing)
        .await
        .map_err(|_| VmError::BootTimeout)
}

/// Errors during the exit wait that the CNI/VMM stack produces in the
/// normal course of a teardown.
fn is_benign_wait_error(msg: &str) -> bool {
    msg.contains("signal: terminated")
        || msg.contains("failed to remove netns parent dir")
        || msg.contains("plugin type=\"tc-redirect-tap\"")
        || msg.contains("CNI network list \"fcnet\"")
        || msg.contains("deadline has elapsed")
}

/// Delete the per-VM rootfs, retrying with linear backoff while the file
/// is busy. A missing file counts as success.
async fn remove_rootfs_with_retry(path: &Path) -> std::io::Result<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match tokio::fs::remove_file(path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) if attempt >= ROOTFS_DELETE_ATTEMPTS => return Err(err),
            Err(err) => {
                tracing::debug!(%err, attempt, "Failed to delete firecracker rootfs");
                tokio::time::sleep(rootfs_retry_delay(attempt)).await;
            }
        }
    }
}

fn rootfs_retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 * u64::from(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_wait_errors_are_recognised() {
        for msg in [
            "firecracker exited abnormally: signal: terminated",
            "failed to remove netns parent dir /var/run/netns",
            "teardown of CNI network list \"fcnet\": plugin type=\"tc-redirect-tap\" failed",
            "delete netns: deadline has elapsed",
        ] {
            assert!(is_benign_wait_error(msg), "expected benign: {msg}");
        }
        assert!(!is_benign_wait_error("firecracker exited with status 1"));
        assert!(!is_benign_wait_error("no such file or directory"));
    }

    #[test]
    fn rootfs_retry_backs_off_linearly() {
        assert_eq!(rootfs_retry_delay(1), Duration::from_millis(100));
        assert_eq!(rootfs_retry_delay(7), Duration::from_millis(700));
        assert_eq!(rootfs_retry_delay(29), Duration::from_millis(2900));
    }

    #[tokio::test]
    async fn rootfs_removal_deletes_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs-x.ext4");
        std::fs::write(&path, b"image").unwrap();

        remove_rootfs_with_retry(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rootfs_removal_treats_a_missing_file_as_done() {
        let dir = tempfile::tempdir().unwrap();
        remove_rootfs_with_retry(&dir.path().join("rootfs-gone.ext4"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn probe_gives_up_at_the_deadline() {
        // TEST-NET-3, nothing will ever answer there
        let ip = Ipv4Addr::new(203, 0, 113, 1);
        let started = std::time::Instant::now();
        let result = await_agent(ip, Duration::from_millis(1500)).await;
        assert!(matches!(result, Err(VmError::BootTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[test]
    fn scratch_rootfs_is_keyed_by_vm_id() {
        assert_eq!(
            scratch_rootfs_path("abc").to_string_lossy(),
            "/tmp/rootfs-abc.ext4"
        );
    }
}
