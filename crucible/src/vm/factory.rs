//! Provisioning of fresh microVMs.
//!
//! One call to [`create`] yields a booted VMM with a writable rootfs copy
//! and its own network lease. No guarantee is made about the in-guest
//! agent here; callers gate on [`super::VmHandle::wait_ready`].

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::machine::Machine;
use super::{network, scratch_rootfs_path, VmError, VmHandle};
use crate::config;

pub(crate) fn base_rootfs_path(dir: &Path, language: &str) -> PathBuf {
    dir.join(format!("rootfs-{language}.ext4"))
}

fn ensure_base_rootfs(dir: &Path, language: &str) -> Result<PathBuf, VmError> {
    let base = base_rootfs_path(dir, language);
    if base.is_file() {
        Ok(base)
    } else {
        Err(VmError::UnknownLanguage(language.to_owned()))
    }
}

/// Streaming copy so multi-hundred-MiB images never sit in memory, with a
/// final sync so the VMM reads fully-flushed data.
async fn copy_rootfs(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut reader = tokio::fs::File::open(src).await?;
    let mut writer = tokio::fs::File::create(dst).await?;
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.sync_all().await
}

fn preflight_binary(path: &Path) -> Result<(), VmError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(VmError::BinaryMissing(path.to_owned()))
        }
        Err(err) => return Err(VmError::VmmStart(format!("stat binary {path:?}: {err}"))),
    };
    if meta.is_dir() {
        return Err(VmError::BinaryIsDirectory(path.to_owned()));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(VmError::BinaryNotExecutable(path.to_owned()));
    }
    Ok(())
}

/// Provision and boot one VM for `language`. On success the VMM process is
/// alive and holds a leased IP; on failure nothing provisioned along the
/// way is left behind.
pub async fn create(parent: &CancellationToken, language: &str) -> Result<VmHandle, VmError> {
    let cfg = config::get();
    let vm_id = Uuid::now_v7().to_string();

    let base = ensure_base_rootfs(&cfg.rootfs_dir, language)?;

    let scratch = scratch_rootfs_path(&vm_id);
    copy_rootfs(&base, &scratch)
        .await
        .map_err(|source| VmError::RootfsPrep {
            path: scratch.clone(),
            source,
        })?;

    if let Err(err) = preflight_binary(&cfg.firecracker_binary) {
        let _ = tokio::fs::remove_file(&scratch).await;
        return Err(err);
    }

    let lease = match network::attach(&vm_id).await {
        Ok(lease) => lease,
        Err(err) => {
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(err);
        }
    };

    let token = parent.child_token();
    let machine = match Machine::create(&vm_id, scratch.clone(), lease.clone(), &token).await {
        Ok(machine) => machine,
        Err(err) => {
            token.cancel();
            abort_provisioning(&vm_id, &scratch).await;
            return Err(err);
        }
    };

    if let Err(err) = machine.start().await {
        token.cancel();
        // kill_on_drop reaps the spawned VMM with the handle
        drop(machine);
        abort_provisioning(&vm_id, &scratch).await;
        return Err(err);
    }

    tracing::info!(ip = %lease.ip, language, %vm_id, "machine started");

    Ok(VmHandle {
        id: vm_id,
        ip: lease.ip,
        token,
        machine,
    })
}

async fn abort_provisioning(vm_id: &str, scratch: &Path) {
    if let Err(err) = network::detach(vm_id).await {
        tracing::debug!(err = %format!("{err:#}"), "network teardown after failed start");
    }
    let _ = tokio::fs::remove_file(scratch).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_rootfs_path_follows_the_naming_scheme() {
        assert_eq!(
            base_rootfs_path(Path::new("agent"), "python").to_string_lossy(),
            "agent/rootfs-python.ext4"
        );
    }

    #[test]
    fn missing_rootfs_means_unknown_language() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rootfs-python.ext4"), b"img").unwrap();

        assert!(ensure_base_rootfs(dir.path(), "python").is_ok());
        assert!(matches!(
            ensure_base_rootfs(dir.path(), "cobol"),
            Err(VmError::UnknownLanguage(lang)) if lang == "cobol"
        ));
    }

    #[test]
    fn preflight_rejects_a_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firecracker");
        assert!(matches!(
            preflight_binary(&path),
            Err(VmError::BinaryMissing(_))
        ));
    }

    #[test]
    fn preflight_rejects_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            preflight_binary(dir.path()),
            Err(VmError::BinaryIsDirectory(_))
        ));
    }

    #[test]
    fn preflight_rejects_a_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firecracker");
        std::fs::write(&path, b"#!/bin/sh").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            preflight_binary(&path),
            Err(VmError::BinaryNotExecutable(_))
        ));
    }

    #[test]
    fn preflight_accepts_an_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firecracker");
        std::fs::write(&path, b"#!/bin/sh").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        preflight_binary(&path).unwrap();
    }

    #[tokio::test]
    async fn rootfs_copies_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("rootfs-python.ext4");
        let dst = dir.path().join("copy.ext4");
        std::fs::write(&src, b"not really ext4").unwrap();

        copy_rootfs(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"not really ext4");
    }
}
