use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

mod agent;
mod config;
mod job;
mod pool;
mod queue;
mod vm;

use job::Job;
use pool::VmPoolManager;
use queue::JobQueue;

#[tokio::main]
async fn main() -> Result<()> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt::fmt()
            .with_span_events(FmtSpan::ACTIVE)
            .with_max_level(Level::DEBUG)
            .finish(),
    )
    .expect("Could not install tracing subscriber");

    let cfg = config::get();
    delete_stale_sockets(&std::env::temp_dir(), std::process::id());

    let languages = pool::discover_languages(&cfg.rootfs_dir)?;
    tracing::info!(?languages, "Discovered available languages");

    let root = CancellationToken::new();
    let pools: Arc<VmPoolManager> = Arc::new(VmPoolManager::new());
    for language in &languages {
        pools.add_pool(language, cfg.vm.pool_size);
        let pool = pools.get_pool(language)?;
        tokio::spawn(pool::fill_language_pool(
            root.child_token(),
            language.clone(),
            pool,
        ));
    }

    let queue = Arc::new(JobQueue::connect(&cfg.nats_url).await?);
    let mut jobs = queue.subscribe_jobs().await?;

    tracing::info!("Waiting for NATS jobs...");
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                tracing::info!("Caught interrupt, requesting clean shutdown");
                break;
            }
            msg = jobs.next() => {
                let Some(msg) = msg else {
                    tracing::warn!("Job subscription closed");
                    break;
                };
                let job: Job = match serde_json::from_slice(&msg.payload) {
                    Ok(job) => job,
                    Err(err) => {
                        tracing::error!(%err, "Received invalid job");
                        continue;
                    }
                };
                tracing::info!(job = %job.id, language = %job.language, "Received a job");
                tokio::spawn(job.run(
                    Arc::clone(&queue),
                    Arc::clone(&pools),
                    root.child_token(),
                ));
            }
        }
    }

    root.cancel();
    pools.shutdown().await;
    delete_stale_sockets(&std::env::temp_dir(), std::process::id());

    Ok(())
}

/// Sweep control sockets (and their log siblings) left over from this pid.
/// Runs at startup and again on the way out.
fn delete_stale_sockets(temp_dir: &Path, pid: u32) {
    let prefix = format!(".firecracker.sock-{pid}-");
    let entries = match std::fs::read_dir(temp_dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!(%err, "Failed to read temp directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }

        let full = temp_dir.join(name);
        if let Err(err) = std::fs::remove_file(&full) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(%err, path = %full.display(), "Failed to remove leftover file");
            }
        }
        if !name.ends_with(".log") {
            let log = temp_dir.join(format!("{name}.log"));
            if let Err(err) = std::fs::remove_file(&log) {
                if err.kind() != ErrorKind::NotFound {
                    tracing::debug!(%err, path = %log.display(), "Failed to remove leftover log");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_sockets_for_this_pid_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let mine = format!(".firecracker.sock-{}-vm1", std::process::id());
        let mine_log = format!("{mine}.log");
        std::fs::write(dir.path().join(&mine), b"").unwrap();
        std::fs::write(dir.path().join(&mine_log), b"").unwrap();
        std::fs::write(dir.path().join(".firecracker.sock-99999-vm2"), b"").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"").unwrap();

        delete_stale_sockets(dir.path(), std::process::id());

        assert!(!dir.path().join(&mine).exists());
        assert!(!dir.path().join(&mine_log).exists());
        // other pids' sockets and unrelated files are left alone
        assert!(dir.path().join(".firecracker.sock-99999-vm2").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn sweeping_a_missing_directory_is_harmless() {
        delete_stale_sockets(Path::new("/definitely/not/here"), 1);
    }
}
