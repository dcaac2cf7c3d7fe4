//! Per-language pools of ready VMs, and the fillers that stock them.
//!
//! Each pool is a bounded FIFO channel: fillers block on a full pool, which
//! is the only throttle they need, and dispatchers block on an empty one
//! until a warm VM shows up.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::vm::{self, VmHandle};

pub type VmPoolManager = PoolManager<VmHandle>;

const CREATE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no pool found for language: {0}")]
    NoPoolForLanguage(String),
    #[error("no rootfs images found in {0}")]
    NoLanguages(String),
    #[error("failed to read rootfs directory {path}: {source}")]
    RootfsDirUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pool closed while waiting for a VM")]
    Closed,
}

pub struct Pool<T> {
    tx: async_channel::Sender<T>,
    rx: async_channel::Receiver<T>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Pool<T> {
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Park a value in the pool, waiting while it is full. A closed pool
    /// hands the value back so the caller can dispose of it.
    pub async fn offer(&self, value: T) -> Result<(), T> {
        self.tx.send(value).await.map_err(|err| err.0)
    }

    /// Take the oldest value, waiting while the pool is empty.
    pub async fn take(&self) -> Result<T, PoolError> {
        self.rx.recv().await.map_err(|_| PoolError::Closed)
    }

    /// Non-blocking take, used when draining at shutdown.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn close(&self) {
        self.tx.close();
    }
}

/// Language tag -> pool. Pools are registered during startup only; after
/// that the map is read concurrently and never changes shape.
pub struct PoolManager<T> {
    pools: RwLock<HashMap<String, Pool<T>>>,
}

impl<T> PoolManager<T> {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent: a second registration for the same language is a no-op.
    pub fn add_pool(&self, language: &str, capacity: usize) {
        let mut pools = self.pools.write().expect("pool registry poisoned");
        if !pools.contains_key(language) {
            pools.insert(language.to_owned(), Pool::bounded(capacity));
            tracing::info!(language, size = capacity, "Created pool for language");
        }
    }

    pub fn get_pool(&self, language: &str) -> Result<Pool<T>, PoolError> {
        self.pools
            .read()
            .expect("pool registry poisoned")
            .get(language)
            .cloned()
            .ok_or_else(|| PoolError::NoPoolForLanguage(language.to_owned()))
    }

    fn all_pools(&self) -> Vec<(String, Pool<T>)> {
        self.pools
            .read()
            .expect("pool registry poisoned")
            .iter()
            .map(|(language, pool)| (language.clone(), pool.clone()))
            .collect()
    }
}

impl<T> Default for PoolManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager<VmHandle> {
    /// Close every pool (unblocking fillers and dispatchers) and tear down
    /// whatever VMs were still parked, so nothing outlives the process.
    pub async fn shutdown(&self) {
        for (language, pool) in self.all_pools() {
            pool.close();
            while let Some(vm) = pool.try_take() {
                tracing::info!(language, ip = %vm.ip, "Draining pooled VM");
                vm.shutdown().await;
            }
        }
    }
}

/// Scan `dir` for `rootfs-<tag>.ext4` images. Directories and files with
/// other names are ignored.
pub fn discover_languages(dir: &Path) -> Result<Vec<String>, PoolError> {
    let entries = std::fs::read_dir(dir).map_err(|source| PoolError::RootfsDirUnreadable {
        path: dir.display().to_string(),
        source,
    })?;

    let mut languages = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(tag) = name
            .strip_prefix("rootfs-")
            .and_then(|rest| rest.strip_suffix(".ext4"))
        {
            if !tag.is_empty() {
                languages.push(tag.to_owned());
            }
        }
    }
    languages.sort();

    if languages.is_empty() {
        return Err(PoolError::NoLanguages(dir.display().to_string()));
    }
    Ok(languages)
}

/// Keep one language's pool stocked until the scope is cancelled. Every VM
/// this loop creates ends up either parked in the pool or shut down.
pub async fn fill_language_pool(token: CancellationToken, language: String, pool: Pool<VmHandle>) {
    tracing::info!(language, "Starting VM pool filler");
    let boot_deadline = config::get().vm.boot_deadline;

    while !token.is_cancelled() {
        let vm = match vm::create(&token, &language).await {
            Ok(vm) => vm,
            Err(err) => {
                tracing::error!(language, %err, "Failed to create VMM");
                // transient CNI/resource errors should not make us spin
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(CREATE_RETRY_DELAY) => continue,
                }
            }
        };

        tracing::info!(language, ip = %vm.ip, "New VM created and started");

        // don't wait forever; if the agent isn't up in time, move on
        if let Err(err) = vm.wait_ready(boot_deadline).await {
            tracing::info!(language, %err, "VM not ready yet");
            vm.shutdown().await;
            continue;
        }

        // blocks while the pool is full; a closed pool returns the VM
        match pool.offer(vm).await {
            Ok(()) => tracing::info!(language, "VM added to pool"),
            Err(vm) => {
                vm.shutdown().await;
                break;
            }
        }
    }

    tracing::info!(language, "Stopping VM pool filler");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_extracts_language_tags() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rootfs-python.ext4"), b"x").unwrap();
        std::fs::write(dir.path().join("rootfs-golang.ext4"), b"x").unwrap();
        std::fs::write(dir.path().join("kernel.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("rootfs-stale.img"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("rootfs-dir.ext4")).unwrap();

        let languages = discover_languages(dir.path()).unwrap();
        assert_eq!(languages, vec!["golang", "python"]);
    }

    #[test]
    fn discovery_fails_when_no_images_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert!(matches!(
            discover_languages(dir.path()),
            Err(PoolError::NoLanguages(_))
        ));
    }

    #[test]
    fn discovery_fails_on_an_unreadable_directory() {
        assert!(matches!(
            discover_languages(Path::new("/definitely/not/here")),
            Err(PoolError::RootfsDirUnreadable { .. })
        ));
    }

    #[test]
    fn pool_registration_is_idempotent() {
        let manager: PoolManager<u32> = PoolManager::new();
        manager.add_pool("python", 2);
        manager.add_pool("python", 99);

        let pool = manager.get_pool("python").unwrap();
        // still the original capacity-2 channel
        pool.tx.try_send(1).unwrap();
        pool.tx.try_send(2).unwrap();
        assert!(pool.tx.try_send(3).is_err());
    }

    #[test]
    fn unknown_language_has_no_pool() {
        let manager: PoolManager<u32> = PoolManager::new();
        manager.add_pool("python", 1);
        assert!(matches!(
            manager.get_pool("cobol"),
            Err(PoolError::NoPoolForLanguage(lang)) if lang == "cobol"
        ));
    }

    #[tokio::test]
    async fn pool_hands_out_the_oldest_vm_first() {
        let pool: Pool<u32> = Pool::bounded(3);
        pool.offer(1).await.unwrap();
        pool.offer(2).await.unwrap();
        pool.offer(3).await.unwrap();

        assert_eq!(pool.take().await.unwrap(), 1);
        assert_eq!(pool.take().await.unwrap(), 2);
        assert_eq!(pool.take().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn a_full_pool_blocks_the_offer() {
        let pool: Pool<u32> = Pool::bounded(1);
        pool.offer(1).await.unwrap();
        assert!(pool.tx.is_full());

        // the offer parks until a slot frees up
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.offer(2)).await;
        assert!(blocked.is_err());

        assert_eq!(pool.take().await.unwrap(), 1);
        pool.offer(2).await.unwrap();
        assert_eq!(pool.take().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn a_closed_pool_returns_the_value_to_the_offerer() {
        let pool: Pool<u32> = Pool::bounded(1);
        pool.close();
        assert_eq!(pool.offer(7).await.unwrap_err(), 7);
        assert!(matches!(pool.take().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn closing_unblocks_a_parked_offer() {
        let pool: Pool<u32> = Pool::bounded(1);
        pool.offer(1).await.unwrap();

        let contender = pool.clone();
        let parked = tokio::spawn(async move { contender.offer(2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();

        let handed_back = parked.await.unwrap().unwrap_err();
        assert_eq!(handed_back, 2);
    }
}
