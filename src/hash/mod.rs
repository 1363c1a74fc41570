//! The hash pipeline: builds Tiger-tree roots and Merkle trees for files
//! scheduled by the shared-index refresh.
//!
//! For each path: if a prior `(path, size, mtime)` hash exists in the
//! on-disk cache, it is emitted directly. Otherwise a Tiger tree is built
//! with a 1 KiB leaf size, the block size is then promoted to the smallest
//! power of two `>= 1 KiB` such that `block_size * leaf_count >= file_size`,
//! and the root is finalized.

mod cache;
mod pauser;
mod tree;

pub use cache::{HashCache, HashCacheKey};
pub use pauser::{PauseHandle, Pauser};
pub use tree::{build_tth, HashedFile, MerkleTree};

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::TthValue;

/// A `(path, size, mtime)` tuple is the cache key and the input to a single
/// hash job.
#[derive(Clone, Debug)]
pub struct HashJob {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: u64,
}

/// The output of one hash job: the finalized root plus the Merkle tree of
/// block hashes, emitted to the shared index.
#[derive(Clone, Debug)]
pub struct HashResult {
    pub path: PathBuf,
    pub size: u64,
    pub tth: TthValue,
    pub tree: MerkleTree,
}

/// Errors that can occur while hashing a single file. I/O and
/// access-denied failures are logged and the file dropped from the
/// pending set without retry within the current refresh — they are not
/// propagated as a hard pipeline failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error hashing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The hash pipeline's worker: reads jobs off a channel, consults the
/// cache, and hashes whatever isn't already known, respecting pause
/// requests from any outstanding [`PauseHandle`].
pub struct HashPipeline {
    cache: HashCache,
    pauser: Pauser,
    job_port: mpsc::UnboundedReceiver<HashJob>,
    result_chan: mpsc::UnboundedSender<HashResult>,
    /// Where [`HashCache`] is persisted after every newly learned entry;
    /// `None` keeps the cache in-memory only (e.g. in tests).
    persist_path: Option<PathBuf>,
}

impl HashPipeline {
    pub fn new(
        cache: HashCache,
        persist_path: Option<PathBuf>,
    ) -> (
        Self,
        mpsc::UnboundedSender<HashJob>,
        mpsc::UnboundedReceiver<HashResult>,
        Pauser,
    ) {
        let (job_chan, job_port) = mpsc::unbounded_channel();
        let (result_chan, result_port) = mpsc::unbounded_channel();
        let pauser = Pauser::new();
        (
            Self {
                cache,
                pauser: pauser.clone(),
                job_port,
                result_chan,
                persist_path,
            },
            job_chan,
            result_port,
            pauser,
        )
    }

    /// Runs the pipeline loop until the job channel is closed.
    pub async fn run(&mut self) {
        log::info!("Starting hash pipeline");
        while let Some(job) = self.job_port.recv().await {
            // block here (but keep our place in the queue) while paused
            self.pauser.wait_if_paused().await;

            match self.process(&job).await {
                Ok(result) => {
                    if self.result_chan.send(result).is_err() {
                        log::warn!("Hash pipeline result channel closed");
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Dropping {:?} from hash queue: {}", job.path, e);
                }
            }
        }
        log::info!("Hash pipeline stopped");
    }

    async fn process(&self, job: &HashJob) -> Result<HashResult, Error> {
        let key = HashCacheKey {
            path: job.path.clone(),
            size: job.size,
            mtime: job.mtime,
        };
        if let Some(cached) = self.cache.get(&key) {
            log::debug!("Cache hit hashing {:?}", job.path);
            return Ok(HashResult {
                path: job.path.clone(),
                size: job.size,
                tth: cached.tth,
                tree: cached.tree,
            });
        }

        log::info!("Hashing {:?} ({} bytes)", job.path, job.size);
        let path = job.path.clone();
        let size = job.size;
        let hashed = tokio::task::spawn_blocking(move || hash_file(&path, size))
            .await
            .map_err(|_| Error::Io {
                path: job.path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "hash worker panicked",
                ),
            })?
            .map_err(|source| Error::Io {
                path: job.path.clone(),
                source,
            })?;

        self.cache.insert(
            key,
            cache::CachedHash {
                tth: hashed.tth,
                tree: hashed.tree.clone(),
            },
        );
        if let Some(path) = &self.persist_path {
            if let Err(e) = self.cache.persist(path) {
                log::warn!("Could not persist hash cache to {:?}: {}", path, e);
            }
        }

        Ok(HashResult {
            path: job.path.clone(),
            size,
            tth: hashed.tth,
            tree: hashed.tree,
        })
    }
}

/// Synchronously hashes a file on disk: the blocking counterpart to
/// [`tree::build_tth`], reading the whole file in leaf-sized chunks.
///
/// # Important
///
/// Performs blocking I/O and should be run on a blocking-friendly thread,
/// not the async executor.
pub fn hash_file(path: &Path, size: u64) -> std::io::Result<HashedFile> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut buf = Vec::with_capacity(size.min(16 * 1024 * 1024) as usize);
    file.read_to_end(&mut buf)?;
    Ok(build_tth(&buf))
}
