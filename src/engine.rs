//! The process-wide `Core`: the single value every former singleton
//! (`ClientManager`, `ConnectionManager`, `DownloadManager`,
//! `UploadManager`, `ShareManager`, `HashManager`, `QueueManager`) becomes
//! a field of.
//!
//! Subsystems come up in a fixed order: hash cache, then share, then
//! queue, then connection/slot managers, then hubs. The lock order is
//! user/identity fast-locks < hub-session lock < connection-manager lock
//! < queue lock <
//! shared-index lock. Each field below is independently locked with
//! [`parking_lot::Mutex`]; callers taking more than one lock at a time
//! must acquire them in that order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::conf::Conf;
use crate::hash::{HashCache, HashPipeline, HashResult, Pauser};
use crate::hub::{Dialect, Hub};
use crate::peer::TokenTable;
use crate::queue::Queue;
use crate::scheduler::Scheduler;
use crate::search_udp::SudpKeyTable;
use crate::share::search::{SearchQuery, SearchResult};
use crate::share::Share;
use crate::slots::Slots;
use crate::user::UserRegistry;

/// The engine's single shared value "map to a single
/// process-wide `Core` value passed by reference; each former singleton
/// becomes a field".
pub struct Core {
    pub conf: Conf,
    users: Mutex<UserRegistry>,
    hubs: Mutex<HashMap<String, Hub>>,
    tokens: Mutex<TokenTable>,
    queue: Mutex<Queue>,
    share: Mutex<Share>,
    slots: Mutex<Slots>,
    scheduler: Mutex<Scheduler>,
    sudp_keys: Mutex<SudpKeyTable>,
    hash_jobs: mpsc::UnboundedSender<crate::hash::HashJob>,
    /// The hash pipeline's pause/resume handle "pause/resume
    /// scoped to a stack-allocated pauser handle".
    hash_pauser: Pauser,
    /// Real path to virtual share path, for the hash jobs currently in
    /// flight: the pipeline only round-trips a `HashJob`'s real path, so
    /// this is how [`Core::apply_hash_result`] recovers the virtual path
    /// [`Share::apply_hash_result`] needs to find the file again.
    pending_virtual_paths: Mutex<HashMap<std::path::PathBuf, String>>,
}

impl Core {
    /// Builds a `Core` and spins up the hash pipeline.
    ///
    /// Returns the `Core`, the `HashPipeline` (the caller spawns its
    /// `run()` loop) and the result stream the share refresh consumes.
    pub fn new(conf: Conf, hash_cache_capacity: usize) -> (Arc<Self>, HashPipeline, mpsc::UnboundedReceiver<HashResult>) {
        let hash_cache_path = conf.engine.data_dir.join("HashCache.xml");
        let hash_cache = HashCache::load_or_new(hash_cache_capacity, &hash_cache_path);
        let (pipeline, hash_jobs, hash_results, hash_pauser) =
            HashPipeline::new(hash_cache, Some(hash_cache_path));
        let share = Share::new(conf.share.clone());
        let queue = Queue::new(conf.queue.save_interval);
        let slots = Slots::new(conf.slots.clone());

        let core = Arc::new(Self {
            conf,
            users: Mutex::new(UserRegistry::new()),
            hubs: Mutex::new(HashMap::new()),
            tokens: Mutex::new(TokenTable::new()),
            queue: Mutex::new(queue),
            share: Mutex::new(share),
            slots: Mutex::new(slots),
            scheduler: Mutex::new(Scheduler::new()),
            sudp_keys: Mutex::new(SudpKeyTable::new()),
            hash_jobs,
            hash_pauser,
            pending_virtual_paths: Mutex::new(HashMap::new()),
        });
        (core, pipeline, hash_results)
    }

    /// Pauses the hash pipeline until the returned handle is dropped (spec
    /// §4.1).
    pub fn pause_hashing(&self) -> crate::hash::PauseHandle {
        self.hash_pauser.pause()
    }

    pub fn is_hashing_paused(&self) -> bool {
        self.hash_pauser.is_paused()
    }

    /// Registers a new hub session, the way joining a hub from the UI
    /// does.
    pub fn join_hub(&self, url: impl Into<String>, dialect: Dialect, tls: bool) {
        let url = url.into();
        let mut hubs = self.hubs.lock();
        hubs.entry(url.clone()).or_insert_with(|| Hub::new(url, dialect, tls));
    }

    pub fn leave_hub(&self, url: &str) {
        self.hubs.lock().remove(url);
    }

    pub fn with_hub<R>(&self, url: &str, f: impl FnOnce(&mut Hub) -> R) -> Option<R> {
        self.hubs.lock().get_mut(url).map(f)
    }

    pub fn hub_count(&self) -> usize {
        self.hubs.lock().len()
    }

    pub fn users(&self) -> &Mutex<UserRegistry> {
        &self.users
    }

    pub fn tokens(&self) -> &Mutex<TokenTable> {
        &self.tokens
    }

    pub fn queue(&self) -> &Mutex<Queue> {
        &self.queue
    }

    pub fn slots(&self) -> &Mutex<Slots> {
        &self.slots
    }

    pub fn scheduler(&self) -> &Mutex<Scheduler> {
        &self.scheduler
    }

    pub fn sudp_keys(&self) -> &Mutex<SudpKeyTable> {
        &self.sudp_keys
    }

    /// Submits a path for hashing; the result eventually arrives on the
    /// channel returned from [`Core::new`] and is applied to the share via
    /// [`Core::apply_hash_result`].
    pub fn submit_hash_job(&self, job: crate::hash::HashJob) -> Result<(), crate::error::Error> {
        self.hash_jobs.send(job).map_err(|_| crate::error::Error::ChannelClosed)
    }

    /// Runs a search against the shared index. This is the
    /// last lock in the ordering, so it's always safe to call after any
    /// combination of the others.
    pub fn search(&self, query: &SearchQuery, max_results: usize) -> Vec<SearchResult> {
        self.share.lock().search(query, max_results)
    }

    /// Re-walks the share roots, then submits every file still missing a
    /// TTH to the hash pipeline.
    pub fn refresh_share(&self) -> Result<(), crate::error::Error> {
        let jobs = {
            let mut share = self.share.lock();
            share.refresh()?;
            share.pending_hash_jobs()
        };
        {
            let mut table = self.pending_virtual_paths.lock();
            for (job, virtual_path) in &jobs {
                table.insert(job.path.clone(), virtual_path.clone());
            }
        }
        for (job, _) in jobs {
            self.submit_hash_job(job)?;
        }
        Ok(())
    }

    pub fn apply_hash_result(&self, result: HashResult) {
        let mut table = self.pending_virtual_paths.lock();
        if let Some(virtual_path) = table.remove(&result.path) {
            self.share
                .lock()
                .apply_hash_result(&result.path, &virtual_path, result.tth);
        }
    }

    /// One second-timer tick across every timer-driven subsystem. Returns
    /// the scheduler actions for the caller to act on (peer connects,
    /// status events); locks are acquired and released within this call,
    /// never held across the caller's handling of the returned actions.
    pub fn tick_second(
        &self,
        is_offline: impl Fn(&crate::ids::Cid) -> bool,
        is_passive: impl Fn(&crate::ids::Cid) -> bool,
        we_are_passive: bool,
        admission: &crate::scheduler::DownloadAdmission,
        priority_of: impl Fn(&crate::ids::Cid) -> crate::queue::Priority,
    ) -> Vec<crate::scheduler::Action> {
        self.scheduler.lock().tick_second(
            std::time::Instant::now(),
            is_offline,
            is_passive,
            we_are_passive,
            admission,
            priority_of,
        )
    }

    /// Per-minute cleanup across the CQI table, the slot waiting list, and
    /// the user registry's garbage collector.
    pub fn tick_minute(&self, is_offline: impl Fn(&crate::ids::Cid) -> bool) -> Vec<crate::scheduler::Action> {
        let now = std::time::Instant::now();
        self.users.lock().collect_garbage();
        self.slots.lock().expire_connecting(now);
        self.scheduler.lock().tick_minute(now, is_offline)
    }
}
