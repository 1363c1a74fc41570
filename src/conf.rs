//! This module defines types used to configure the engine and its parts.
//!
//! One sub-config per subsystem, each with a `::new(..)` constructor that
//! fills in reasonable defaults except for the handful of things (download
//! dir, share roots) that can't sensibly be guessed for the user.

use std::{path::PathBuf, time::Duration};

use crate::ids::Pid;

/// The global configuration for the core engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub hub: HubConf,
    pub share: ShareConf,
    pub queue: QueueConf,
    pub slots: SlotConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the
    /// download directory and share roots, which are not sensible to guess
    /// for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();

        let mut engine = EngineConf::new();
        engine.data_dir = download_dir.clone();

        let mut share = ShareConf::new();
        // The incomplete-downloads directory is never shared "never
        // share the incomplete-downloads directory or the TLS private
        // key".
        share.incomplete_download_dir = Some(download_dir.clone());

        Self {
            engine,
            hub: HubConf::new(),
            share,
            queue: QueueConf::new(download_dir),
            slots: SlotConf::new(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// Our private id. The CID we advertise is `TIGER(private_id)`.
    pub private_id: Pid,
    /// Whether we accept untrusted hubs (no pinned keyprint / no TLS).
    pub allow_untrusted_hubs: bool,
    /// Whether we accept untrusted peer clients.
    pub allow_untrusted_clients: bool,
    /// Whether a direct TLS connection is required for transfers.
    pub require_tls: bool,
    /// Directory for persisted XML snapshots this crate writes on its own
    /// (the hash cache; see [`crate::hash::cache`]) — spec §1 "No
    /// on-disk database - state is XML snapshots plus in-memory
    /// structures".
    pub data_dir: PathBuf,
}

impl EngineConf {
    pub fn new() -> Self {
        Self {
            private_id: Pid::generate(),
            allow_untrusted_hubs: false,
            allow_untrusted_clients: false,
            require_tls: false,
            data_dir: PathBuf::from("."),
        }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for hub sessions.
#[derive(Clone, Debug)]
pub struct HubConf {
    pub nick: String,
    pub description: String,
    /// Seconds of inactivity in NORMAL state before a keepalive is sent.
    pub keepalive_interval: Duration,
    /// Seconds spent in any pre-NORMAL state before a forced disconnect.
    pub login_timeout: Duration,
    /// Maximum searches per seeker per `search_flood_window` before a
    /// penalty.
    pub search_flood_limit: usize,
    pub search_flood_window: Duration,
    pub search_flood_penalty: Duration,
    pub enable_sudp: bool,
    pub enable_ccpm: bool,
    pub always_ccpm: bool,
}

impl HubConf {
    pub fn new() -> Self {
        Self {
            nick: String::new(),
            description: String::new(),
            keepalive_interval: Duration::from_secs(120),
            login_timeout: Duration::from_secs(120),
            search_flood_limit: 7,
            search_flood_window: Duration::from_secs(5),
            search_flood_penalty: Duration::from_secs(120),
            enable_sudp: true,
            enable_ccpm: true,
            always_ccpm: false,
        }
    }
}

impl Default for HubConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the shared-tree index.
#[derive(Clone, Debug)]
pub struct ShareConf {
    /// Real filesystem roots to share, each paired with its virtual name.
    pub roots: Vec<(String, PathBuf)>,
    pub skiplist_extensions: Vec<String>,
    pub skiplist_paths: Vec<String>,
    pub skiplist_min_size: Option<u64>,
    pub skiplist_max_size: Option<u64>,
    pub share_hidden: bool,
    pub follow_links: bool,
    pub list_duplicates: bool,
    pub send_bloom: bool,
    /// Keep a downloaded peer file list on disk after it's been viewed,
    /// rather than deleting it once the viewer is done (spec §6
    /// `keepLists`; the file list *we* generate is unaffected by this).
    pub keep_lists: bool,
    /// How long a generated file list is considered fresh before a refresh
    /// forces regeneration.
    pub xml_regen_interval: Duration,
    /// Never walked into or added to the tree "never share
    /// the incomplete-downloads directory". Normally set to
    /// `QueueConf::download_dir` by [`Conf::new`].
    pub incomplete_download_dir: Option<PathBuf>,
    /// Never walked into or added to the tree "never share
    /// ... the TLS private key".
    pub tls_key_path: Option<PathBuf>,
}

impl ShareConf {
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            skiplist_extensions: Vec::new(),
            skiplist_paths: Vec::new(),
            skiplist_min_size: None,
            skiplist_max_size: None,
            share_hidden: false,
            follow_links: false,
            list_duplicates: false,
            send_bloom: true,
            keep_lists: false,
            xml_regen_interval: Duration::from_secs(15 * 60),
            incomplete_download_dir: None,
            tls_key_path: None,
        }
    }
}

impl Default for ShareConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the download queue and scheduler.
#[derive(Clone, Debug)]
pub struct QueueConf {
    pub download_dir: PathBuf,
    pub segmented_dl: bool,
    /// Maximum number of concurrently active downloads (`DownloadAdmission`'s
    /// `max_concurrent`, spec §6 `downloadSlots`).
    pub download_slots: usize,
    /// Throughput ceiling in bytes/sec across all downloads, 0 = unlimited
    /// (spec §6 `maxDownloadSpeed`).
    pub max_download_speed: u64,
    pub auto_drop_speed: u64,
    pub auto_drop_interval: Duration,
    pub auto_drop_elapsed: Duration,
    pub auto_drop_inactivity: Duration,
    pub auto_drop_min_sources: usize,
    pub auto_drop_filesize: u64,
    /// How often an auto-search re-issues for still-wanted queue items
    /// (spec §6 `autoSearchInterval`).
    pub auto_search_interval: Duration,
    /// Max auto-search results kept per item (spec §6 `autoSearchLimit`).
    pub auto_search_limit: usize,
    /// Whether `ADCGET`/`ADCSND` negotiate the `ZL1` zlib transfer filter
    /// (spec §6 `compressTransfers`).
    pub compress_transfers: bool,
    /// Keep the `.dctmp` temp file and queue entry around after the user
    /// removes a finished download, instead of deleting it immediately
    /// (spec §6 `keepFinishedFiles`).
    pub keep_finished_files: bool,
    /// Minimum time between successive `Queue.xml` saves.
    pub save_interval: Duration,
}

impl QueueConf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            segmented_dl: true,
            download_slots: 3,
            max_download_speed: 0,
            auto_drop_speed: 0,
            // a zero interval means "never auto-drop"; we encode
            // that as a zero Duration and check for it explicitly rather
            // than dividing by it.
            auto_drop_interval: Duration::from_secs(0),
            auto_drop_elapsed: Duration::from_secs(0),
            auto_drop_inactivity: Duration::from_secs(0),
            auto_drop_min_sources: 0,
            auto_drop_filesize: 0,
            auto_search_interval: Duration::from_secs(15 * 60),
            auto_search_limit: 5,
            compress_transfers: true,
            keep_finished_files: false,
            save_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for the upload slot manager.
#[derive(Clone, Debug)]
pub struct SlotConf {
    pub slots: usize,
    pub extra_slots: usize,
    pub mini_slot_bytes: u64,
    pub min_upload_speed: u64,
    pub auto_slot_grant_interval: Duration,
}

impl SlotConf {
    pub fn new() -> Self {
        Self {
            slots: 3,
            extra_slots: 3,
            mini_slot_bytes: 64 * 1024,
            min_upload_speed: 0,
            auto_slot_grant_interval: Duration::from_secs(30),
        }
    }
}

impl Default for SlotConf {
    fn default() -> Self {
        Self::new()
    }
}
