//! The shared-tree index: virtual directory tree, TTH index, Bloom filter,
//! file-list XML generation and search.
//!
//! Grounded on `examples/original_source/dcpp/ShareManager.cpp`: refresh
//! walks each real root applying skiplist rules (`checkInvalidFileName`,
//! `checkInvalidFileSize`, `checkHidden`), `getBloom` builds the remote
//! `GET blom` payload on demand from the current `tthIndex` keys, and
//! `generateXmlList`/`search` are mirrored in `xml.rs`/`search.rs`.

pub mod dir;
mod error;
pub mod search;
pub mod xml;

pub use error::Error;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::bloom::{self, Bloom};
use crate::conf::ShareConf;
use crate::ids::Cid;
use crate::TthValue;
use dir::{Directory, File};
use search::{SearchQuery, SearchResult};

/// One entry in the TTH index: where the file lives, so a `GET` by TTH can
/// resolve to bytes without a name lookup.
#[derive(Clone, Debug)]
pub struct TthEntry {
    pub tth: TthValue,
    pub virtual_path: String,
    pub real_path: PathBuf,
    pub size: u64,
}

/// The shared-tree index. One instance per client.
pub struct Share {
    conf: ShareConf,
    roots: Vec<Directory>,
    tth_index: HashMap<TthValue, TthEntry>,
    name_bloom: Bloom,
    refreshing: bool,
    dirty: bool,
    last_full_update: Instant,
    last_xml_update: Instant,
    skiplist_ext: Vec<Regex>,
    skiplist_paths: Vec<Regex>,
    cached_full_xml: Option<Vec<u8>>,
    cached_full_xml_bz2: Option<Vec<u8>>,
    cached_full_xml_tth: Option<TthValue>,
}

impl Share {
    pub fn new(conf: ShareConf) -> Self {
        let skiplist_ext = compile_patterns(&conf.skiplist_extensions, true);
        let skiplist_paths = compile_patterns(&conf.skiplist_paths, false);
        Self {
            conf,
            roots: Vec::new(),
            tth_index: HashMap::new(),
            name_bloom: Bloom::new(1, 4, 24),
            refreshing: false,
            dirty: true,
            last_full_update: Instant::now(),
            last_xml_update: Instant::now() - Duration::from_secs(3600),
            skiplist_ext,
            skiplist_paths,
            cached_full_xml: None,
            cached_full_xml_bz2: None,
            cached_full_xml_tth: None,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    fn check_name(&self, name: &str) -> bool {
        !self.skiplist_ext.iter().any(|r| r.is_match(name))
    }

    fn check_path(&self, path: &str) -> bool {
        !self.skiplist_paths.iter().any(|r| r.is_match(path))
    }

    fn check_size(&self, size: u64) -> bool {
        if let Some(min) = self.conf.skiplist_min_size {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.conf.skiplist_max_size {
            if size > max {
                return false;
            }
        }
        true
    }

    fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
    }

    /// Walks the real filesystem roots into a fresh `Directory` forest,
    /// applying the skiplist rules, then swaps it in and marks the index
    /// dirty. At most one refresh at a time "a second call logs
    /// and returns".
    pub fn refresh(&mut self) -> Result<(), Error> {
        if self.refreshing {
            log::warn!("Share refresh already in progress, dropping this request");
            return Err(Error::RefreshInProgress);
        }
        self.refreshing = true;
        let result = self.refresh_inner();
        self.refreshing = false;
        result
    }

    fn refresh_inner(&mut self) -> Result<(), Error> {
        let roots_conf = self.conf.roots.clone();
        let mut new_roots = Vec::with_capacity(roots_conf.len());
        let mut new_index: HashMap<TthValue, TthEntry> = HashMap::new();
        let mut name_bloom = Bloom::new(self.estimate_item_count().max(1), 4, 24);

        for (virtual_name, real_root) in &roots_conf {
            let mut dir = Directory::new(virtual_name.clone());
            dir.real_path = Some(real_root.clone());
            name_bloom.add(virtual_name);
            self.walk_dir(real_root, &mut dir, &mut new_index, &mut name_bloom)?;
            new_roots.push(dir);
        }

        self.roots = new_roots;
        self.tth_index = new_index;
        self.name_bloom = name_bloom;
        self.dirty = true;
        self.last_full_update = Instant::now();
        log::info!("Share refresh complete: {} roots", self.conf.roots.len());
        Ok(())
    }

    fn estimate_item_count(&self) -> usize {
        self.tth_index.len().max(64)
    }

    /// "Never share the incomplete-downloads directory or the
    /// TLS private key": true if `path` is (or falls under) the
    /// configured incomplete-download directory, or is the configured TLS
    /// key file.
    fn is_excluded(&self, path: &Path) -> bool {
        if let Some(incomplete) = &self.conf.incomplete_download_dir {
            if path == incomplete.as_path() || path.starts_with(incomplete) {
                return true;
            }
        }
        if let Some(key_path) = &self.conf.tls_key_path {
            if path == key_path.as_path() {
                return true;
            }
        }
        false
    }

    fn walk_dir(
        &self,
        real_path: &Path,
        out: &mut Directory,
        index: &mut HashMap<TthValue, TthEntry>,
        name_bloom: &mut Bloom,
    ) -> Result<(), Error> {
        let entries = match std::fs::read_dir(real_path) {
            Ok(e) => e,
            Err(source) => {
                log::warn!("Skipping unreadable directory {:?}: {}", real_path, source);
                return Ok(());
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if self.is_excluded(&path) {
                continue;
            }
            if !self.conf.share_hidden && Self::is_hidden(&path) {
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_symlink() && !self.conf.follow_links {
                continue;
            }

            let metadata = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };

            if metadata.is_dir() || (file_type.is_symlink() && path.is_dir()) {
                if !self.check_path(&path.to_string_lossy()) {
                    continue;
                }
                name_bloom.add(&name);
                let child = out.ensure_dir(&name);
                self.walk_dir(&path, child, index, name_bloom)?;
            } else {
                if !self.check_name(&name) || !self.check_path(&path.to_string_lossy()) {
                    continue;
                }
                let size = metadata.len();
                if !self.check_size(size) {
                    continue;
                }
                name_bloom.add(&name);
                out.insert_file(File {
                    name,
                    size,
                    tth: None,
                    real_path: path,
                });
            }
        }
        Ok(())
    }

    /// Walks the current tree collecting every file still missing a TTH,
    /// as a hash job paired with the virtual path [`Share::apply_hash_result`]
    /// needs once the result comes back.
    pub fn pending_hash_jobs(&self) -> Vec<(crate::hash::HashJob, String)> {
        let mut jobs = Vec::new();
        for root in &self.roots {
            Self::collect_pending(root, root.name.clone(), &mut jobs);
        }
        jobs
    }

    fn collect_pending(dir: &Directory, virtual_prefix: String, jobs: &mut Vec<(crate::hash::HashJob, String)>) {
        for file in &dir.files {
            if file.tth.is_none() {
                let mtime = std::fs::metadata(&file.real_path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let virtual_path = format!("{}/{}", virtual_prefix, file.name);
                jobs.push((
                    crate::hash::HashJob {
                        path: file.real_path.clone(),
                        size: file.size,
                        mtime,
                    },
                    virtual_path,
                ));
            }
        }
        for (name, child) in &dir.dirs {
            Self::collect_pending(child, format!("{}/{}", virtual_prefix, name), jobs);
        }
    }

    /// Applies a completed hash result to the matching file (spec §4.1
    /// "Emits `(path, TTH, tree)`" feeding §4.2's index). Enforces the
    /// duplicate-TTH rule: if `list_duplicates` is
    /// false and the TTH is already indexed, the new path is dropped.
    pub fn apply_hash_result(&mut self, real_path: &Path, virtual_path: &str, tth: TthValue) {
        if let Some(existing) = self.tth_index.get(&tth) {
            if !self.conf.list_duplicates {
                log::info!(
                    "Duplicate TTH for {:?}: already shared as {:?}, dropping",
                    real_path,
                    existing.real_path
                );
                return;
            }
        }
        if let Some(file) = self.find_file_mut(virtual_path) {
            file.tth = Some(tth);
            let size = file.size;
            self.tth_index.insert(
                tth,
                TthEntry {
                    tth,
                    virtual_path: virtual_path.to_string(),
                    real_path: real_path.to_path_buf(),
                    size,
                },
            );
            self.dirty = true;
        }
    }

    fn find_file_mut(&mut self, virtual_path: &str) -> Option<&mut File> {
        let mut parts = virtual_path.trim_matches('/').split('/').peekable();
        let first = parts.next()?;
        let mut dir = self.roots.iter_mut().find(|d| d.name == first)?;
        loop {
            let part = parts.next()?;
            if parts.peek().is_none() {
                return dir.files.iter_mut().find(|f| f.name == part);
            }
            dir = dir.dirs.get_mut(part)?;
        }
    }

    /// Looks up a virtual directory path (used to serve partial lists and
    /// to resolve `ADCGET list` for a sub-path).
    pub fn find_dir(&self, virtual_path: &str) -> Option<&Directory> {
        let trimmed = virtual_path.trim_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let mut parts = trimmed.split('/');
        let first = parts.next()?;
        let mut dir = self.roots.iter().find(|d| d.name == first)?;
        for part in parts {
            dir = dir.dirs.get(part)?;
        }
        Some(dir)
    }

    /// Resolves a file by its TTH (for `ADCGET file TTH/...` and TTH
    /// searches).
    pub fn find_by_tth(&self, tth: &TthValue) -> Option<&TthEntry> {
        self.tth_index.get(tth)
    }

    /// Runs a search, short-circuiting on a Bloom miss of any whole token
    ///.
    pub fn search(&self, query: &SearchQuery, max_results: usize) -> Vec<SearchResult> {
        if let Some(tth) = query.root {
            return self
                .find_by_tth(&tth)
                .into_iter()
                .map(|entry| SearchResult {
                    is_directory: false,
                    size: entry.size,
                    full_path: entry.virtual_path.clone(),
                    tth: Some(entry.tth),
                })
                .collect();
        }

        for token in &query.include {
            if !self.name_bloom.contains(token) {
                return Vec::new();
            }
        }

        search::search(&self.roots, query, max_results)
    }

    /// Serves a remote `GET blom` request: validates the parameters, then
    /// builds a fresh Bloom over every indexed TTH (not names — the remote
    /// bloom indexes content ids, grounded on `ShareManager::getBloom`).
    pub fn bloom_response(&self, k: usize, h: usize, requested_m: u64) -> Result<Vec<u8>, Error> {
        let m = bloom::validate_bloom_request(self.tth_index.len(), k, h, requested_m)?;
        // `Bloom::new` sizes off an expected item count; here `GET blom`
        // pins the exact bit width `m`, so the bits are built directly.
        let mut filter_bits = vec![false; m as usize];
        for tth in self.tth_index.keys() {
            for pos in bloom_positions(&tth.0, k, h, m) {
                filter_bits[pos] = true;
            }
        }
        Ok(pack_bits(&filter_bits))
    }

    /// Regenerates the full file-list XML (plain and bz2) if dirty and
    /// either the regen interval elapsed or a refresh happened since the
    /// last generation.
    pub fn regenerate_xml_if_needed(&mut self, cid: &Cid, generator: &str) -> Result<(), Error> {
        let should = self.dirty
            && (self.last_xml_update.elapsed() >= self.conf.xml_regen_interval
                || self.last_xml_update < self.last_full_update);
        if !should {
            return Ok(());
        }
        let xml = xml::generate_full_xml(&self.roots, cid, generator)?;
        let bz2 = xml::compress_bz2(&xml).map_err(|source| Error::Io {
            path: PathBuf::from("files.xml.bz2"),
            source,
        })?;
        let tth = xml::tth_of_list(&xml);
        self.cached_full_xml = Some(xml);
        self.cached_full_xml_bz2 = Some(bz2);
        self.cached_full_xml_tth = Some(tth);
        self.last_xml_update = Instant::now();
        self.dirty = false;
        Ok(())
    }

    pub fn cached_full_xml(&self) -> Option<&[u8]> {
        self.cached_full_xml.as_deref()
    }

    pub fn cached_full_xml_bz2(&self) -> Option<&[u8]> {
        self.cached_full_xml_bz2.as_deref()
    }

    pub fn partial_xml(&self, virtual_path: &str, cid: &Cid, generator: &str) -> Result<Vec<u8>, Error> {
        let dir = self
            .find_dir(virtual_path)
            .ok_or_else(|| Error::PathNotFound(virtual_path.to_string()))?;
        xml::generate_partial_xml(dir, virtual_path, cid, generator).map_err(Error::from)
    }
}

fn bloom_positions(key: &[u8], k: usize, h: usize, m: u64) -> Vec<usize> {
    use std::hash::{Hash, Hasher};
    let cap = if h < 32 { 1u64 << h } else { u64::MAX };
    (0..k.max(1))
        .map(|i| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            key.hash(&mut hasher);
            i.hash(&mut hasher);
            let raw = hasher.finish() % cap;
            (raw % m.max(1)) as usize
        })
        .collect()
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, &b) in bits.iter().enumerate() {
        if b {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn compile_patterns(patterns: &[String], anchor_dollar: bool) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            let pattern = if anchor_dollar && !p.ends_with('$') {
                format!("{}$", p)
            } else {
                p.clone()
            };
            match Regex::new(&format!("(?i){}", pattern)) {
                Ok(r) => Some(r),
                Err(e) => {
                    log::warn!("Invalid skiplist pattern {:?}: {}", p, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_twice_concurrently_is_rejected() {
        let mut share = Share::new(ShareConf::new());
        share.refreshing = true;
        assert!(matches!(share.refresh(), Err(Error::RefreshInProgress)));
    }

    #[test]
    fn bloom_response_rejects_bad_k() {
        let share = Share::new(ShareConf::new());
        assert!(share.bloom_response(0, 24, 64).is_err());
    }

    #[test]
    fn duplicate_tth_dropped_when_list_duplicates_disabled() {
        let mut conf = ShareConf::new();
        conf.list_duplicates = false;
        conf.roots.push(("root".into(), PathBuf::from("/tmp")));
        let mut share = Share::new(conf);
        let mut dir = Directory::new("root");
        dir.insert_file(File {
            name: "a".into(),
            size: 1,
            tth: None,
            real_path: PathBuf::from("/tmp/a"),
        });
        dir.insert_file(File {
            name: "b".into(),
            size: 1,
            tth: None,
            real_path: PathBuf::from("/tmp/b"),
        });
        share.roots = vec![dir];

        let tth = TthValue([7; 24]);
        share.apply_hash_result(Path::new("/tmp/a"), "root/a", tth);
        share.apply_hash_result(Path::new("/tmp/b"), "root/b", tth);

        assert_eq!(share.find_dir("root").unwrap().files[1].tth, None);
        assert_eq!(share.tth_index.len(), 1);
    }

    #[test]
    fn refresh_skips_the_incomplete_download_dir_and_the_tls_key() {
        let dir = std::env::temp_dir().join(format!("dctp-core-share-excl-{}", std::process::id()));
        let incomplete = dir.join("incomplete");
        std::fs::create_dir_all(&incomplete).unwrap();
        std::fs::write(incomplete.join("partial.dat"), b"partial").unwrap();
        std::fs::write(dir.join("visible.txt"), b"hello").unwrap();
        let key_path = dir.join("client.key");
        std::fs::write(&key_path, b"private").unwrap();

        let mut conf = ShareConf::new();
        conf.roots.push(("root".into(), dir.clone()));
        conf.incomplete_download_dir = Some(incomplete.clone());
        conf.tls_key_path = Some(key_path.clone());
        let mut share = Share::new(conf);
        share.refresh().unwrap();

        let root = share.find_dir("root").unwrap();
        assert!(root.dirs.get("incomplete").is_none());
        assert!(root.files.iter().any(|f| f.name == "visible.txt"));
        assert!(!root.files.iter().any(|f| f.name == "client.key"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
