//! The on-disk hash cache: keyed by `(path, size, mtime)`, lets the
//! pipeline skip re-hashing files that haven't changed.
//!
//! Backed by an `lru`-crate map in memory (a bounded "most-recently-used
//! working set" cache), persisted to disk as a small XML snapshot the way
//! `share::xml`/`queue::Queue` persist their own state (spec §1 "No
//! on-disk database - state is XML snapshots plus in-memory structures"):
//! [`HashCache::load_or_new`] reads it back on startup so a restart
//! doesn't force re-hashing the whole share, and [`HashCache::persist`]
//! writes it back out whenever a new entry is learned.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Reader;
use quick_xml::Writer;

use super::tree::MerkleTree;
use crate::TthValue;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct HashCacheKey {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct CachedHash {
    pub tth: TthValue,
    pub tree: MerkleTree,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hash cache io error: {0}")]
    Io(#[from] io::Error),
    #[error("hash cache xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// A bounded, thread-safe hash cache.
pub struct HashCache {
    inner: Mutex<LruCache<HashCacheKey, CachedHash>>,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// Loads a previously persisted cache from `path`, falling back to an
    /// empty cache if the file is absent or unreadable "if a
    /// prior hash for (path,size,mtime) exists in the on-disk cache, emit
    /// it directly".
    pub fn load_or_new(capacity: usize, path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match Self::from_xml(&bytes, capacity) {
                Ok(cache) => {
                    log::info!("Loaded {} cached hashes from {:?}", cache.len(), path);
                    cache
                }
                Err(e) => {
                    log::warn!("Discarding unreadable hash cache {:?}: {}", path, e);
                    Self::new(capacity)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::new(capacity),
            Err(e) => {
                log::warn!("Could not read hash cache {:?}: {}", path, e);
                Self::new(capacity)
            }
        }
    }

    /// Writes every cached entry to `path` as an XML snapshot, creating
    /// its parent directory if needed.
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
        let xml = self.to_xml()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, xml)?;
        Ok(())
    }

    fn to_xml(&self) -> Result<Vec<u8>, Error> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            writer.write_event(Event::Decl(quick_xml::events::BytesDecl::new(
                b"1.0",
                Some(b"utf-8"),
                None,
            )))?;
            let root = BytesStart::borrowed_name(b"HashCache");
            writer.write_event(Event::Start(root))?;
            for (key, value) in inner.iter() {
                let mut entry = BytesStart::borrowed_name(b"Hash");
                let path_str = key.path.to_string_lossy();
                entry.push_attribute(("Path", path_str.as_ref()));
                let size_str = key.size.to_string();
                entry.push_attribute(("Size", size_str.as_str()));
                let mtime_str = key.mtime.to_string();
                entry.push_attribute(("Mtime", mtime_str.as_str()));
                let tth_str = value.tth.to_base32();
                entry.push_attribute(("TTH", tth_str.as_str()));
                let block_size_str = value.tree.block_size.to_string();
                entry.push_attribute(("BlockSize", block_size_str.as_str()));
                let leaves_str = value
                    .tree
                    .leaves
                    .iter()
                    .map(hex::encode)
                    .collect::<Vec<_>>()
                    .join(",");
                entry.push_attribute(("Leaves", leaves_str.as_str()));
                writer.write_event(Event::Empty(entry))?;
            }
            writer.write_event(Event::End(BytesEnd::borrowed(b"HashCache")))?;
        }
        Ok(buf)
    }

    fn from_xml(bytes: &[u8], capacity: usize) -> Result<Self, Error> {
        let cache = Self::new(capacity);
        let mut reader = Reader::from_reader(bytes);
        reader.trim_text(true);
        let mut buf = Vec::new();
        loop {
            match reader.read_event(&mut buf)? {
                Event::Empty(ref e) if e.name() == b"Hash" => {
                    if let Some((key, value)) = parse_hash_entry(e)? {
                        cache.insert(key, value);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(cache)
    }

    pub(crate) fn get(&self, key: &HashCacheKey) -> Option<CachedHash> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: HashCacheKey, value: CachedHash) {
        self.inner.lock().unwrap().put(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses one `<Hash .../>` entry back into a cache key/value pair,
/// returning `None` (rather than a hard error) for a row missing a
/// required attribute or carrying a malformed digest — a damaged cache
/// file should lose that one entry, not refuse to load at all.
fn parse_hash_entry(e: &BytesStart) -> Result<Option<(HashCacheKey, CachedHash)>, Error> {
    let mut path: Option<PathBuf> = None;
    let mut size: Option<u64> = None;
    let mut mtime: Option<u64> = None;
    let mut tth: Option<TthValue> = None;
    let mut block_size: Option<u64> = None;
    let mut leaves_raw: Option<String> = None;

    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescaped_value()?;
        let value = String::from_utf8_lossy(&value).into_owned();
        match attr.key {
            b"Path" => path = Some(PathBuf::from(value)),
            b"Size" => size = value.parse::<u64>().ok(),
            b"Mtime" => mtime = value.parse::<u64>().ok(),
            b"TTH" => tth = TthValue::from_base32(&value),
            b"BlockSize" => block_size = value.parse::<u64>().ok(),
            b"Leaves" => leaves_raw = Some(value),
            _ => {}
        }
    }

    let (path, size, mtime, tth, block_size, leaves_raw) =
        match (path, size, mtime, tth, block_size, leaves_raw) {
            (Some(p), Some(si), Some(mt), Some(t), Some(bs), Some(l)) => (p, si, mt, t, bs, l),
            _ => return Ok(None),
        };

    let mut leaves = Vec::new();
    for leaf_hex in leaves_raw.split(',').filter(|s| !s.is_empty()) {
        match hex::decode(leaf_hex) {
            Ok(b) if b.len() == 24 => {
                let mut leaf = [0u8; 24];
                leaf.copy_from_slice(&b);
                leaves.push(leaf);
            }
            _ => return Ok(None),
        }
    }
    if leaves.is_empty() {
        return Ok(None);
    }

    Ok(Some((
        HashCacheKey { path, size, mtime },
        CachedHash {
            tth,
            tree: MerkleTree { block_size, leaves },
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::tree::build_tth;

    #[test]
    fn hits_on_identical_key_misses_on_mtime_change() {
        let cache = HashCache::new(16);
        let hashed = build_tth(b"hello world");
        let key = HashCacheKey {
            path: PathBuf::from("/tmp/a"),
            size: 11,
            mtime: 1000,
        };
        assert!(cache.get(&key).is_none());
        cache.insert(
            key.clone(),
            CachedHash {
                tth: hashed.tth,
                tree: hashed.tree,
            },
        );
        assert!(cache.get(&key).is_some());

        let changed_mtime = HashCacheKey {
            mtime: 1001,
            ..key
        };
        assert!(cache.get(&changed_mtime).is_none());
    }

    #[test]
    fn persisted_cache_survives_a_reload() {
        let dir = std::env::temp_dir().join(format!("dctp-core-hash-cache-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("HashCache.xml");

        let cache = HashCache::new(16);
        let hashed = build_tth(b"persist me");
        let key = HashCacheKey {
            path: PathBuf::from("/share/file.bin"),
            size: 10,
            mtime: 42,
        };
        cache.insert(
            key.clone(),
            CachedHash {
                tth: hashed.tth,
                tree: hashed.tree.clone(),
            },
        );
        cache.persist(&path).unwrap();

        let reloaded = HashCache::load_or_new(16, &path);
        let found = reloaded.get(&key).expect("entry survives reload");
        assert_eq!(found.tth, hashed.tth);
        assert_eq!(found.tree, hashed.tree);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn loading_a_missing_file_yields_an_empty_cache() {
        let path = std::env::temp_dir().join("dctp-core-hash-cache-does-not-exist.xml");
        let cache = HashCache::load_or_new(16, &path);
        assert!(cache.is_empty());
    }
}
