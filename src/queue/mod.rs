//! The download queue: per-user per-priority lists, segment tracking and
//! XML persistence.
//!
//! Organized as `user_queue[priority][user] -> VecDeque<QueueItem>` plus a
//! `running: HashMap<Cid, PathBuf>` enforcing one active download per
//! user.

mod error;
pub mod io;
pub mod item;

pub use error::Error;
pub use io::{compute_crc32, delete_temp, finalize_move, find_sfv_crc, format_mismatch, TempFile};
pub use item::{FileCompletion, ItemFlags, Priority, QueueItem, Source, SourceFlags, TransferType, TreeCompletion};

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::Cid;

/// The download queue.
pub struct Queue {
    items: HashMap<PathBuf, QueueItem>,
    user_queue: HashMap<Priority, HashMap<Cid, VecDeque<PathBuf>>>,
    /// One active download per user.
    running: HashMap<Cid, PathBuf>,
    dirty: bool,
    last_save: Instant,
    save_interval: std::time::Duration,
}

impl Queue {
    pub fn new(save_interval: std::time::Duration) -> Self {
        Self {
            items: HashMap::new(),
            user_queue: HashMap::new(),
            running: HashMap::new(),
            dirty: false,
            last_save: Instant::now(),
            save_interval,
        }
    }

    pub fn get(&self, target: &Path) -> Option<&QueueItem> {
        self.items.get(target)
    }

    pub fn get_mut(&mut self, target: &Path) -> Option<&mut QueueItem> {
        self.items.get_mut(target)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Adds a brand-new item, indexing its sources into the per-priority,
    /// per-user lists (`UserQueue::add(QueueItem*)`).
    pub fn add_item(&mut self, item: QueueItem) {
        let target = item.target.clone();
        let priority = item.priority;
        let has_progress = !item.done_segments().is_empty();
        for source in &item.sources {
            self.index_source(priority, source.user, target.clone(), has_progress);
        }
        self.items.insert(target, item);
        self.dirty = true;
    }

    /// Indexes `target` into `user`'s per-priority deque: "Items
    /// with progress move to the front; fresh items to the back."
    fn index_source(&mut self, priority: Priority, user: Cid, target: PathBuf, has_progress: bool) {
        let by_user = self.user_queue.entry(priority).or_default();
        let deque = by_user.entry(user).or_default();
        if deque.contains(&target) {
            return;
        }
        if has_progress {
            deque.push_front(target);
        } else {
            deque.push_back(target);
        }
    }

    /// Adds `user` as a source for an existing item (`UserQueue::add(qi,
    /// user)`), rejecting a user who's already a source.
    pub fn add_source(&mut self, target: &Path, user: Cid, hub: String) -> Result<(), Error> {
        let item = self
            .items
            .get_mut(target)
            .ok_or_else(|| Error::NotFound(target.to_path_buf()))?;
        if item.is_source(&user) {
            return Err(Error::AlreadySource {
                target: target.to_path_buf(),
                user,
            });
        }
        item.add_source(user, hub);
        let priority = item.priority;
        let has_progress = !item.done_segments().is_empty();
        self.index_source(priority, user, target.to_path_buf(), has_progress);
        self.dirty = true;
        Ok(())
    }

    /// Removes `user` from the queue entirely (offline, bad source, etc.),
    /// from every priority list they might be indexed under.
    pub fn remove_user(&mut self, user: &Cid) {
        for by_user in self.user_queue.values_mut() {
            by_user.remove(user);
        }
        if self.running.get(user).is_some() {
            self.running.remove(user);
        }
    }

    /// `UserQueue::getNext`: scans priorities from highest down to
    /// `min_prio`, returning the first candidate with either outstanding
    /// segments or (for user-list items) simply waiting.
    ///
    /// `block_size_of` resolves a queue item's TTH to its known block size;
    /// items without a resolved block size fall back to their full size
    /// (matching the original's `blockSize == 0 => qi->getSize()`).
    pub fn get_next(
        &self,
        user: &Cid,
        min_prio: Priority,
        wanted_size: u64,
        block_size_of: impl Fn(&QueueItem) -> u64,
    ) -> Option<&QueueItem> {
        for &priority in Priority::all_descending().iter() {
            if priority < min_prio {
                break;
            }
            let targets = match self.user_queue.get(&priority).and_then(|m| m.get(user)) {
                Some(t) => t,
                None => continue,
            };
            for target in targets {
                let item = match self.items.get(target) {
                    Some(i) => i,
                    None => continue,
                };
                if !item.is_waiting() {
                    continue;
                }
                if item.flags.contains(ItemFlags::USER_LIST) {
                    return Some(item);
                }
                let block_size = {
                    let bs = block_size_of(item);
                    if bs == 0 {
                        item.size
                    } else {
                        bs
                    }
                };
                if item.next_segment(block_size, wanted_size).is_some() {
                    return Some(item);
                }
            }
        }
        None
    }

    /// Registers `user` as actively downloading `target`, enforcing the
    /// one-download-per-user invariant (`UserQueue::addDownload`'s
    /// `dcassert(running.find(user) == running.end())`).
    pub fn start_download(&mut self, user: Cid, target: PathBuf) {
        debug_assert!(
            !self.running.contains_key(&user),
            "user already has a running download"
        );
        self.running.insert(user, target);
    }

    pub fn running_target(&self, user: &Cid) -> Option<&Path> {
        self.running.get(user).map(PathBuf::as_path)
    }

    pub fn finish_download(&mut self, user: &Cid) {
        self.running.remove(user);
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Saves `Queue.xml` if dirty and at least `save_interval` has elapsed
    /// since the last save.
    pub fn save_if_due(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if !self.dirty || self.last_save.elapsed() < self.save_interval {
            return Ok(None);
        }
        let xml = self.to_xml()?;
        self.dirty = false;
        self.last_save = Instant::now();
        Ok(Some(xml))
    }

    /// Serializes the full queue to the `Queue.xml` shape.
    pub fn to_xml(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            writer.write_event(Event::Decl(quick_xml::events::BytesDecl::new(
                b"1.0",
                Some(b"utf-8"),
                None,
            )))?;
            let mut root = BytesStart::borrowed_name(b"Downloads");
            root.push_attribute(("Version", "1"));
            writer.write_event(Event::Start(root))?;

            for item in self.items.values() {
                let mut dl = BytesStart::borrowed_name(b"Download");
                let target = item.target.to_string_lossy();
                dl.push_attribute(("Target", target.as_ref()));
                let size = item.size.to_string();
                dl.push_attribute(("Size", size.as_str()));
                let priority = (item.priority as u8).to_string();
                dl.push_attribute(("Priority", priority.as_str()));
                let added = item.added.to_string();
                dl.push_attribute(("Added", added.as_str()));
                let tth_str = item.tth.map(|t| t.to_base32());
                if let Some(tth) = &tth_str {
                    dl.push_attribute(("TTH", tth.as_str()));
                }
                let temp = item.temp_target.as_ref().map(|p| p.to_string_lossy().into_owned());
                if let Some(temp) = &temp {
                    dl.push_attribute(("TempTarget", temp.as_str()));
                }
                writer.write_event(Event::Start(dl))?;

                for &(start, len) in item.done_segments() {
                    let mut seg = BytesStart::borrowed_name(b"Segment");
                    let start_s = start.to_string();
                    let len_s = len.to_string();
                    seg.push_attribute(("Start", start_s.as_str()));
                    seg.push_attribute(("Size", len_s.as_str()));
                    writer.write_event(Event::Empty(seg))?;
                }
                for source in &item.sources {
                    let mut src = BytesStart::borrowed_name(b"Source");
                    let cid = source.user.to_base32();
                    src.push_attribute(("CID", cid.as_str()));
                    src.push_attribute(("Hub", source.hub.as_str()));
                    writer.write_event(Event::Empty(src))?;
                }
                writer.write_event(Event::End(BytesEnd::borrowed(b"Download")))?;
            }
            writer.write_event(Event::End(BytesEnd::borrowed(b"Downloads")))?;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item_with_source(target: &str, user: Cid) -> QueueItem {
        let mut item = QueueItem::new(PathBuf::from(target), 100, None, 0);
        item.add_source(user, "hub1".into());
        item
    }

    #[test]
    fn get_next_skips_fully_segmented_items_for_the_same_user() {
        let user = Cid([1; 24]);
        let mut queue = Queue::new(Duration::from_secs(10));
        let mut item = item_with_source("/a", user);
        item.mark_done(0, 100);
        queue.add_item(item);
        assert!(queue.get_next(&user, Priority::Lowest, 1 << 20, |i| i.size).is_none());
    }

    #[test]
    fn one_running_download_per_user_is_enforced() {
        let user = Cid([2; 24]);
        let mut queue = Queue::new(Duration::from_secs(10));
        queue.start_download(user, PathBuf::from("/a"));
        assert_eq!(queue.running_target(&user), Some(Path::new("/a")));
        queue.finish_download(&user);
        assert_eq!(queue.running_target(&user), None);
    }

    #[test]
    fn duplicate_source_is_rejected() {
        let user = Cid([3; 24]);
        let mut queue = Queue::new(Duration::from_secs(10));
        queue.add_item(item_with_source("/a", user));
        let err = queue.add_source(Path::new("/a"), user, "hub1".into());
        assert!(matches!(err, Err(Error::AlreadySource { .. })));
    }

    #[test]
    fn item_with_progress_is_indexed_ahead_of_a_fresh_item() {
        // spec.md §4.5: "Items with progress move to the front; fresh
        // items to the back."
        let user = Cid([4; 24]);
        let mut queue = Queue::new(Duration::from_secs(10));

        let fresh = item_with_source("/fresh", user);
        queue.add_item(fresh);

        let mut partial = item_with_source("/partial", user);
        partial.mark_done(0, 10);
        queue.add_item(partial);

        let next = queue
            .get_next(&user, Priority::Lowest, 1 << 20, |i| i.size)
            .expect("a candidate is available");
        assert_eq!(next.target, PathBuf::from("/partial"));
    }

    #[test]
    fn adding_a_source_with_progress_promotes_an_already_queued_item() {
        let user = Cid([5; 24]);
        let mut queue = Queue::new(Duration::from_secs(10));

        queue.add_item(item_with_source("/fresh", Cid([6; 24])));

        let mut partial = QueueItem::new(PathBuf::from("/partial"), 100, None, 0);
        partial.mark_done(0, 10);
        queue.add_item(partial);
        queue.add_source(Path::new("/fresh"), user, "hub1".into()).unwrap();
        queue.add_source(Path::new("/partial"), user, "hub1".into()).unwrap();

        let next = queue
            .get_next(&user, Priority::Lowest, 1 << 20, |i| i.size)
            .expect("a candidate is available");
        assert_eq!(next.target, PathBuf::from("/partial"));
    }

    #[test]
    fn save_is_skipped_before_the_interval_elapses() {
        let mut queue = Queue::new(Duration::from_secs(0));
        queue.add_item(QueueItem::new(PathBuf::from("/a"), 1, None, 0));
        assert!(queue.save_if_due().unwrap().is_some());

        let mut queue = Queue::new(Duration::from_secs(3600));
        queue.add_item(QueueItem::new(PathBuf::from("/b"), 1, None, 0));
        assert!(queue.save_if_due().unwrap().is_none());
    }
}
