//! `QueueItem`: one target download, its completed segments and sources
//!.

use std::path::PathBuf;

use bitflags::bitflags;

use crate::{Cid, TthValue};

/// Download priority, lowest to highest "`PAUSED`..`HIGHEST`,
/// plus `DEFAULT` and `LOWEST`".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[repr(u8)]
pub enum Priority {
    Paused = 0,
    Lowest = 1,
    Low = 2,
    Normal = 3,
    High = 4,
    Highest = 5,
}

impl Priority {
    pub const DEFAULT: Priority = Priority::Normal;

    pub fn all_descending() -> [Priority; 5] {
        [
            Priority::Highest,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Lowest,
        ]
    }
}

bitflags! {
    /// Flags on a `QueueItem`.
    pub struct ItemFlags: u32 {
        const USER_LIST         = 0b0000_0001;
        const CLIENT_VIEW       = 0b0000_0010;
        const TEXT              = 0b0000_0100;
        const XML_BZLIST        = 0b0000_1000;
        const MATCH_QUEUE       = 0b0001_0000;
        const DIRECTORY_DOWNLOAD = 0b0010_0000;
    }
}

bitflags! {
    /// Per-source flags.
    pub struct SourceFlags: u32 {
        const FILE_NOT_AVAILABLE = 0b0000_0001;
        const PASSIVE            = 0b0000_0010;
        const BAD_TREE           = 0b0000_0100;
        const SLOW_SOURCE        = 0b0000_1000;
        const NO_TREE            = 0b0001_0000;
        const NO_TTHF            = 0b0010_0000;
        const CRC_FAILED         = 0b0100_0000;
        const UNTRUSTED          = 0b1000_0000;
        const UNENCRYPTED        = 0b1_0000_0000;
    }
}

/// A user (and the hub we last saw them on) offering a `QueueItem`.
#[derive(Clone, Debug)]
pub struct Source {
    pub user: Cid,
    pub hub: String,
    pub flags: SourceFlags,
}

/// The transfer kind an active `Download`/`Upload` carries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferType {
    File,
    FullList,
    PartialList,
    Tree,
}

/// Outcome of [`QueueItem::on_tree_complete`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TreeCompletion {
    Verified,
    BadTree,
}

/// Outcome of [`QueueItem::on_file_complete`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileCompletion {
    Verified,
    CrcFailed,
}

/// One target download: path, size, TTH, priority, completed byte
/// segments, and sources.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub target: PathBuf,
    pub temp_target: Option<PathBuf>,
    pub size: u64,
    pub tth: Option<TthValue>,
    pub priority: Priority,
    pub flags: ItemFlags,
    pub added: u64,
    /// Non-overlapping `[start, start+len)` byte ranges already on disk.
    done: Vec<(u64, u64)>,
    pub sources: Vec<Source>,
    pub bad_sources: Vec<Source>,
}

impl QueueItem {
    pub fn new(target: PathBuf, size: u64, tth: Option<TthValue>, added: u64) -> Self {
        Self {
            target,
            temp_target: None,
            size,
            tth,
            priority: Priority::DEFAULT,
            flags: ItemFlags::empty(),
            added,
            done: Vec::new(),
            sources: Vec::new(),
            bad_sources: Vec::new(),
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.done.iter().map(|(_, len)| *len).sum()
    }

    pub fn is_finished(&self) -> bool {
        self.downloaded_bytes() == self.size
    }

    pub fn is_waiting(&self) -> bool {
        !self.is_finished()
    }

    pub fn done_segments(&self) -> &[(u64, u64)] {
        &self.done
    }

    /// Marks `[start, start+len)` as complete, merging with adjacent
    /// segments. Panics (via `debug_assert`) on an overlap, since the
    /// scheduler is responsible for never handing out overlapping windows
    ///.
    pub fn mark_done(&mut self, start: u64, len: u64) {
        debug_assert!(
            !self
                .done
                .iter()
                .any(|&(s, l)| ranges_overlap(s, l, start, len)),
            "overlapping segment marked done"
        );
        self.done.push((start, len));
        self.done.sort_by_key(|&(s, _)| s);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.done.len());
        for (s, l) in self.done.drain(..) {
            if let Some(last) = merged.last_mut() {
                let (ls, ll): &mut (u64, u64) = last;
                if *ls + *ll == s {
                    *ll += l;
                    continue;
                }
            }
            merged.push((s, l));
        }
        self.done = merged;
    }

    pub fn is_source(&self, user: &Cid) -> bool {
        self.sources.iter().any(|s| &s.user == user)
    }

    pub fn add_source(&mut self, user: Cid, hub: String) {
        if !self.is_source(&user) {
            self.sources.push(Source {
                user,
                hub,
                flags: SourceFlags::empty(),
            });
        }
    }

    pub fn flag_source(&mut self, user: &Cid, flag: SourceFlags) {
        if let Some(pos) = self.sources.iter().position(|s| &s.user == user) {
            let mut source = self.sources.remove(pos);
            source.flags |= flag;
            self.bad_sources.push(source);
        }
    }

    /// `QueueManager::treeCompleted`: on a completed `TREE` download,
    /// `computed_root` is the root recomputed at the promoted block size.
    /// A mismatch against this item's requested TTH flags `user` `BAD_TREE`,
    /// removes them as a source, and requeues (the caller tries the next
    /// source) "if the computed root != requested TTH, flag the
    /// source BAD_TREE, remove the source, and requeue".
    pub fn on_tree_complete(&mut self, user: &Cid, computed_root: TthValue) -> TreeCompletion {
        if self.tth.map(|t| t.0) == Some(computed_root.0) {
            return TreeCompletion::Verified;
        }
        log::warn!(
            "{:?}: {}",
            self.target,
            super::io::format_mismatch("tth", &self.tth.map(|t| t.0).unwrap_or_default(), &computed_root.0)
        );
        self.flag_source(user, SourceFlags::BAD_TREE);
        TreeCompletion::BadTree
    }

    /// `QueueManager::hashDone`/`checkSFV`: on a completed `FILE` download,
    /// `computed_crc32` is the CRC-32 of the finished temp file and
    /// `expected_crc32` is what an `.sfv` sibling (if any) names for it. A
    /// mismatch deletes the temp (the caller's responsibility — this only
    /// updates item state), resets segments, pauses the item, and flags
    /// every current source `CRC_FAILED` "on mismatch, delete the
    /// temp, reset segments, pause item, flag every source CRC_FAILED".
    pub fn on_file_complete(&mut self, computed_crc32: u32, expected_crc32: Option<u32>) -> FileCompletion {
        match expected_crc32 {
            Some(expected) if expected != computed_crc32 => {
                log::warn!(
                    "{:?}: {}",
                    self.target,
                    super::io::format_mismatch(
                        "crc32",
                        &expected.to_be_bytes(),
                        &computed_crc32.to_be_bytes()
                    )
                );
                self.done.clear();
                self.priority = Priority::Paused;
                let bad_users: Vec<Cid> = self.sources.iter().map(|s| s.user).collect();
                for user in bad_users {
                    self.flag_source(&user, SourceFlags::CRC_FAILED);
                }
                FileCompletion::CrcFailed
            }
            _ => FileCompletion::Verified,
        }
    }

    /// Picks the next free, block-aligned window of at most `wanted_size`
    /// bytes, or `None` if no segment is currently available.
    pub fn next_segment(&self, block_size: u64, wanted_size: u64) -> Option<(u64, u64)> {
        if block_size == 0 || self.size == 0 {
            return None;
        }
        let mut cursor = 0u64;
        for &(start, len) in &self.done {
            if start > cursor {
                let gap = start - cursor;
                if let Some(seg) = Self::fit_segment(cursor, gap, block_size, wanted_size, self.size)
                {
                    return Some(seg);
                }
            }
            cursor = cursor.max(start + len);
        }
        if cursor < self.size {
            let gap = self.size - cursor;
            return Self::fit_segment(cursor, gap, block_size, wanted_size, self.size);
        }
        None
    }

    fn fit_segment(
        start: u64,
        gap: u64,
        block_size: u64,
        wanted_size: u64,
        file_size: u64,
    ) -> Option<(u64, u64)> {
        if gap == 0 {
            return None;
        }
        let want = gap.min(wanted_size);
        let reaches_end = start + want == file_size;
        if reaches_end {
            return Some((start, want));
        }
        let rounded = (want / block_size) * block_size;
        if rounded == 0 {
            return None;
        }
        Some((start, rounded))
    }
}

fn ranges_overlap(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_done_never_leaves_overlap() {
        // Property 2: no QueueItem has overlapping segments.
        let mut item = QueueItem::new(PathBuf::from("/x"), 3 << 20, None, 0);
        item.mark_done(0, 1 << 20);
        item.mark_done(2 << 20, 1 << 20);
        let segs = item.done_segments();
        for i in 0..segs.len() {
            for j in (i + 1)..segs.len() {
                assert!(!ranges_overlap(segs[i].0, segs[i].1, segs[j].0, segs[j].1));
            }
        }
    }

    #[test]
    fn segment_reassembly_picks_the_middle_gap() {
        // E4: QueueItem of 3 MiB with done=[0,1MiB)u[2MiB,3MiB);
        // getNextSegment(64KiB, 1MiB) returns [1MiB,2MiB).
        let mut item = QueueItem::new(PathBuf::from("/x"), 3 << 20, None, 0);
        item.mark_done(0, 1 << 20);
        item.mark_done(2 << 20, 1 << 20);
        let seg = item.next_segment(64 << 10, 1 << 20).unwrap();
        assert_eq!(seg, (1 << 20, 1 << 20));
    }

    #[test]
    fn finished_when_done_covers_whole_size() {
        let mut item = QueueItem::new(PathBuf::from("/x"), 10, None, 0);
        assert!(!item.is_finished());
        item.mark_done(0, 10);
        assert!(item.is_finished());
    }

    #[test]
    fn adjacent_segments_merge() {
        let mut item = QueueItem::new(PathBuf::from("/x"), 10, None, 0);
        item.mark_done(0, 5);
        item.mark_done(5, 5);
        assert_eq!(item.done_segments(), &[(0, 10)]);
    }

    #[test]
    fn tree_completion_with_matching_root_keeps_the_source() {
        let tth = TthValue([7u8; 24]);
        let user = Cid([1; 24]);
        let mut item = QueueItem::new(PathBuf::from("/x"), 100, Some(tth), 0);
        item.add_source(user, "hub1".into());
        assert_eq!(item.on_tree_complete(&user, tth), TreeCompletion::Verified);
        assert!(item.is_source(&user));
        assert!(item.bad_sources.is_empty());
    }

    #[test]
    fn tree_completion_mismatch_flags_bad_tree_and_drops_the_source() {
        let tth = TthValue([7u8; 24]);
        let wrong_root = TthValue([9u8; 24]);
        let user = Cid([2; 24]);
        let mut item = QueueItem::new(PathBuf::from("/x"), 100, Some(tth), 0);
        item.add_source(user, "hub1".into());
        assert_eq!(item.on_tree_complete(&user, wrong_root), TreeCompletion::BadTree);
        assert!(!item.is_source(&user));
        assert!(item.bad_sources[0].flags.contains(SourceFlags::BAD_TREE));
    }

    #[test]
    fn file_completion_with_no_sfv_entry_is_verified() {
        let mut item = QueueItem::new(PathBuf::from("/x"), 10, None, 0);
        item.mark_done(0, 10);
        assert_eq!(item.on_file_complete(0xDEADBEEF, None), FileCompletion::Verified);
        assert!(item.is_finished());
    }

    #[test]
    fn file_completion_crc_mismatch_resets_segments_pauses_and_flags_every_source() {
        let user_a = Cid([3; 24]);
        let user_b = Cid([4; 24]);
        let mut item = QueueItem::new(PathBuf::from("/x"), 10, None, 0);
        item.add_source(user_a, "hub1".into());
        item.add_source(user_b, "hub2".into());
        item.mark_done(0, 10);

        let outcome = item.on_file_complete(0x1111, Some(0x2222));
        assert_eq!(outcome, FileCompletion::CrcFailed);
        assert!(!item.is_finished());
        assert_eq!(item.priority, Priority::Paused);
        assert!(item.sources.is_empty());
        assert_eq!(item.bad_sources.len(), 2);
        assert!(item
            .bad_sources
            .iter()
            .all(|s| s.flags.contains(SourceFlags::CRC_FAILED)));
    }
}
