//! The shared-tree `Directory` node.
//!
//! A rooted forest: each [`Directory`] owns its child directories and files
//! directly, with no parent back-pointer — ownership flows down, and
//! lookups walk down from the index's roots rather than up from a node.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::TthValue;

/// One shared file "name, size, optional TTH, optional
/// renamed-realPath".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub size: u64,
    /// Absent until the hash pipeline has produced a root for this file.
    pub tth: Option<TthValue>,
    /// Set when the virtual name collided with a sibling and we appended
    /// `" (N)"`; `real_path` always points at the file's true location.
    pub real_path: PathBuf,
}

/// One directory in the shared tree.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    /// Virtual name, unique among siblings.
    pub name: String,
    /// Real filesystem path this node mirrors, if it corresponds to exactly
    /// one real directory (share roots always do; collision-renamed
    /// directories still point at their one real source).
    pub real_path: Option<PathBuf>,
    /// Child directories, sorted by name (`BTreeMap` keeps them ordered and
    /// gives us the "within a directory, no two siblings share a name"
    /// invariant for free on the directory side).
    pub dirs: BTreeMap<String, Directory>,
    /// Files, sorted by name then renamed-dup index.
    pub files: Vec<File>,
}

impl Directory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            real_path: None,
            dirs: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    /// Total size of every file under this node, recursively.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum::<u64>()
            + self.dirs.values().map(Directory::total_size).sum::<u64>()
    }

    /// Inserts `file`, resolving a name collision with an existing file or
    /// directory by appending `" (N)"` to the virtual name until unique
    ///.
    pub fn insert_file(&mut self, mut file: File) {
        file.name = self.unique_name(&file.name);
        let pos = self
            .files
            .binary_search_by(|f| f.name.as_str().cmp(file.name.as_str()))
            .unwrap_or_else(|e| e);
        self.files.insert(pos, file);
    }

    /// Inserts (or returns the existing) child directory under `name`,
    /// resolving a collision the same way as [`insert_file`].
    pub fn ensure_dir(&mut self, name: &str) -> &mut Directory {
        if !self.dirs.contains_key(name) && !self.file_name_taken(name) {
            self.dirs
                .insert(name.to_string(), Directory::new(name.to_string()));
            return self.dirs.get_mut(name).unwrap();
        }
        if self.dirs.contains_key(name) {
            return self.dirs.get_mut(name).unwrap();
        }
        let unique = self.unique_name(name);
        self.dirs
            .insert(unique.clone(), Directory::new(unique.clone()));
        self.dirs.get_mut(&unique).unwrap()
    }

    fn file_name_taken(&self, name: &str) -> bool {
        self.files.iter().any(|f| f.name == name)
    }

    fn unique_name(&self, name: &str) -> String {
        if !self.dirs.contains_key(name) && !self.file_name_taken(name) {
            return name.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{} ({})", name, n);
            if !self.dirs.contains_key(&candidate) && !self.file_name_taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64) -> File {
        File {
            name: name.to_string(),
            size,
            tth: None,
            real_path: PathBuf::from(format!("/real/{}", name)),
        }
    }

    #[test]
    fn file_dir_name_collision_resolved_with_suffix() {
        // Property 4: no child directory shares a name with a file in the
        // same directory.
        let mut root = Directory::new("root");
        root.insert_file(file("docs", 10));
        root.ensure_dir("docs");
        assert_eq!(root.files[0].name, "docs");
        assert!(root.dirs.contains_key("docs (1)"));
    }

    #[test]
    fn duplicate_file_names_get_numbered_suffixes() {
        let mut root = Directory::new("root");
        root.insert_file(file("a.txt", 1));
        root.insert_file(file("a.txt", 2));
        let names: Vec<_> = root.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "a.txt (1)"]);
    }

    #[test]
    fn total_size_sums_recursively() {
        let mut root = Directory::new("root");
        root.insert_file(file("a", 10));
        let sub = root.ensure_dir("sub");
        sub.insert_file(file("b", 5));
        assert_eq!(root.total_size(), 15);
    }
}
