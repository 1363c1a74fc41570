//! Substring/extension/TTH search over the shared tree.

use crate::share::dir::Directory;
use crate::TthValue;

/// A single shared-index search, built from either the legacy NMDC
/// parameters or the list of 2-letter ADC fields "Two entry
/// points: legacy ... and modern".
#[derive(Clone, Debug, Default)]
pub struct SearchQuery {
    /// TTH-only query: at most one result, the indexed file itself.
    pub root: Option<TthValue>,
    /// Whole tokens that must all match (directory name or file name).
    pub include: Vec<String>,
    /// Tokens that, if matched against a name, exclude that node.
    pub exclude: Vec<String>,
    /// Required file extensions (lowercase, no leading dot). Empty means any.
    pub ext: Vec<String>,
    pub size_min: u64,
    pub size_max: u64,
    /// Restrict results to directories only.
    pub is_directory: bool,
}

/// One matched entry, file or directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    pub is_directory: bool,
    pub size: u64,
    pub full_path: String,
    pub tth: Option<TthValue>,
}

fn matches(token: &str, name: &str) -> bool {
    name.to_lowercase().contains(&token.to_lowercase())
}

fn has_ext(query: &SearchQuery, name: &str) -> bool {
    if query.ext.is_empty() {
        return true;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) => query.ext.iter().any(|e| e.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

/// Recursively matches `dir` (at virtual path `prefix`) against `query`,
/// appending hits to `results` up to `max_results`. Mirrors
/// `ShareManager::Directory::search`: a term matched against the directory
/// name is removed from the set carried into descendants, but not from the
/// set used by siblings.
fn search_dir(
    dir: &Directory,
    prefix: &str,
    query: &SearchQuery,
    results: &mut Vec<SearchResult>,
    max_results: usize,
) {
    if query.exclude.iter().any(|term| matches(term, &dir.name)) {
        return;
    }

    let full_path = format!("{}{}/", prefix, dir.name);

    let remaining: Vec<String> = query
        .include
        .iter()
        .filter(|term| !matches(term, &dir.name))
        .cloned()
        .collect();

    if remaining.is_empty() && query.ext.is_empty() && query.size_min == 0 {
        results.push(SearchResult {
            is_directory: true,
            size: dir.total_size(),
            full_path: full_path.clone(),
            tth: None,
        });
        if results.len() >= max_results {
            return;
        }
    }

    let mut child_query = query.clone();
    child_query.include = remaining;

    if !query.is_directory {
        for file in &dir.files {
            if file.tth.is_none() {
                continue;
            }
            if file.size < query.size_min || (query.size_max != 0 && file.size > query.size_max) {
                continue;
            }
            if query.exclude.iter().any(|term| matches(term, &file.name)) {
                continue;
            }
            if !child_query
                .include
                .iter()
                .all(|term| matches(term, &file.name))
            {
                continue;
            }
            if !has_ext(&child_query, &file.name) {
                continue;
            }
            results.push(SearchResult {
                is_directory: false,
                size: file.size,
                full_path: format!("{}{}", full_path, file.name),
                tth: file.tth,
            });
            if results.len() >= max_results {
                return;
            }
        }
    }

    for child in dir.dirs.values() {
        search_dir(child, &full_path, &child_query, results, max_results);
        if results.len() >= max_results {
            return;
        }
    }
}

/// Runs `query` over every top-level directory in `roots`, respecting the
/// caller-supplied result cap "typically 5 for passive, 10 for
/// active".
pub fn search(roots: &[Directory], query: &SearchQuery, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();
    for root in roots {
        search_dir(root, "/", query, &mut results, max_results);
        if results.len() >= max_results {
            break;
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::dir::File;
    use std::path::PathBuf;

    fn file(name: &str, size: u64, tth: Option<TthValue>) -> File {
        File {
            name: name.to_string(),
            size,
            tth,
            real_path: PathBuf::from("/x"),
        }
    }

    fn sample_tree() -> Vec<Directory> {
        let mut root = Directory::new("music");
        root.insert_file(file("song.flac", 100, Some(TthValue([1; 24]))));
        let sub = root.ensure_dir("live");
        sub.insert_file(file("bootleg.mp3", 50, Some(TthValue([2; 24]))));
        vec![root]
    }

    #[test]
    fn substring_query_matches_file_by_token() {
        let roots = sample_tree();
        let query = SearchQuery {
            include: vec!["song".into()],
            ..Default::default()
        };
        let results = search(&roots, &query, 10);
        assert_eq!(results.len(), 1);
        assert!(results[0].full_path.ends_with("song.flac"));
    }

    #[test]
    fn extension_filter_excludes_non_matching() {
        let roots = sample_tree();
        let query = SearchQuery {
            ext: vec!["mp3".into()],
            ..Default::default()
        };
        let results = search(&roots, &query, 10);
        assert_eq!(results.len(), 1);
        assert!(results[0].full_path.ends_with("bootleg.mp3"));
    }

    #[test]
    fn term_matched_on_directory_name_descends_without_requiring_it_again() {
        let roots = sample_tree();
        let query = SearchQuery {
            include: vec!["live".into()],
            ..Default::default()
        };
        let results = search(&roots, &query, 10);
        // "live" matches the directory itself (emitted) and its file
        // inherits an empty remaining-term set so it also matches.
        assert!(results.iter().any(|r| r.is_directory));
        assert!(results.iter().any(|r| r.full_path.ends_with("bootleg.mp3")));
    }

    #[test]
    fn exclusion_term_drops_subtree() {
        let roots = sample_tree();
        let query = SearchQuery {
            include: vec![],
            exclude: vec!["live".into()],
            ..Default::default()
        };
        let results = search(&roots, &query, 10);
        assert!(!results.iter().any(|r| r.full_path.contains("live")));
    }

    #[test]
    fn result_cap_is_enforced() {
        let mut root = Directory::new("many");
        for i in 0..20 {
            root.insert_file(file(&format!("f{}.bin", i), 1, Some(TthValue([i as u8; 24]))));
        }
        let results = search(&[root], &SearchQuery::default(), 5);
        assert_eq!(results.len(), 5);
    }
}
