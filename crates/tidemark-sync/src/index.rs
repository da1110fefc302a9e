//! Path index
//!
//! The authoritative in-memory view of every known path. Entries are kept in a
//! `BTreeMap` keyed by the folded path, so a subtree is one contiguous key
//! range. Folders are also listed by creation time, which is how a folder
//! rename reported as delete + create is recovered.
//!
//! `rename` and `remove` report what they did to an [`IndexObserver`] before
//! returning. The engine passes the debounce queue, which keeps its pending
//! changes in step with the paths they refer to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tidemark_core::domain::{EntryMetadata, LocalPath, PathCase, PathEntry};
use tracing::{debug, trace};

/// Receives structural changes of the index
pub trait IndexObserver {
    /// `removed` holds every entry that was at or under `path`
    fn on_removed(&mut self, path: &LocalPath, removed: &[PathEntry]);

    /// Everything at or under `old` now lives under `new`
    fn on_renamed(&mut self, old: &LocalPath, new: &LocalPath);
}

impl IndexObserver for () {
    fn on_removed(&mut self, _path: &LocalPath, _removed: &[PathEntry]) {}

    fn on_renamed(&mut self, _old: &LocalPath, _new: &LocalPath) {}
}

/// In-memory snapshot of the watched tree
#[derive(Debug, Default)]
pub struct PathIndex {
    case: PathCase,
    entries: BTreeMap<String, PathEntry>,
    folders_by_creation: BTreeMap<DateTime<Utc>, Vec<String>>,
}

impl PathIndex {
    #[must_use]
    pub fn new(case: PathCase) -> Self {
        Self {
            case,
            entries: BTreeMap::new(),
            folders_by_creation: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn case(&self) -> PathCase {
        self.case
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the whole index with a bootstrap snapshot
    pub fn load(&mut self, snapshot: impl IntoIterator<Item = (LocalPath, EntryMetadata)>) {
        self.entries.clear();
        self.folders_by_creation.clear();
        for (path, metadata) in snapshot {
            self.insert(PathEntry::new(path, metadata));
        }
        debug!(entries = self.entries.len(), "Path index loaded");
    }

    #[must_use]
    pub fn get(&self, path: &LocalPath) -> Option<&PathEntry> {
        self.entries.get(&path.key(self.case))
    }

    /// Store or replace the entry at `path`; `None` removes it like [`remove`](Self::remove)
    pub fn set(
        &mut self,
        path: &LocalPath,
        metadata: Option<EntryMetadata>,
        observer: &mut dyn IndexObserver,
    ) -> Option<PathEntry> {
        match metadata {
            Some(metadata) => self.insert(PathEntry::new(path.clone(), metadata)),
            None => {
                let key = path.key(self.case);
                let previous = self.entries.get(&key).cloned();
                self.remove(path, observer);
                previous
            }
        }
    }

    /// Remove `path` and everything beneath it
    pub fn remove(&mut self, path: &LocalPath, observer: &mut dyn IndexObserver) -> Vec<PathEntry> {
        let removed = self.take_subtree(path);
        if !removed.is_empty() {
            trace!(path = %path, count = removed.len(), "Removed subtree from index");
            observer.on_removed(path, &removed);
        }
        removed
    }

    /// Move `old` and all its descendants to `new`
    ///
    /// Whatever was stored under `new` is replaced. Returns the number of
    /// entries moved; nothing is reported when `old` is unknown.
    pub fn rename(
        &mut self,
        old: &LocalPath,
        new: &LocalPath,
        observer: &mut dyn IndexObserver,
    ) -> usize {
        if old == new {
            return 0;
        }
        let moved = self.take_subtree(old);
        if moved.is_empty() {
            return 0;
        }

        let displaced = self.take_subtree(new);
        if !displaced.is_empty() {
            debug!(path = %new, count = displaced.len(), "Rename replaced existing entries");
        }

        let count = moved.len();
        for entry in moved {
            let Some(path) = entry.path.rebase(old, new, self.case) else {
                continue;
            };
            self.insert(PathEntry::new(path, entry.metadata));
        }
        trace!(old = %old, new = %new, count, "Renamed subtree in index");
        observer.on_renamed(old, new);
        count
    }

    /// Whether anything is stored at or under `path`
    #[must_use]
    pub fn contains_subtree(&self, path: &LocalPath) -> bool {
        let key = path.key(self.case);
        self.entries.contains_key(&key) || self.subtree_range(&key).next().is_some()
    }

    /// Entries at or under `path`, parents before children
    #[must_use]
    pub fn enumerate_subtree(&self, path: &LocalPath) -> Vec<&PathEntry> {
        let key = path.key(self.case);
        self.entries
            .get(&key)
            .into_iter()
            .chain(self.subtree_range(&key).map(|(_, entry)| entry))
            .collect()
    }

    /// Folders whose creation time equals `created`
    #[must_use]
    pub fn find_folders_created_at(&self, created: DateTime<Utc>) -> Vec<&PathEntry> {
        self.folders_by_creation
            .get(&created)
            .into_iter()
            .flatten()
            .filter_map(|key| self.entries.get(key))
            .collect()
    }

    // ------------------------------------------------------------------------

    fn insert(&mut self, entry: PathEntry) -> Option<PathEntry> {
        let key = entry.path.key(self.case);
        if entry.metadata.is_folder {
            self.folders_by_creation
                .entry(entry.metadata.created)
                .or_default()
                .push(key.clone());
        }
        let previous = self.entries.insert(key.clone(), entry);
        if let Some(previous) = &previous {
            if previous.metadata.is_folder {
                self.unlist_folder(previous.metadata.created, &key);
            }
        }
        previous
    }

    fn take_subtree(&mut self, path: &LocalPath) -> Vec<PathEntry> {
        let key = path.key(self.case);
        let mut keys: Vec<String> = self.subtree_range(&key).map(|(k, _)| k.clone()).collect();
        if self.entries.contains_key(&key) {
            keys.insert(0, key);
        }

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                if entry.metadata.is_folder {
                    self.unlist_folder(entry.metadata.created, &key);
                }
                removed.push(entry);
            }
        }
        removed
    }

    fn unlist_folder(&mut self, created: DateTime<Utc>, key: &str) {
        if let Some(keys) = self.folders_by_creation.get_mut(&created) {
            // A replaced folder was listed once more by `insert`; drop one copy.
            if let Some(position) = keys.iter().position(|k| k == key) {
                keys.remove(position);
            }
            if keys.is_empty() {
                self.folders_by_creation.remove(&created);
            }
        }
    }

    /// Strict descendants of `key`, in key order
    fn subtree_range<'a>(
        &'a self,
        key: &str,
    ) -> impl Iterator<Item = (&'a String, &'a PathEntry)> + 'a {
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        let root = key.is_empty();
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(prefix.as_str()))
            .filter(move |(k, _)| !root || !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, path};

    #[derive(Default)]
    struct Recorder {
        removed: Vec<(LocalPath, usize)>,
        renamed: Vec<(LocalPath, LocalPath)>,
    }

    impl IndexObserver for Recorder {
        fn on_removed(&mut self, path: &LocalPath, removed: &[PathEntry]) {
            self.removed.push((path.clone(), removed.len()));
        }

        fn on_renamed(&mut self, old: &LocalPath, new: &LocalPath) {
            self.renamed.push((old.clone(), new.clone()));
        }
    }

    fn sample() -> PathIndex {
        let mut index = PathIndex::new(PathCase::Sensitive);
        index.load(vec![
            (path("docs"), EntryMetadata::folder(at(1), at(1))),
            (path("docs/a.txt"), EntryMetadata::file(3, at(2), at(2))),
            (path("docs/sub"), EntryMetadata::folder(at(3), at(3))),
            (path("docs/sub/b.txt"), EntryMetadata::file(4, at(4), at(4))),
            (path("docs-old.txt"), EntryMetadata::file(5, at(5), at(5))),
        ]);
        index
    }

    #[test]
    fn test_enumerate_subtree_respects_segment_boundaries() {
        let index = sample();
        let paths: Vec<_> = index
            .enumerate_subtree(&path("docs"))
            .iter()
            .map(|e| e.path.as_str().to_string())
            .collect();
        assert_eq!(paths, vec!["docs", "docs/a.txt", "docs/sub", "docs/sub/b.txt"]);
        assert!(index.contains_subtree(&path("docs/sub")));
        assert!(!index.contains_subtree(&path("nothing")));
        assert_eq!(index.enumerate_subtree(&LocalPath::root()).len(), 5);
    }

    #[test]
    fn test_remove_takes_descendants_and_notifies() {
        let mut index = sample();
        let mut recorder = Recorder::default();
        let removed = index.remove(&path("docs"), &mut recorder);

        assert_eq!(removed.len(), 4);
        assert_eq!(recorder.removed, vec![(path("docs"), 4)]);
        assert_eq!(index.len(), 1);
        assert!(index.get(&path("docs-old.txt")).is_some());
        assert!(index.find_folders_created_at(at(1)).is_empty());
    }

    #[test]
    fn test_set_none_removes() {
        let mut index = sample();
        let mut recorder = Recorder::default();
        let previous = index.set(&path("docs/a.txt"), None, &mut recorder);
        assert_eq!(previous.map(|e| e.metadata.size), Some(Some(3)));
        assert!(index.get(&path("docs/a.txt")).is_none());
        assert_eq!(recorder.removed.len(), 1);
    }

    #[test]
    fn test_rename_moves_subtree_and_creation_index() {
        let mut index = sample();
        let mut recorder = Recorder::default();
        let moved = index.rename(&path("docs"), &path("archive/docs"), &mut recorder);

        assert_eq!(moved, 4);
        assert_eq!(recorder.renamed, vec![(path("docs"), path("archive/docs"))]);
        assert!(index.get(&path("docs/sub/b.txt")).is_none());
        assert!(index.get(&path("archive/docs/sub/b.txt")).is_some());

        let folders = index.find_folders_created_at(at(3));
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].path, path("archive/docs/sub"));
    }

    #[test]
    fn test_rename_of_unknown_path_is_silent() {
        let mut index = sample();
        let mut recorder = Recorder::default();
        assert_eq!(index.rename(&path("ghost"), &path("elsewhere"), &mut recorder), 0);
        assert!(recorder.renamed.is_empty());
    }

    #[test]
    fn test_replacing_folder_keeps_creation_index_consistent() {
        let mut index = sample();
        index.set(
            &path("docs/sub"),
            Some(EntryMetadata::folder(at(3), at(9))),
            &mut (),
        );
        assert_eq!(index.find_folders_created_at(at(3)).len(), 1);

        index.set(
            &path("docs/sub"),
            Some(EntryMetadata::folder(at(7), at(9))),
            &mut (),
        );
        assert!(index.find_folders_created_at(at(3)).is_empty());
        assert_eq!(index.find_folders_created_at(at(7)).len(), 1);
    }

    #[test]
    fn test_insensitive_keys() {
        let mut index = PathIndex::new(PathCase::Insensitive);
        index.set(
            &path("Docs/Readme.md"),
            Some(EntryMetadata::file(1, at(0), at(0))),
            &mut (),
        );
        assert!(index.get(&path("docs/README.md")).is_some());
        assert!(index.contains_subtree(&path("DOCS")));
    }

    #[test]
    fn test_case_only_rename_respells_subtree() {
        let mut index = PathIndex::new(PathCase::Insensitive);
        index.set(&path("Docs"), Some(EntryMetadata::folder(at(0), at(0))), &mut ());
        index.set(
            &path("Docs/Readme.md"),
            Some(EntryMetadata::file(1, at(0), at(0))),
            &mut (),
        );

        assert_eq!(index.rename(&path("Docs"), &path("docs"), &mut ()), 2);
        let spelled: Vec<&str> = index
            .enumerate_subtree(&path("DOCS"))
            .iter()
            .map(|entry| entry.path.as_str())
            .collect();
        assert_eq!(spelled, vec!["docs", "docs/Readme.md"]);
    }
}
