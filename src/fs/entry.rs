use std::collections::HashSet;
use std::sync::Arc;

use crate::zip::{EntryType, ZipEntry};

/// Insertion-order preserving set of member names.
#[derive(Debug, Default, Clone)]
pub struct OrderedSet {
    order: Vec<String>,
    set: HashSet<String>,
}

impl OrderedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the name was already present.
    pub fn insert(&mut self, name: &str) -> bool {
        if self.set.insert(name.to_string()) {
            self.order.push(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        if self.set.remove(name) {
            self.order.retain(|n| n != name);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.set.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Backing data for one realized type of a covariant entry.
#[derive(Debug, Clone)]
pub enum FsEntryData {
    /// Snapshot published by the mounted codec. The snapshot itself is
    /// immutable; a changed modification time is carried alongside until
    /// the next sync writes it out.
    Published {
        entry: Arc<ZipEntry>,
        mtime_override: Option<i64>,
    },
    /// Content staged in memory, pending sync.
    Staged {
        data: Arc<Vec<u8>>,
        mtime: Option<i64>,
    },
    /// Synthesized entry without archive backing (implicit directories and
    /// the virtual root).
    Virtual { mtime: Option<i64> },
}

impl FsEntryData {
    pub fn size(&self) -> u64 {
        match self {
            FsEntryData::Published { entry, .. } => entry.uncompressed_size(),
            FsEntryData::Staged { data, .. } => data.len() as u64,
            FsEntryData::Virtual { .. } => 0,
        }
    }
}

/// A logical path that may simultaneously be realized as several entry
/// types across overlaid file systems.
///
/// While a structural change is in flight, a directory and a same-named
/// file can coexist; the current "key" type selects which one plain
/// operations see. Directory-typed instances carry the member-name set.
#[derive(Debug, Clone)]
pub struct CovariantEntry {
    name: String,
    key: EntryType,
    entries: Vec<(EntryType, FsEntryData)>,
    members: Option<OrderedSet>,
}

impl CovariantEntry {
    pub fn new(name: String, kind: EntryType, data: FsEntryData) -> Self {
        let members = (kind == EntryType::Directory).then(OrderedSet::new);
        Self {
            name,
            key: kind,
            entries: vec![(kind, data)],
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The currently selected type.
    pub fn key(&self) -> EntryType {
        self.key
    }

    pub fn has(&self, kind: EntryType) -> bool {
        self.entries.iter().any(|(k, _)| *k == kind)
    }

    /// All realized types, in the order they appeared.
    pub fn types(&self) -> Vec<EntryType> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn get(&self, kind: EntryType) -> Option<&FsEntryData> {
        self.entries.iter().find(|(k, _)| *k == kind).map(|(_, d)| d)
    }

    pub fn get_mut(&mut self, kind: EntryType) -> Option<&mut FsEntryData> {
        self.entries
            .iter_mut()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d)
    }

    /// The data selected by the key type.
    pub fn data(&self) -> &FsEntryData {
        self.get(self.key).expect("key type is always realized")
    }

    /// Insert or replace the data for one type and select it.
    pub fn put(&mut self, kind: EntryType, data: FsEntryData) {
        match self.entries.iter_mut().find(|(k, _)| *k == kind) {
            Some(slot) => slot.1 = data,
            None => self.entries.push((kind, data)),
        }
        if kind == EntryType::Directory && self.members.is_none() {
            self.members = Some(OrderedSet::new());
        }
        self.key = kind;
    }

    /// Remove one realized type. Returns false when the entry has no
    /// remaining type and should be dropped from the tree.
    pub fn remove(&mut self, kind: EntryType) -> bool {
        self.entries.retain(|(k, _)| *k != kind);
        if kind == EntryType::Directory {
            self.members = None;
        }
        match self.entries.first() {
            Some((k, _)) => {
                if self.key == kind {
                    self.key = *k;
                }
                true
            }
            None => false,
        }
    }

    /// Member names; present only while a directory type is realized.
    pub fn members(&self) -> Option<&OrderedSet> {
        self.members.as_ref()
    }

    pub fn members_mut(&mut self) -> Option<&mut OrderedSet> {
        self.members.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_set_preserves_insertion_order() {
        let mut set = OrderedSet::new();
        assert!(set.insert("c"));
        assert!(set.insert("a"));
        assert!(!set.insert("c"));
        assert!(set.insert("b"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["c", "a", "b"]);
        assert!(set.remove("a"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["c", "b"]);
    }

    #[test]
    fn file_and_directory_coexist_transiently() {
        let mut entry = CovariantEntry::new(
            "doc".into(),
            EntryType::File,
            FsEntryData::Staged {
                data: Arc::new(b"x".to_vec()),
                mtime: None,
            },
        );
        entry.put(EntryType::Directory, FsEntryData::Virtual { mtime: None });
        assert_eq!(entry.key(), EntryType::Directory);
        assert_eq!(entry.types(), vec![EntryType::File, EntryType::Directory]);
        assert!(entry.members().is_some());

        assert!(entry.remove(EntryType::Directory));
        assert_eq!(entry.key(), EntryType::File);
        assert!(entry.members().is_none());
        assert!(!entry.remove(EntryType::File));
    }
}
