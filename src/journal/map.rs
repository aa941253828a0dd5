//! Persistent file-reference-number map: `(rid, frn) -> (name, parent_frn)`
//! (§4.1, §3 "Change-journal state").

use std::collections::HashMap;
use std::path::PathBuf;

/// `parent_frn` for a volume root entry (§3).
pub const SENTINEL_ROOT: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrnEntry {
    pub name: String,
    pub parent_frn: u64,
}

/// Failure reconstructing a path from the map: either an ancestor link is
/// missing, in which case the caller should retry once via an OS by-FRN
/// lookup before giving up (§4.1 "Path reconstruction").
#[derive(Debug, PartialEq, Eq)]
pub enum PathLookupError {
    MissingAncestor(u64),
}

/// One volume's FRN map. `rid` identifies the root/volume this map
/// belongs to; frn keys are volume-local.
#[derive(Debug, Default)]
pub struct FrnMap {
    entries: HashMap<u64, FrnEntry>,
}

impl FrnMap {
    pub fn new() -> Self {
        FrnMap::default()
    }

    pub fn insert(&mut self, frn: u64, name: impl Into<String>, parent_frn: u64) {
        self.entries.insert(
            frn,
            FrnEntry {
                name: name.into(),
                parent_frn,
            },
        );
    }

    pub fn get(&self, frn: u64) -> Option<&FrnEntry> {
        self.entries.get(&frn)
    }

    pub fn contains(&self, frn: u64) -> bool {
        self.entries.contains_key(&frn)
    }

    pub fn remove(&mut self, frn: u64) -> Option<FrnEntry> {
        self.entries.remove(&frn)
    }

    /// Remove `frn` and every descendant transitively parented under it
    /// (§4.1 `FILE_DELETE` on a directory: "delete entry and all
    /// descendants recursively").
    pub fn remove_recursive(&mut self, frn: u64) -> Vec<u64> {
        let mut removed = Vec::new();
        let mut stack = vec![frn];
        while let Some(current) = stack.pop() {
            let children: Vec<u64> = self
                .entries
                .iter()
                .filter(|(_, e)| e.parent_frn == current)
                .map(|(&frn, _)| frn)
                .collect();
            stack.extend(children);
            if self.entries.remove(&current).is_some() {
                removed.push(current);
            }
        }
        removed
    }

    /// §4.1 "Path reconstruction": walk `frn -> parent_frn` upward to the
    /// volume root. Returns `Err` naming the first missing ancestor if the
    /// walk breaks.
    pub fn reconstruct_path(&self, frn: u64) -> Result<PathBuf, PathLookupError> {
        let mut components = Vec::new();
        let mut current = frn;
        loop {
            let entry = self
                .entries
                .get(&current)
                .ok_or(PathLookupError::MissingAncestor(current))?;
            components.push(entry.name.clone());
            if entry.parent_frn == SENTINEL_ROOT {
                break;
            }
            current = entry.parent_frn;
        }
        components.reverse();
        Ok(components.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstruct_path_walks_to_root() {
        let mut map = FrnMap::new();
        map.insert(1, "docs", SENTINEL_ROOT);
        map.insert(2, "report.pdf", 1);
        assert_eq!(map.reconstruct_path(2).unwrap(), PathBuf::from("docs/report.pdf"));
    }

    #[test]
    fn reconstruct_path_reports_missing_ancestor() {
        let mut map = FrnMap::new();
        map.insert(2, "report.pdf", 1);
        assert_eq!(
            map.reconstruct_path(2),
            Err(PathLookupError::MissingAncestor(1))
        );
    }

    #[test]
    fn remove_recursive_drops_descendants() {
        let mut map = FrnMap::new();
        map.insert(1, "docs", SENTINEL_ROOT);
        map.insert(2, "sub", 1);
        map.insert(3, "file.txt", 2);
        let removed = map.remove_recursive(1);
        assert_eq!(removed.len(), 3);
        assert!(!map.contains(1));
        assert!(!map.contains(2));
        assert!(!map.contains(3));
    }
}
