use log::debug;
use lru::LruCache;
use std::num::NonZeroUsize;

use crate::index_root::IndexRoot;

pub const DEFAULT_CAPACITY: usize = 50;

/// Resolved directory indexes keyed by normalised path, least recently used
/// evicted first.
#[derive(Debug)]
pub struct PathIndexCache {
    cache: LruCache<String, IndexRoot>,
    hits: u64,
}

impl PathIndexCache {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            hits: 0,
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Presence check; neither counts as a hit nor refreshes the entry.
    pub fn contains(&self, path: &str) -> bool {
        self.cache.contains(path)
    }

    /// Fetch and refresh `path`, counting a hit.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut IndexRoot> {
        let hit = self.cache.get_mut(path);
        if hit.is_some() {
            self.hits += 1;
            debug!("path cache: hit for {:?} ({} so far)", path, self.hits);
        }
        hit
    }

    /// Cache `root` under `path` and hand it back. Keeps the cached root
    /// when `path` is already present.
    pub fn insert(&mut self, path: String, root: IndexRoot) -> &mut IndexRoot {
        if self.cache.len() == self.capacity() && !self.cache.contains(&path) {
            if let Some((lru, _)) = self.cache.peek_lru() {
                debug!("path cache: evicting {:?}", lru);
            }
        }
        self.cache.get_or_insert_mut(path, || root)
    }
}

impl Default for PathIndexCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Path components, case-folded, with any drive prefix (`C:`) dropped and
/// both separators accepted. Root is the empty list.
pub fn components(path: &str) -> Vec<String> {
    let path = match path.as_bytes() {
        [d, b':', ..] if d.is_ascii_alphabetic() => &path[2..],
        _ => path,
    };
    path.split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_lowercase)
        .collect()
}

/// Cache key of a list of components: `/` for root, `/a/b` otherwise.
pub fn normalize(components: &[String]) -> String {
    format!("/{}", components.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_name::NS_WIN32;
    use crate::test_support::{index_entry, index_root_value};

    fn root() -> IndexRoot {
        let mut raw = index_entry(Some((64, "a", NS_WIN32)), None, false);
        raw.extend(index_entry(None, None, true));
        IndexRoot::from_bytes(&index_root_value(&raw, false, 4096)).unwrap()
    }

    #[test]
    fn components_fold_case_and_separators() {
        assert_eq!(components("C:\\Windows\\System32"), ["windows", "system32"]);
        assert_eq!(components("/d1//Foo.TXT"), ["d1", "foo.txt"]);
        assert!(components("/").is_empty());
        assert!(components("").is_empty());
        assert_eq!(normalize(&components("\\D1\\")), "/d1");
        assert_eq!(normalize(&[]), "/");
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let mut cache = PathIndexCache::new(2);
        cache.insert("/a".into(), root());
        cache.insert("/b".into(), root());
        assert!(cache.get_mut("/a").is_some());
        cache.insert("/c".into(), root());
        assert!(cache.contains("/a"));
        assert!(!cache.contains("/b"));
        assert!(cache.contains("/c"));
        assert_eq!(cache.hits(), 1);
        assert!(cache.get_mut("/b").is_none());
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn default_capacity() {
        assert_eq!(PathIndexCache::default().capacity(), 50);
        assert_eq!(PathIndexCache::new(0).capacity(), 1);
    }
}
