use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{NtfsError, Result};
use crate::file_name::FileName;
use crate::index::DirectoryIndexNode;
use crate::index_root::{DEFAULT_MAX_DEPTH, IndexRoot};
use crate::mft::MftEntry;
use crate::path_cache::{DEFAULT_CAPACITY, PathIndexCache, components, normalize};
use crate::volume::Volume;

/// MFT record of the root directory.
pub const ROOT_RECORD: u64 = 5;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FsConfig {
    /// Directory indexes kept by the path cache.
    pub index_cache_size: usize,
    /// Deepest B+-tree descent before a lookup gives up.
    pub max_index_depth: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            index_cache_size: DEFAULT_CAPACITY,
            max_index_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// stat-like view of a path, taken from its directory entry.
#[derive(Debug, Clone, Serialize)]
pub struct FileStat {
    pub record: u64,
    pub name: String,
    pub directory: bool,
    pub size: u64,
    pub allocated: u64,
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub links: u16,
}

/// Path based, read-only access to a volume.
pub struct FileSystem<V: Volume> {
    volume: V,
    config: FsConfig,
    root: IndexRoot,
    cache: PathIndexCache,
}

impl<V: Volume> FileSystem<V> {
    pub fn new(volume: V) -> Result<Self> {
        Self::with_config(volume, FsConfig::default())
    }

    pub fn with_config(mut volume: V, config: FsConfig) -> Result<Self> {
        let entry = volume.mft_entry(ROOT_RECORD)?;
        let mut root = entry
            .into_index_root(&mut volume)?
            .ok_or_else(|| NtfsError::NotFound("index of the root directory".into()))?;
        root.set_max_depth(config.max_index_depth);
        let cache = PathIndexCache::new(config.index_cache_size);
        Ok(Self {
            volume,
            config,
            root,
            cache,
        })
    }

    pub fn volume(&mut self) -> &mut V {
        &mut self.volume
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Directory indexes served from the path cache so far.
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    /// Index of the directory at `path`. `None` when it does not exist or
    /// is not a directory.
    pub fn get_dir(&mut self, path: &str) -> Result<Option<&mut IndexRoot>> {
        let comps = components(path);
        get_index(
            &mut self.volume,
            &mut self.root,
            &mut self.cache,
            self.config.max_index_depth,
            &comps,
        )
    }

    /// Directory entry naming `path`. The root has none.
    pub fn get_file(&mut self, path: &str) -> Result<Option<DirectoryIndexNode>> {
        let comps = components(path);
        let Some((name, parent)) = comps.split_last() else {
            return Ok(None);
        };
        let depth = self.config.max_index_depth;
        match get_index(&mut self.volume, &mut self.root, &mut self.cache, depth, parent)? {
            Some(dir) => Ok(dir.find(&mut self.volume, name)),
            None => Ok(None),
        }
    }

    /// MFT record of `path`.
    pub fn lookup(&mut self, path: &str) -> Result<Option<MftEntry>> {
        if components(path).is_empty() {
            return self.volume.mft_entry(ROOT_RECORD).map(Some);
        }
        match self.get_file(path)? {
            Some(node) => node.resolve(&mut self.volume),
            None => Ok(None),
        }
    }

    pub fn dir_entries(&mut self, path: &str) -> Result<Vec<String>> {
        let comps = components(path);
        let depth = self.config.max_index_depth;
        match get_index(&mut self.volume, &mut self.root, &mut self.cache, depth, &comps)? {
            Some(dir) => Ok(dir.glob_names(&mut self.volume).to_vec()),
            None => Err(NtfsError::NotFound(path.to_string())),
        }
    }

    pub fn dir_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.get_dir(path)?.is_some())
    }

    pub fn file_exists(&mut self, path: &str) -> Result<bool> {
        if components(path).is_empty() {
            return Ok(true);
        }
        Ok(self.get_file(path)?.is_some())
    }

    pub fn is_directory(&mut self, path: &str) -> Result<bool> {
        Ok(self.lookup(path)?.is_some_and(|e| e.is_directory()))
    }

    pub fn is_file(&mut self, path: &str) -> Result<bool> {
        Ok(self.lookup(path)?.is_some_and(|e| !e.is_directory()))
    }

    /// Size recorded in the directory entry.
    pub fn file_size(&mut self, path: &str) -> Result<u64> {
        Ok(self.file_name(path)?.length())
    }

    pub fn file_atime(&mut self, path: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.file_name(path)?.a_time())
    }

    pub fn file_mtime(&mut self, path: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.file_name(path)?.m_time())
    }

    /// Creation time.
    pub fn file_ctime(&mut self, path: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.file_name(path)?.c_time())
    }

    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        let node = self
            .get_file(path)?
            .ok_or_else(|| NtfsError::NotFound(path.to_string()))?;
        let fname = node
            .file_name
            .clone()
            .ok_or_else(|| NtfsError::NotFound(path.to_string()))?;
        let entry = node
            .resolve(&mut self.volume)?
            .ok_or_else(|| NtfsError::NotFound(path.to_string()))?;
        Ok(FileStat {
            record: node.reference.record,
            name: fname.name.clone(),
            directory: entry.is_directory(),
            size: fname.length(),
            allocated: fname.allocated_size,
            atime: fname.a_time(),
            mtime: fname.m_time(),
            ctime: fname.c_time(),
            links: entry.header.hard_link_count,
        })
    }

    /// Whole unnamed `$DATA` of `path`.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut entry = self
            .lookup(path)?
            .ok_or_else(|| NtfsError::NotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(NtfsError::Malformed(format!("{} is a directory", path)));
        }
        match entry.attribute_data(&mut self.volume)? {
            Some(data) => data.read_all(&mut self.volume),
            None => Ok(Vec::new()),
        }
    }

    pub fn dir_mkdir(&mut self, _path: &str) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    pub fn dir_delete(&mut self, _path: &str) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    pub fn file_delete(&mut self, _path: &str) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    pub fn file_rename(&mut self, _from: &str, _to: &str) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    pub fn file_chmod(&mut self, _mode: u32, _path: &str) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    pub fn file_chown(&mut self, _owner: u32, _group: u32, _path: &str) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    pub fn file_link(&mut self, _from: &str, _to: &str) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    pub fn file_truncate(&mut self, _path: &str, _len: u64) -> Result<()> {
        Err(NtfsError::ReadOnly)
    }

    fn file_name(&mut self, path: &str) -> Result<FileName> {
        self.get_file(path)?
            .and_then(|node| node.file_name)
            .ok_or_else(|| NtfsError::NotFound(path.to_string()))
    }
}

// Walk `comps` from the root, caching every directory index on the way.
fn get_index<'a>(
    vol: &mut dyn Volume,
    root: &'a mut IndexRoot,
    cache: &'a mut PathIndexCache,
    max_depth: usize,
    comps: &[String],
) -> Result<Option<&'a mut IndexRoot>> {
    let Some((name, parent)) = comps.split_last() else {
        return Ok(Some(root));
    };
    let key = normalize(comps);
    if cache.contains(&key) {
        return Ok(cache.get_mut(&key));
    }

    let node = match get_index(vol, &mut *root, &mut *cache, max_depth, parent)? {
        Some(dir) => dir.find(vol, name),
        None => return Ok(None),
    };
    let Some(node) = node else {
        return Ok(None);
    };
    let Some(entry) = node.resolve(vol)? else {
        return Ok(None);
    };
    if !entry.is_directory() {
        return Ok(None);
    }
    let Some(mut index) = entry.into_index_root(vol)? else {
        return Ok(None);
    };
    index.set_max_depth(max_depth);
    debug!("path cache: caching index of {:?}", key);
    Ok(Some(cache.insert(key, index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_name::{FILE_NAME_FLAG_DIRECTORY, NS_WIN32};
    use crate::mft::{FILE_RECORD_IN_USE, FILE_RECORD_IS_DIRECTORY};
    use crate::run_list::Run;
    use crate::test_support::{
        MemVolume, encode_runs, file_name_value, file_record, index_block, index_entry, index_entry_for,
        index_root_value, non_resident_attr, resident_attr,
    };

    const BPC: u64 = 4096;
    const DIR: u16 = FILE_RECORD_IN_USE | FILE_RECORD_IS_DIRECTORY;

    fn dir_record(n: u32, entries: &[u8]) -> Vec<u8> {
        let root = resident_attr(0x90, "$I30", 0, &index_root_value(entries, false, BPC as u32));
        file_record(n, DIR, &[root])
    }

    fn file_rec(n: u32, parent: u64, name: &str, content: &[u8]) -> Vec<u8> {
        let fname = file_name_value(parent, name, NS_WIN32, content.len() as u64, 0);
        file_record(
            n,
            FILE_RECORD_IN_USE,
            &[resident_attr(0x30, "", 0, &fname), resident_attr(0x80, "", 1, content)],
        )
    }

    // /            (5)   resident index: $MFT, d1, LAST
    // /d1          (64)  INDX-backed index: bar.txt, foo.txt
    // /d1/foo.txt  (65)  /d1/bar.txt (66)
    fn volume() -> MemVolume {
        let mut vol = MemVolume::with_image(vec![0u8; 4 * BPC as usize], BPC);

        let mut root = index_entry(Some((0, "$MFT", NS_WIN32)), None, false);
        root.extend(index_entry_for(64, &file_name_value(5, "d1", NS_WIN32, 0, FILE_NAME_FLAG_DIRECTORY), None));
        root.extend(index_entry(None, None, true));
        vol.put_record(5, &dir_record(5, &root));

        // d1 keeps its entries in block VCN 0 at LCN 2
        let mut node = index_entry_for(66, &file_name_value(64, "bar.txt", NS_WIN32, 3, 0), None);
        node.extend(index_entry_for(65, &file_name_value(64, "foo.txt", NS_WIN32, 11, 0), None));
        node.extend(index_entry(None, None, true));
        let block = index_block(0, &node, BPC as usize);
        vol.image[2 * BPC as usize..3 * BPC as usize].copy_from_slice(&block);

        let root_entries = index_entry(None, Some(0), true);
        let d1_root = resident_attr(0x90, "$I30", 0, &index_root_value(&root_entries, true, BPC as u32));
        let runs = encode_runs(&[Run { lcn: Some(2), length: 1 }]);
        let alloc = non_resident_attr(0xA0, "$I30", 1, &runs, 0, 0, BPC);
        let bitmap = resident_attr(0xB0, "$I30", 2, &[0x01, 0, 0, 0, 0, 0, 0, 0]);
        vol.put_record(64, &file_record(64, DIR, &[d1_root, alloc, bitmap]));

        vol.put_record(65, &file_rec(65, 64, "foo.txt", b"hello world"));
        vol.put_record(66, &file_rec(66, 64, "bar.txt", b"bar"));
        vol
    }

    #[test]
    fn resolves_nested_path() {
        let mut fs = FileSystem::new(volume()).unwrap();
        let mut entry = fs.lookup("/d1/foo.txt").unwrap().unwrap();
        assert!(!entry.is_directory());
        assert_eq!(entry.record_number, 65);

        let stored = fs.get_file("/d1/foo.txt").unwrap().unwrap().file_name.unwrap().data_size;
        assert_eq!(entry.size(fs.volume()).unwrap(), stored);
        assert_eq!(fs.file_size("/D1/FOO.TXT").unwrap(), 11);
    }

    #[test]
    fn sibling_lookup_hits_the_path_cache() {
        let mut fs = FileSystem::new(volume()).unwrap();
        assert!(fs.lookup("/d1/foo.txt").unwrap().is_some());
        let hits = fs.cache_hits();
        assert!(fs.lookup("\\d1\\bar.txt").unwrap().is_some());
        assert_eq!(fs.cache_hits(), hits + 1);
    }

    #[test]
    fn listing_and_predicates() {
        let mut fs = FileSystem::new(volume()).unwrap();
        assert_eq!(fs.dir_entries("/").unwrap(), ["d1"]);
        assert_eq!(fs.dir_entries("/d1").unwrap(), ["bar.txt", "foo.txt"]);
        assert!(fs.dir_entries("/nope").is_err());

        assert!(fs.dir_exists("/").unwrap());
        assert!(fs.dir_exists("C:\\d1").unwrap());
        assert!(!fs.dir_exists("/d1/foo.txt").unwrap());
        assert!(fs.is_directory("/d1").unwrap());
        assert!(fs.is_file("/d1/bar.txt").unwrap());
        assert!(!fs.file_exists("/d1/baz.txt").unwrap());
        assert!(fs.file_exists("/d1/bar.txt").unwrap());
        assert!(matches!(fs.file_size("/missing"), Err(NtfsError::NotFound(_))));
    }

    #[test]
    fn reads_and_stats() {
        let mut fs = FileSystem::new(volume()).unwrap();
        assert_eq!(fs.read_file("/d1/foo.txt").unwrap(), b"hello world");
        let st = fs.stat("/d1/bar.txt").unwrap();
        assert_eq!((st.record, st.size, st.directory), (66, 3, false));
        assert_eq!(st.name, "bar.txt");
        assert!(fs.file_mtime("/d1/bar.txt").unwrap().is_some());
        assert!(fs.read_file("/d1").is_err());
    }

    #[test]
    fn writes_are_refused() {
        let mut fs = FileSystem::new(volume()).unwrap();
        assert!(matches!(fs.dir_mkdir("/new"), Err(NtfsError::ReadOnly)));
        assert!(matches!(fs.file_delete("/d1/foo.txt"), Err(NtfsError::ReadOnly)));
        assert!(matches!(fs.file_rename("/a", "/b"), Err(NtfsError::ReadOnly)));
        assert!(matches!(fs.file_truncate("/d1/foo.txt", 0), Err(NtfsError::ReadOnly)));
    }
}
