//! Content sources
//!
//! Read-only, byte-addressable lookup of archive entries such as
//! `game/entity/Player.class`. Sources are layered; the first layer
//! containing an entry wins.

use anvil_bytecode::{entry_name, ClassFile};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Where an entry lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentHandle {
    /// A file on disk
    Path(PathBuf),
    /// An entry of a zip archive
    Archive {
        /// Archive file
        archive: PathBuf,
        /// Entry name inside the archive
        entry: String,
    },
    /// An in-memory entry
    Memory {
        /// Entry name
        name: String,
    },
}

/// Read-only source of named entries
pub trait ContentSource: Send + Sync {
    /// Open an entry for reading
    fn open_stream(&self, name: &str) -> io::Result<Option<Box<dyn Read + Send>>>;

    /// Location of an entry
    fn content_path(&self, name: &str) -> Option<ContentHandle>;

    /// Every location containing an entry, in priority order
    fn content_paths(&self, name: &str) -> Vec<ContentHandle> {
        self.content_path(name).into_iter().collect()
    }

    /// All entry names, sorted
    fn entries(&self) -> io::Result<Vec<String>>;

    /// Read an entry fully
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match self.open_stream(name)? {
            Some(mut stream) => {
                let mut bytes = Vec::new();
                stream.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }
}

/// Union of directories
#[derive(Debug, Clone)]
pub struct DirectoryContent {
    roots: Vec<PathBuf>,
}

impl DirectoryContent {
    /// Create a source over one or more directories, searched in order
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    fn locate<'a>(&'a self, name: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
        let relative = Path::new(name);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        self.roots
            .iter()
            .filter(move |_| safe)
            .map(move |root| root.join(relative))
            .filter(|path| path.is_file())
    }
}

impl ContentSource for DirectoryContent {
    fn open_stream(&self, name: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        match self.locate(name).next() {
            Some(path) => Ok(Some(Box::new(File::open(path)?))),
            None => Ok(None),
        }
    }

    fn content_path(&self, name: &str) -> Option<ContentHandle> {
        self.locate(name).next().map(ContentHandle::Path)
    }

    fn content_paths(&self, name: &str) -> Vec<ContentHandle> {
        self.locate(name).map(ContentHandle::Path).collect()
    }

    fn entries(&self) -> io::Result<Vec<String>> {
        let mut entries = BTreeSet::new();
        for root in &self.roots {
            collect_files(root, root, &mut entries)?;
        }
        Ok(entries.into_iter().collect())
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeSet<String>) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let name: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.insert(name.join("/"));
        }
    }
    Ok(())
}

/// Upper bound on the buffer reserved from an entry's declared size
const MAX_PREALLOCATION: usize = 64 * 1024;

/// Initial capacity for an entry declaring `declared` bytes. Header sizes are
/// untrusted, so larger entries grow the buffer as they are read.
fn preallocation(declared: u64) -> usize {
    usize::try_from(declared)
        .unwrap_or(usize::MAX)
        .min(MAX_PREALLOCATION)
}

/// A zip archive
pub struct ArchiveContent {
    path: PathBuf,
    archive: Mutex<zip::ZipArchive<File>>,
}

impl ArchiveContent {
    /// Open an archive
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let archive = zip::ZipArchive::new(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self {
            path,
            archive: Mutex::new(archive),
        })
    }

    /// Path of the archive file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn contains(&self, name: &str) -> bool {
        self.archive.lock().index_for_name(name).is_some()
    }
}

impl ContentSource for ArchiveContent {
    fn open_stream(&self, name: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        let mut archive = self.archive.lock();
        let mut file = match archive.by_name(name) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        let mut bytes = Vec::with_capacity(preallocation(file.size()));
        file.read_to_end(&mut bytes)?;
        Ok(Some(Box::new(Cursor::new(bytes))))
    }

    fn content_path(&self, name: &str) -> Option<ContentHandle> {
        self.contains(name).then(|| ContentHandle::Archive {
            archive: self.path.clone(),
            entry: name.to_string(),
        })
    }

    fn entries(&self) -> io::Result<Vec<String>> {
        let archive = self.archive.lock();
        let mut entries: Vec<String> = archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect();
        entries.sort();
        Ok(entries)
    }
}

impl std::fmt::Debug for ArchiveContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveContent").field("path", &self.path).finish()
    }
}

/// Entries held in memory
#[derive(Debug, Default)]
pub struct MemoryContent {
    entries: RwLock<BTreeMap<String, Arc<[u8]>>>,
}

impl MemoryContent {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry
    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.entries.write().insert(name.into(), bytes.into());
    }

    /// Add or replace a class under its archive entry name
    pub fn insert_class(&self, class: &ClassFile) {
        self.insert(entry_name(class.name()), class.encode());
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the source is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ContentSource for MemoryContent {
    fn open_stream(&self, name: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        Ok(self.read(name)?.map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>))
    }

    fn content_path(&self, name: &str) -> Option<ContentHandle> {
        self.entries
            .read()
            .contains_key(name)
            .then(|| ContentHandle::Memory {
                name: name.to_string(),
            })
    }

    fn entries(&self) -> io::Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(name).map(|bytes| bytes.to_vec()))
    }
}

/// A source with no entries
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyContent;

impl ContentSource for EmptyContent {
    fn open_stream(&self, _name: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        Ok(None)
    }

    fn content_path(&self, _name: &str) -> Option<ContentHandle> {
        None
    }

    fn entries(&self) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Stacked sources; the first layer containing an entry wins
#[derive(Default)]
pub struct LayeredContent {
    layers: RwLock<Vec<Arc<dyn ContentSource>>>,
}

impl LayeredContent {
    /// Create a stack from layers in priority order
    pub fn new(layers: impl IntoIterator<Item = Arc<dyn ContentSource>>) -> Self {
        Self {
            layers: RwLock::new(layers.into_iter().collect()),
        }
    }

    /// Append a lowest-priority layer
    pub fn push(&self, layer: Arc<dyn ContentSource>) {
        self.layers.write().push(layer);
    }

    /// Insert a layer at `index`, ahead of the layers after it
    pub fn insert(&self, index: usize, layer: Arc<dyn ContentSource>) {
        let mut layers = self.layers.write();
        let index = index.min(layers.len());
        layers.insert(index, layer);
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    /// Whether there are no layers
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ContentSource>> {
        self.layers.read().clone()
    }
}

impl ContentSource for LayeredContent {
    fn open_stream(&self, name: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        for layer in self.snapshot() {
            if let Some(stream) = layer.open_stream(name)? {
                return Ok(Some(stream));
            }
        }
        Ok(None)
    }

    fn content_path(&self, name: &str) -> Option<ContentHandle> {
        self.snapshot()
            .iter()
            .find_map(|layer| layer.content_path(name))
    }

    fn content_paths(&self, name: &str) -> Vec<ContentHandle> {
        self.snapshot()
            .iter()
            .flat_map(|layer| layer.content_paths(name))
            .collect()
    }

    fn entries(&self) -> io::Result<Vec<String>> {
        let mut entries = BTreeSet::new();
        for layer in self.snapshot() {
            entries.extend(layer.entries()?);
        }
        Ok(entries.into_iter().collect())
    }

    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        for layer in self.snapshot() {
            if let Some(bytes) = layer.read(name)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for LayeredContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredContent")
            .field("layers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_content() {
        let content = MemoryContent::new();
        assert!(content.is_empty());
        content.insert("b.txt", b"second".to_vec());
        content.insert("a.txt", b"first".to_vec());

        assert_eq!(content.read("a.txt").unwrap().unwrap(), b"first");
        assert!(content.read("c.txt").unwrap().is_none());
        assert_eq!(content.entries().unwrap(), vec!["a.txt", "b.txt"]);
        assert_eq!(
            content.content_path("a.txt"),
            Some(ContentHandle::Memory {
                name: "a.txt".to_string()
            })
        );
    }

    #[test]
    fn test_layered_first_match_wins() {
        let top = Arc::new(MemoryContent::new());
        top.insert("shared.txt", b"top".to_vec());
        let bottom = Arc::new(MemoryContent::new());
        bottom.insert("shared.txt", b"bottom".to_vec());
        bottom.insert("only.txt", b"only".to_vec());

        let layered = LayeredContent::new([
            top as Arc<dyn ContentSource>,
            bottom as Arc<dyn ContentSource>,
        ]);
        assert_eq!(layered.read("shared.txt").unwrap().unwrap(), b"top");
        assert_eq!(layered.read("only.txt").unwrap().unwrap(), b"only");
        assert_eq!(layered.content_paths("shared.txt").len(), 2);
        assert_eq!(layered.entries().unwrap(), vec!["only.txt", "shared.txt"]);
    }

    #[test]
    fn test_layered_insert_takes_priority() {
        let base = Arc::new(MemoryContent::new());
        base.insert("x.txt", b"base".to_vec());
        let layered = LayeredContent::new([base as Arc<dyn ContentSource>]);

        let patch = Arc::new(MemoryContent::new());
        patch.insert("x.txt", b"patch".to_vec());
        layered.insert(0, patch);
        layered.push(Arc::new(EmptyContent));

        assert_eq!(layered.len(), 3);
        assert_eq!(layered.read("x.txt").unwrap().unwrap(), b"patch");
    }

    #[test]
    fn test_directory_content() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(first.path().join("game")).unwrap();
        std::fs::write(first.path().join("game/A.class"), b"a").unwrap();
        std::fs::write(second.path().join("readme.txt"), b"hi").unwrap();
        std::fs::create_dir_all(second.path().join("game")).unwrap();
        std::fs::write(second.path().join("game/A.class"), b"shadowed").unwrap();

        let content = DirectoryContent::new([first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(content.read("game/A.class").unwrap().unwrap(), b"a");
        assert_eq!(content.content_paths("game/A.class").len(), 2);
        assert_eq!(content.entries().unwrap(), vec!["game/A.class", "readme.txt"]);
        assert!(content.read("../escape.txt").unwrap().is_none());
    }

    #[test]
    fn test_archive_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.zip");
        {
            let file = File::create(&path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            zip.add_directory("game/", options).unwrap();
            zip.start_file("game/B.class", options).unwrap();
            zip.write_all(b"bee").unwrap();
            zip.start_file("assets/logo.txt", options).unwrap();
            zip.write_all(b"logo").unwrap();
            zip.finish().unwrap();
        }

        let content = ArchiveContent::open(&path).unwrap();
        assert_eq!(content.read("game/B.class").unwrap().unwrap(), b"bee");
        assert!(content.read("game/Missing.class").unwrap().is_none());
        assert_eq!(content.entries().unwrap(), vec!["assets/logo.txt", "game/B.class"]);
        assert_eq!(
            content.content_path("game/B.class"),
            Some(ContentHandle::Archive {
                archive: path.clone(),
                entry: "game/B.class".to_string()
            })
        );
    }

    #[test]
    fn test_declared_entry_size_is_capped() {
        assert_eq!(preallocation(3), 3);
        assert_eq!(preallocation(u64::from(u32::MAX)), MAX_PREALLOCATION);
        assert_eq!(preallocation(u64::MAX), MAX_PREALLOCATION);
    }

    #[test]
    fn test_archive_entry_larger_than_preallocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.zip");
        let big = vec![7u8; MAX_PREALLOCATION * 3 + 1];
        {
            let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
            zip.start_file("assets/big.bin", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(&big).unwrap();
            zip.finish().unwrap();
        }

        let content = ArchiveContent::open(&path).unwrap();
        assert_eq!(content.read("assets/big.bin").unwrap().unwrap(), big);
    }
}
