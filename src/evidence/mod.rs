//! # Evidence Sources
//!
//! Enumeration of evidence items for a case and opening of their streams.
//!
//! Every source yields [`EvidenceDescriptor`]s lazily and delegates opening
//! to a shared [`BackingResolver`], so a descriptor persisted in one run can
//! be reopened in a resumed run regardless of which source produced it.

pub mod archive;
pub mod case;
pub mod directory;
pub mod image;

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, trace};

use crate::item::{Backing, EvidenceDescriptor};
use crate::stream::{EvidenceStream, FileBacking, RangeBacking};

pub use archive::{ArchiveSource, ZipContainer};
pub use case::{CaseDescriptor, CaseSource, EvidenceRoot, RootKind, open_case};
pub use directory::DirectorySource;
pub use image::{ImageRange, ImageSource, load_manifest_ranges};

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("open failed for {target}: {reason}")]
    OpenFailed { target: String, reason: String },
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("unsupported evidence type: {0}")]
    Unsupported(String),
}

impl EvidenceError {
    pub fn open_failed(target: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        EvidenceError::OpenFailed {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Lazy, single-pass sequence of descriptors.
pub type DescriptorIter<'a> =
    Box<dyn Iterator<Item = Result<EvidenceDescriptor, EvidenceError>> + Send + 'a>;

pub trait EvidenceSource: Send + Sync {
    /// Starts a fresh enumeration from the beginning.
    fn enumerate(&self) -> Result<DescriptorIter<'_>, EvidenceError>;
    /// Opens an independent stream for one item.
    fn open(&self, descriptor: &EvidenceDescriptor) -> Result<EvidenceStream, EvidenceError>;
}

/// Positional reads over a large acquisition image shared by many items.
pub trait BackingStore: Send + Sync {
    fn len(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError>;
}

pub struct RawFileStore {
    file: File,
    len: u64,
    #[cfg(not(unix))]
    lock: Mutex<()>,
}

impl RawFileStore {
    pub fn open(path: &Path) -> Result<Self, EvidenceError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            #[cfg(not(unix))]
            lock: Mutex::new(()),
        })
    }
}

impl BackingStore for RawFileStore {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            // Positional reads need the shared cursor on this platform.
            use std::io::{Read, Seek, SeekFrom};
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut f = &self.file;
            f.seek(SeekFrom::Start(offset))?;
            Ok(f.read(buf)?)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverLimits {
    /// Decompressed container entries above this size spill to disk.
    pub container_memory_limit: u64,
    pub max_container_entry_bytes: Option<u64>,
    pub max_open_containers: usize,
}

impl Default for ResolverLimits {
    fn default() -> Self {
        Self {
            container_memory_limit: 16 * crate::constants::MIB,
            max_container_entry_bytes: None,
            max_open_containers: 32,
        }
    }
}

/// Opens streams for any persisted [`Backing`].
///
/// Archives are kept in an LRU pool bounded by `max_open_containers`; an
/// evicted archive stays alive while a worker still holds it.
pub struct BackingResolver {
    limits: ResolverLimits,
    archives: Mutex<LruPool<ZipContainer>>,
    images: Mutex<HashMap<PathBuf, Arc<RawFileStore>>>,
}

impl BackingResolver {
    pub fn new(limits: ResolverLimits) -> Self {
        Self {
            limits,
            archives: Mutex::new(LruPool::new(limits.max_open_containers.max(1))),
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> ResolverLimits {
        self.limits
    }

    pub fn archive(&self, path: &Path) -> Result<Arc<ZipContainer>, EvidenceError> {
        let mut pool = self.archives.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(container) = pool.get(path) {
            trace!(path = %path.display(), "archive handle cache hit");
            return Ok(container);
        }
        debug!(path = %path.display(), "opening archive");
        let container = Arc::new(ZipContainer::open(path)?);
        pool.insert(path.to_path_buf(), container.clone());
        Ok(container)
    }

    pub fn image(&self, path: &Path) -> Result<Arc<RawFileStore>, EvidenceError> {
        let mut images = self.images.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = images.get(path) {
            return Ok(store.clone());
        }
        let store = Arc::new(RawFileStore::open(path)?);
        images.insert(path.to_path_buf(), store.clone());
        Ok(store)
    }

    pub fn open(&self, backing: &Backing) -> Result<EvidenceStream, EvidenceError> {
        match backing {
            Backing::File { path } => {
                let file = FileBacking::open(path)
                    .map_err(|err| EvidenceError::open_failed(path.display(), err))?;
                Ok(EvidenceStream::new(Box::new(file)))
            }
            Backing::ContainerEntry {
                container, index, ..
            } => {
                let archive = self
                    .archive(container)
                    .map_err(|err| EvidenceError::open_failed(container.display(), err))?;
                archive.open_entry(*index, &self.limits)
            }
            Backing::ImageRange {
                image,
                offset,
                length,
            } => {
                let store = self
                    .image(image)
                    .map_err(|err| EvidenceError::open_failed(image.display(), err))?;
                let range = RangeBacking::new(store, *offset, *length).map_err(|err| {
                    EvidenceError::open_failed(format!("{}@{offset}", image.display()), err)
                })?;
                Ok(EvidenceStream::new(Box::new(range)))
            }
            Backing::Memory { key } => Err(EvidenceError::Unsupported(format!(
                "memory backing {key} has no resolver"
            ))),
        }
    }
}

struct LruPool<T> {
    entries: HashMap<PathBuf, Arc<T>>,
    order: VecDeque<PathBuf>,
    max_open: usize,
}

impl<T> LruPool<T> {
    fn new(max_open: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_open,
        }
    }

    fn get(&mut self, path: &Path) -> Option<Arc<T>> {
        let entry = self.entries.get(path)?.clone();
        self.order.retain(|p| p != path);
        self.order.push_front(path.to_path_buf());
        Some(entry)
    }

    fn insert(&mut self, path: PathBuf, value: Arc<T>) {
        while self.entries.len() >= self.max_open {
            let Some(evicted) = self.order.pop_back() else {
                break;
            };
            trace!(path = %evicted.display(), "evicting archive handle");
            self.entries.remove(&evicted);
        }
        self.order.push_front(path.clone());
        self.entries.insert(path, value);
    }
}

/// Item id component derived from a path relative to its root.
pub(crate) fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let key = rel.to_string_lossy().replace('\\', "/");
    if key.is_empty() {
        path.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    } else {
        key
    }
}
