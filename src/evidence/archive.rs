use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;
use zip::ZipArchive;

use crate::item::{Backing, EvidenceDescriptor, ItemId};
use crate::stream::{ContainerBacking, EvidenceStream};

use super::{
    BackingResolver, DescriptorIter, EvidenceError, EvidenceSource, ResolverLimits, relative_key,
};

#[derive(Debug, Clone)]
pub struct ZipEntryInfo {
    pub index: usize,
    pub name: String,
    pub size: u64,
}

/// An open zip archive.
///
/// The archive cursor is shared, so entry extraction is serialized per
/// container. That lock is the only backpressure point between workers
/// reading different entries of the same archive.
pub struct ZipContainer {
    path: PathBuf,
    archive: Mutex<ZipArchive<File>>,
    len: usize,
}

impl ZipContainer {
    pub fn open(path: &Path) -> Result<Self, EvidenceError> {
        let file = File::open(path)?;
        let archive = ZipArchive::new(file)?;
        let len = archive.len();
        Ok(Self {
            path: path.to_path_buf(),
            archive: Mutex::new(archive),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Metadata for a file entry; `None` for directories.
    pub fn entry_info(&self, index: usize) -> Result<Option<ZipEntryInfo>, EvidenceError> {
        let mut archive = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = archive.by_index_raw(index)?;
        if entry.is_dir() {
            return Ok(None);
        }
        Ok(Some(ZipEntryInfo {
            index,
            name: entry.name().to_string(),
            size: entry.size(),
        }))
    }

    pub fn open_entry(
        &self,
        index: usize,
        limits: &ResolverLimits,
    ) -> Result<EvidenceStream, EvidenceError> {
        let target = format!("{}!{index}", self.path.display());
        let mut archive = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entry = archive
            .by_index(index)
            .map_err(|err| EvidenceError::open_failed(&target, err))?;
        let backing = ContainerBacking::from_reader(
            &mut entry,
            limits.container_memory_limit,
            limits.max_container_entry_bytes,
        )
        .map_err(|err| EvidenceError::open_failed(&target, err))?;
        Ok(EvidenceStream::new(Box::new(backing)))
    }

    pub(crate) fn describe(
        &self,
        index: usize,
        id_prefix: &str,
        logical_parent: &str,
    ) -> Option<Result<EvidenceDescriptor, EvidenceError>> {
        let info = match self.entry_info(index) {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };
        let name = info
            .name
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or(&info.name)
            .to_string();
        Some(Ok(EvidenceDescriptor {
            id: ItemId::new(format!("{id_prefix}:{logical_parent}!{index}/{}", info.name)),
            name,
            logical_path: format!("{logical_parent}!/{}", info.name),
            backing: Backing::ContainerEntry {
                container: self.path.clone(),
                index,
                entry: info.name,
            },
            size: Some(info.size),
            modified: None,
        }))
    }

    /// Lazily describes every file entry.
    pub(crate) fn descriptors(
        self: Arc<Self>,
        id_prefix: String,
        logical_parent: String,
    ) -> impl Iterator<Item = Result<EvidenceDescriptor, EvidenceError>> + Send {
        (0..self.len).filter_map(move |index| {
            let described = self.describe(index, &id_prefix, &logical_parent);
            if let Some(Err(err)) = &described {
                warn!("unreadable entry {index} in {}: {err}", self.path.display());
            }
            described
        })
    }
}

/// A zip archive given directly as an evidence root.
pub struct ArchiveSource {
    path: PathBuf,
    id_prefix: String,
    resolver: Arc<BackingResolver>,
}

impl ArchiveSource {
    pub fn new(path: &Path, id_prefix: &str, resolver: Arc<BackingResolver>) -> Self {
        Self {
            path: path.to_path_buf(),
            id_prefix: id_prefix.to_string(),
            resolver,
        }
    }
}

impl EvidenceSource for ArchiveSource {
    fn enumerate(&self) -> Result<DescriptorIter<'_>, EvidenceError> {
        let container = self.resolver.archive(&self.path)?;
        let parent = relative_key(&self.path, &self.path);
        Ok(Box::new(
            container.descriptors(self.id_prefix.clone(), parent),
        ))
    }

    fn open(&self, descriptor: &EvidenceDescriptor) -> Result<EvidenceStream, EvidenceError> {
        self.resolver.open(&descriptor.backing)
    }
}
