use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use walkdir::WalkDir;

use crate::item::{Backing, EvidenceDescriptor, ItemId};
use crate::stream::EvidenceStream;

use super::{BackingResolver, DescriptorIter, EvidenceError, EvidenceSource, relative_key};

/// Files under a directory (or a single file), in file-name order so that
/// repeated enumerations produce the same ids.
pub struct DirectorySource {
    root: PathBuf,
    id_prefix: String,
    expand_archives: bool,
    resolver: Arc<BackingResolver>,
}

impl DirectorySource {
    pub fn new(root: &Path, id_prefix: &str, resolver: Arc<BackingResolver>) -> Self {
        Self {
            root: root.to_path_buf(),
            id_prefix: id_prefix.to_string(),
            expand_archives: false,
            resolver,
        }
    }

    /// Also enumerate the entries of `.zip` files found while walking.
    pub fn with_archive_expansion(mut self, enabled: bool) -> Self {
        self.expand_archives = enabled;
        self
    }

    fn describe_file(&self, path: &Path) -> Result<EvidenceDescriptor, EvidenceError> {
        let metadata = std::fs::metadata(path)?;
        let rel = relative_key(&self.root, path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| rel.clone());
        Ok(EvidenceDescriptor {
            id: ItemId::new(format!("{}:{rel}", self.id_prefix)),
            name,
            logical_path: rel,
            backing: Backing::File {
                path: path.to_path_buf(),
            },
            size: Some(metadata.len()),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    fn descriptors_for(&self, entry: walkdir::Result<walkdir::DirEntry>) -> DescriptorIter<'_> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let err = EvidenceError::Io(err.into());
                return Box::new(std::iter::once(Err::<EvidenceDescriptor, _>(err)));
            }
        };
        if !entry.file_type().is_file() {
            return Box::new(std::iter::empty());
        }
        let path = entry.into_path();
        let file = std::iter::once(self.describe_file(&path));
        if self.expand_archives && is_zip(&path) {
            Box::new(file.chain(self.archive_entries(&path)))
        } else {
            Box::new(file)
        }
    }

    fn archive_entries(&self, path: &Path) -> DescriptorIter<'_> {
        match self.resolver.archive(path) {
            Ok(container) => Box::new(
                container.descriptors(self.id_prefix.clone(), relative_key(&self.root, path)),
            ),
            Err(err) => {
                // The archive itself is still processed as a plain file.
                warn!("cannot expand archive {}: {err}", path.display());
                Box::new(std::iter::empty())
            }
        }
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

impl EvidenceSource for DirectorySource {
    fn enumerate(&self) -> Result<DescriptorIter<'_>, EvidenceError> {
        if !self.root.exists() {
            return Err(EvidenceError::open_failed(
                self.root.display(),
                "evidence root does not exist",
            ));
        }
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        let iter = walker.flat_map(move |entry| self.descriptors_for(entry));
        Ok(Box::new(iter))
    }

    fn open(&self, descriptor: &EvidenceDescriptor) -> Result<EvidenceStream, EvidenceError> {
        self.resolver.open(&descriptor.backing)
    }
}
