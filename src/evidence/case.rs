use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::item::EvidenceDescriptor;
use crate::stream::EvidenceStream;

use super::{
    ArchiveSource, BackingResolver, DescriptorIter, DirectorySource, EvidenceError,
    EvidenceSource, ImageSource, ResolverLimits, load_manifest_ranges,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    /// Decided from the filesystem: directories walk, `.zip` expands, other files are single items.
    #[default]
    Auto,
    Directory,
    Archive,
    Image,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRoot {
    pub path: PathBuf,
    #[serde(default)]
    pub kind: RootKind,
    /// Carving manifest listing ranges inside an image root.
    #[serde(default)]
    pub manifest: Option<PathBuf>,
}

impl EvidenceRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: RootKind::Auto,
            manifest: None,
        }
    }

    fn resolved_kind(&self) -> RootKind {
        match self.kind {
            RootKind::Auto if self.path.is_dir() => RootKind::Directory,
            RootKind::Auto if self.manifest.is_some() => RootKind::Image,
            RootKind::Auto if has_zip_extension(&self.path) => RootKind::Archive,
            RootKind::Auto => RootKind::File,
            kind => kind,
        }
    }
}

fn has_zip_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// The evidence of one case: an ordered list of roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDescriptor {
    pub name: String,
    pub roots: Vec<EvidenceRoot>,
}

impl CaseDescriptor {
    pub fn new(name: impl Into<String>, roots: Vec<EvidenceRoot>) -> Self {
        Self {
            name: name.into(),
            roots,
        }
    }

    pub fn from_paths(name: impl Into<String>, paths: &[PathBuf]) -> Self {
        Self::new(name, paths.iter().map(EvidenceRoot::new).collect())
    }
}

/// Enumerates every root of a case in order.
pub struct CaseSource {
    sources: Vec<Box<dyn EvidenceSource>>,
    resolver: Arc<BackingResolver>,
}

impl CaseSource {
    pub fn resolver(&self) -> &Arc<BackingResolver> {
        &self.resolver
    }
}

impl EvidenceSource for CaseSource {
    fn enumerate(&self) -> Result<DescriptorIter<'_>, EvidenceError> {
        // A root that cannot be enumerated is reported once and the other roots continue.
        let iter = self
            .sources
            .iter()
            .flat_map(|source| enumerate_root(source.as_ref()));
        Ok(Box::new(iter))
    }

    fn open(&self, descriptor: &EvidenceDescriptor) -> Result<EvidenceStream, EvidenceError> {
        self.resolver.open(&descriptor.backing)
    }
}

fn enumerate_root(source: &dyn EvidenceSource) -> DescriptorIter<'_> {
    match source.enumerate() {
        Ok(iter) => iter,
        Err(err) => Box::new(std::iter::once(Err::<EvidenceDescriptor, _>(err))),
    }
}

/// Builds the composite source for a case. Roots are prefixed `r0`, `r1`, ...
/// so identical relative paths under different roots get distinct ids.
pub fn open_case(
    case: &CaseDescriptor,
    limits: ResolverLimits,
    expand_archives: bool,
) -> Result<CaseSource, EvidenceError> {
    let resolver = Arc::new(BackingResolver::new(limits));
    let mut sources: Vec<Box<dyn EvidenceSource>> = Vec::with_capacity(case.roots.len());
    for (index, root) in case.roots.iter().enumerate() {
        let prefix = format!("r{index}");
        let kind = root.resolved_kind();
        info!("case {} root {} kind={kind:?}", case.name, root.path.display());
        let source: Box<dyn EvidenceSource> = match kind {
            RootKind::Directory | RootKind::File | RootKind::Auto => Box::new(
                DirectorySource::new(&root.path, &prefix, resolver.clone())
                    .with_archive_expansion(expand_archives),
            ),
            RootKind::Archive => {
                Box::new(ArchiveSource::new(&root.path, &prefix, resolver.clone()))
            }
            RootKind::Image => {
                let ranges = match &root.manifest {
                    Some(manifest) => load_manifest_ranges(manifest)?,
                    None => Vec::new(),
                };
                Box::new(ImageSource::new(
                    &root.path,
                    &prefix,
                    ranges,
                    resolver.clone(),
                ))
            }
        };
        sources.push(source);
    }
    Ok(CaseSource { sources, resolver })
}
