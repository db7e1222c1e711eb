use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::item::{Backing, EvidenceDescriptor, ItemId};
use crate::stream::EvidenceStream;

use super::{BackingResolver, BackingStore, DescriptorIter, EvidenceError, EvidenceSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRange {
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

/// Byte ranges carved from a raw acquisition image.
///
/// Without explicit ranges the whole image is a single item.
pub struct ImageSource {
    image: PathBuf,
    id_prefix: String,
    ranges: Vec<ImageRange>,
    resolver: Arc<BackingResolver>,
}

impl ImageSource {
    pub fn new(
        image: &Path,
        id_prefix: &str,
        ranges: Vec<ImageRange>,
        resolver: Arc<BackingResolver>,
    ) -> Self {
        Self {
            image: image.to_path_buf(),
            id_prefix: id_prefix.to_string(),
            ranges,
            resolver,
        }
    }

    fn image_name(&self) -> String {
        self.image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.image.display().to_string())
    }

    fn describe(&self, range: &ImageRange) -> EvidenceDescriptor {
        let image_name = self.image_name();
        EvidenceDescriptor {
            id: ItemId::new(format!(
                "{}:{image_name}@{}+{}",
                self.id_prefix, range.offset, range.length
            )),
            name: range.name.clone(),
            logical_path: format!("{image_name}/{}", range.name),
            backing: Backing::ImageRange {
                image: self.image.clone(),
                offset: range.offset,
                length: range.length,
            },
            size: Some(range.length),
            modified: None,
        }
    }
}

impl EvidenceSource for ImageSource {
    fn enumerate(&self) -> Result<DescriptorIter<'_>, EvidenceError> {
        let store = self.resolver.image(&self.image)?;
        if self.ranges.is_empty() {
            let whole = ImageRange {
                name: self.image_name(),
                offset: 0,
                length: store.len(),
            };
            return Ok(Box::new(std::iter::once(Ok::<_, EvidenceError>(self.describe(&whole)))));
        }
        debug!(
            "image {} has {} ranges",
            self.image.display(),
            self.ranges.len()
        );
        Ok(Box::new(
            self.ranges
                .iter()
                .map(move |range| Ok::<_, EvidenceError>(self.describe(range))),
        ))
    }

    fn open(&self, descriptor: &EvidenceDescriptor) -> Result<EvidenceStream, EvidenceError> {
        self.resolver.open(&descriptor.backing)
    }
}

#[derive(Debug, Deserialize)]
struct ManifestLine {
    #[serde(default)]
    path: Option<String>,
    global_start: u64,
    size: u64,
}

/// Reads ranges from a carving manifest (JSONL with `path`, `global_start`, `size`).
///
/// Malformed lines are skipped with a warning.
pub fn load_manifest_ranges(path: &Path) -> Result<Vec<ImageRange>, EvidenceError> {
    let reader = BufReader::new(File::open(path)?);
    let mut ranges = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ManifestLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    "skipping manifest line {} in {}: {err}",
                    line_no + 1,
                    path.display()
                );
                continue;
            }
        };
        let name = parsed
            .path
            .as_deref()
            .and_then(|p| p.rsplit(['/', '\\']).next())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("range_{:012X}", parsed.global_start));
        ranges.push(ImageRange {
            name,
            offset: parsed.global_start,
            length: parsed.size,
        });
    }
    Ok(ranges)
}
