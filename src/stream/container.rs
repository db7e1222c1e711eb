use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::ByteBacking;

/// Decompressed bytes of a container entry.
///
/// Entries are materialised once when the stream is opened; small ones stay
/// in memory, larger ones spill to an anonymous temp file that the OS
/// reclaims when the backing is dropped.
pub enum ContainerBacking {
    Memory(Vec<u8>),
    Spilled { file: File, len: u64 },
}

impl ContainerBacking {
    pub fn memory(data: Vec<u8>) -> Self {
        ContainerBacking::Memory(data)
    }

    /// Drains `reader`, keeping at most `memory_limit` bytes in memory.
    ///
    /// `max_len` caps the decompressed size; exceeding it is an error so that
    /// a decompression bomb cannot exhaust the disk.
    pub fn from_reader<R: Read>(
        reader: &mut R,
        memory_limit: u64,
        max_len: Option<u64>,
    ) -> io::Result<Self> {
        let cap = max_len.unwrap_or(u64::MAX);
        let mut limited = reader.take(cap.saturating_add(1));

        let mut buf = Vec::new();
        (&mut limited)
            .take(memory_limit.saturating_add(1))
            .read_to_end(&mut buf)?;
        if buf.len() as u64 > cap {
            return Err(too_large(cap));
        }
        if buf.len() as u64 <= memory_limit {
            return Ok(ContainerBacking::Memory(buf));
        }

        let mut file = tempfile::tempfile()?;
        file.write_all(&buf)?;
        drop(buf);
        io::copy(&mut limited, &mut file)?;
        let len = file.stream_position()?;
        if len > cap {
            return Err(too_large(cap));
        }
        file.flush()?;
        Ok(ContainerBacking::Spilled { file, len })
    }
}

fn too_large(cap: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("container entry exceeds {cap} bytes once decompressed"),
    )
}

impl ByteBacking for ContainerBacking {
    fn len(&self) -> u64 {
        match self {
            ContainerBacking::Memory(data) => data.len() as u64,
            ContainerBacking::Spilled { len, .. } => *len,
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ContainerBacking::Memory(data) => {
                let Ok(start) = usize::try_from(offset) else {
                    return Ok(0);
                };
                if start >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            ContainerBacking::Spilled { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.read(buf)
            }
        }
    }

    fn kind(&self) -> &'static str {
        "container_entry"
    }
}
