//! # Seekable Evidence Streams
//!
//! Random access to one evidence item's bytes, whatever the backing store.
//!
//! Tasks only ever see [`SeekableStream`]. The single implementation,
//! [`EvidenceStream`], owns the position, the bounded-rewind mark and the
//! closed flag, and delegates positional reads to a [`ByteBacking`] variant:
//! a plain file, a byte range of an acquisition image, or a decompressed
//! container entry.

pub mod container;
pub mod file;
pub mod range;

use std::io;

use thiserror::Error;

use crate::constants::MAX_EMPTY_READS;

pub use container::ContainerBacking;
pub use file::FileBacking;
pub use range::RangeBacking;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream already closed")]
    Closed,
    #[error("mark limit exceeded: consumed {consumed} bytes since mark, limit {limit}")]
    MarkLimitExceeded { consumed: u64, limit: u64 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a single read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// Bytes were copied into the buffer. Zero means "try again", never end of stream.
    Bytes(usize),
    Eof,
}

/// Positional byte access implemented by each backing-store variant.
///
/// Dropping the backing releases the underlying resource.
pub trait ByteBacking: Send {
    fn len(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn kind(&self) -> &'static str;
}

/// Capability interface consumed by processing tasks.
pub trait SeekableStream: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadResult, StreamError>;
    /// Moves forward by up to `n` bytes, stopping at the end of the stream.
    fn skip(&mut self, n: u64) -> Result<u64, StreamError>;
    fn seek(&mut self, position: u64) -> Result<(), StreamError>;
    fn position(&self) -> Result<u64, StreamError>;
    fn size(&self) -> Result<u64, StreamError>;
    /// Records the current position; a later `mark` replaces it.
    fn mark(&mut self, limit: u64) -> Result<(), StreamError>;
    fn reset(&mut self) -> Result<(), StreamError>;
    /// Advisory remaining-bytes estimate, for buffering hints only.
    fn available(&self) -> Result<u64, StreamError>;
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mark {
    position: u64,
    limit: u64,
}

pub struct EvidenceStream {
    backing: Option<Box<dyn ByteBacking>>,
    position: u64,
    mark: Option<Mark>,
}

impl EvidenceStream {
    pub fn new(backing: Box<dyn ByteBacking>) -> Self {
        Self {
            backing: Some(backing),
            position: 0,
            mark: None,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::new(Box::new(ContainerBacking::memory(data)))
    }

    /// Backing kind, or `None` once closed.
    pub fn backing_kind(&self) -> Option<&'static str> {
        self.backing.as_ref().map(|b| b.kind())
    }

    fn backing(&self) -> Result<&dyn ByteBacking, StreamError> {
        self.backing.as_deref().ok_or(StreamError::Closed)
    }

    fn backing_mut(&mut self) -> Result<&mut Box<dyn ByteBacking>, StreamError> {
        self.backing.as_mut().ok_or(StreamError::Closed)
    }
}

impl std::fmt::Debug for EvidenceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceStream")
            .field("backing", &self.backing_kind())
            .field("position", &self.position)
            .field("mark", &self.mark)
            .finish()
    }
}

impl SeekableStream for EvidenceStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadResult, StreamError> {
        let position = self.position;
        let backing = self.backing_mut()?;
        let len = backing.len();
        if position >= len {
            return Ok(ReadResult::Eof);
        }
        let want = (len - position).min(buf.len() as u64) as usize;
        if want == 0 {
            return Ok(ReadResult::Bytes(0));
        }
        let n = backing.read_at(position, &mut buf[..want])?;
        self.position = position + n as u64;
        Ok(ReadResult::Bytes(n))
    }

    fn skip(&mut self, n: u64) -> Result<u64, StreamError> {
        let len = self.backing()?.len();
        let target = self.position.saturating_add(n).min(len);
        let skipped = target.saturating_sub(self.position);
        self.position = self.position.max(target);
        Ok(skipped)
    }

    fn seek(&mut self, position: u64) -> Result<(), StreamError> {
        self.backing()?;
        self.position = position;
        Ok(())
    }

    fn position(&self) -> Result<u64, StreamError> {
        self.backing()?;
        Ok(self.position)
    }

    fn size(&self) -> Result<u64, StreamError> {
        Ok(self.backing()?.len())
    }

    fn mark(&mut self, limit: u64) -> Result<(), StreamError> {
        self.backing()?;
        self.mark = Some(Mark {
            position: self.position,
            limit,
        });
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StreamError> {
        self.backing()?;
        // Without an explicit mark the stream behaves as if marked at 0 with limit 0.
        let mark = self.mark.unwrap_or(Mark {
            position: 0,
            limit: 0,
        });
        let consumed = self.position.saturating_sub(mark.position);
        if consumed > mark.limit {
            return Err(StreamError::MarkLimitExceeded {
                consumed,
                limit: mark.limit,
            });
        }
        self.position = mark.position;
        Ok(())
    }

    fn available(&self) -> Result<u64, StreamError> {
        let len = self.backing()?.len();
        Ok(len.saturating_sub(self.position).min(i64::MAX as u64))
    }

    fn close(&mut self) {
        if let Some(backing) = self.backing.take() {
            drop(backing);
            self.mark = None;
        }
    }

    fn is_closed(&self) -> bool {
        self.backing.is_none()
    }
}

impl Drop for EvidenceStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for EvidenceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut empty_reads = 0;
        loop {
            match SeekableStream::read(self, buf).map_err(into_io)? {
                ReadResult::Eof => return Ok(0),
                ReadResult::Bytes(0) => {
                    empty_reads += 1;
                    if empty_reads >= MAX_EMPTY_READS {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "backing store returned no data before end of stream",
                        ));
                    }
                }
                ReadResult::Bytes(n) => return Ok(n),
            }
        }
    }
}

impl io::Seek for EvidenceStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let len = SeekableStream::size(self).map_err(into_io)?;
        let current = SeekableStream::position(self).map_err(into_io)?;
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => len.checked_add_signed(delta),
            io::SeekFrom::Current(delta) => current.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        SeekableStream::seek(self, target).map_err(into_io)?;
        Ok(target)
    }
}

fn into_io(err: StreamError) -> io::Error {
    match err {
        StreamError::Io(err) => err,
        other => io::Error::other(other),
    }
}

/// Reads until `buf` is full or the stream ends, retrying zero-byte reads.
pub fn read_full(stream: &mut dyn SeekableStream, buf: &mut [u8]) -> Result<usize, StreamError> {
    let mut filled = 0usize;
    let mut empty_reads = 0u32;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..])? {
            ReadResult::Eof => break,
            ReadResult::Bytes(0) => {
                empty_reads += 1;
                if empty_reads >= MAX_EMPTY_READS {
                    return Err(StreamError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "backing store returned no data before end of stream",
                    )));
                }
            }
            ReadResult::Bytes(n) => {
                empty_reads = 0;
                filled += n;
            }
        }
    }
    Ok(filled)
}
