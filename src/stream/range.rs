use std::io;
use std::sync::Arc;

use crate::evidence::BackingStore;

use super::ByteBacking;

/// A window `[start, start + len)` over a shared acquisition image.
pub struct RangeBacking {
    store: Arc<dyn BackingStore>,
    start: u64,
    len: u64,
}

impl RangeBacking {
    /// Fails when the window does not fit inside the store.
    pub fn new(store: Arc<dyn BackingStore>, start: u64, len: u64) -> io::Result<Self> {
        let end = start.checked_add(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "range end overflows")
        })?;
        if end > store.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {start}+{len} extends past image size {}",
                    store.len()
                ),
            ));
        }
        Ok(Self { store, start, len })
    }
}

impl ByteBacking for RangeBacking {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let want = (self.len - offset).min(buf.len() as u64) as usize;
        self.store
            .read_at(self.start + offset, &mut buf[..want])
            .map_err(io::Error::other)
    }

    fn kind(&self) -> &'static str {
        "image_range"
    }
}
