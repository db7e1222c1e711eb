use std::fs::File;
use std::io;
use std::path::Path;

use super::ByteBacking;

/// A plain file opened read-only for the lifetime of one stream.
pub struct FileBacking {
    file: File,
    len: u64,
}

impl FileBacking {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        Ok(Self {
            file,
            len: metadata.len(),
        })
    }
}

impl ByteBacking for FileBacking {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read(buf)
        }
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}
