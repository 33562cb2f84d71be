use std::io::{self, Read, Seek, SeekFrom, Write};

/// Positional reads over a seekable byte source.
///
/// Implemented for every `Read + Seek` type, so a `File`, a `BufReader<File>`
/// and a `Cursor<Vec<u8>>` can all back a TIFF directory walk.
pub trait RandomRead {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns `UnexpectedEof` if the range runs past the end of the source.
    fn read_exact_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Total size of the source in bytes.
    fn size(&mut self) -> io::Result<u64>;
}

/// Positional writes on top of [`RandomRead`], used for in-place patching.
pub trait RandomAccess: RandomRead {
    /// Overwrite `data.len()` bytes starting at `offset`.
    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Flush pending writes to the underlying storage.
    fn flush_all(&mut self) -> io::Result<()>;
}

impl<T: Read + Seek> RandomRead for T {
    fn read_exact_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let size = self.size()?;
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > size) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "range out of bounds: {} bytes at offset {}, size is {}",
                    len, offset, size
                ),
            ));
        }

        self.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::End(0))
    }
}

impl<T: Read + Write + Seek> RandomAccess for T {
    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }

    fn flush_all(&mut self) -> io::Result<()> {
        self.flush()
    }
}
