use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::core::error::Result;

/// Receives a copy of everything the writer sends to disk, so freshly
/// written bytes can be picked up by the in-memory cache without a
/// re-read.
pub trait WriteCache {
    fn set_data(&mut self, data: &[u8], pos: u64);
}

/// Buffers writes into large aligned chunks before they hit the file.
/// `flush()` must be called before dropping; the file position is logical
/// and includes buffered bytes.
pub struct BufferedFileWriter<'a> {
    file: &'a File,
    buffer: Vec<u8>,
    buffer_size: usize,
    file_position: u32,
    write_count: u32,
    cache: Option<&'a mut dyn WriteCache>,
}

impl<'a> BufferedFileWriter<'a> {
    pub fn new(file: &'a File, buffer_size: usize) -> Self {
        BufferedFileWriter {
            file,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            file_position: 0,
            write_count: 0,
            cache: None,
        }
    }

    pub fn set_cache(&mut self, cache: &'a mut dyn WriteCache) {
        self.cache = Some(cache);
    }

    pub fn file_position(&self) -> u32 {
        self.file_position
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// How many times buffered data was pushed to disk.
    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if let Some(cache) = self.cache.as_deref_mut() {
            cache.set_data(data, self.file_position as u64);
        }
        while !data.is_empty() {
            let room = self.buffer_size - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            self.file_position += take as u32;
            data = &data[take..];
            if self.buffer.len() == self.buffer_size {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Append `size` bytes of 0xFF filler.
    pub fn write_garbage(&mut self, size: u32) -> Result<()> {
        let filler = [0xffu8; 4096];
        let mut left = size as usize;
        while left > 0 {
            let take = left.min(filler.len());
            self.write(&filler[..take])?;
            left -= take;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let start = self.file_position as u64 - self.buffer.len() as u64;
            self.file.write_all_at(&self.buffer, start)?;
            self.buffer.clear();
            self.write_count += 1;
        }
        Ok(())
    }

    /// Flush, then continue writing from `pos`.
    pub fn set_file_position(&mut self, pos: u32) -> Result<()> {
        self.flush()?;
        self.file_position = pos;
        Ok(())
    }
}
