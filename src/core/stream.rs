//! Read-back streams

use std::fs::File;
use std::io::{self, Cursor, Read, Take};

enum Source {
    Memory(Cursor<Vec<u8>>),
    File(Take<File>),
}

/// Readable stream over exactly the bytes of one committed entry
pub struct FileStream {
    source: Source,
    len: u64,
}

impl FileStream {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        FileStream {
            source: Source::Memory(Cursor::new(bytes)),
            len,
        }
    }

    /// Stream the first `len` bytes of an open file
    pub fn from_file(file: File, len: u64) -> Self {
        FileStream {
            source: Source::File(file.take(len)),
            len,
        }
    }

    /// Total length of the entry
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.len as usize);
        self.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            Source::Memory(cursor) => cursor.read(buf),
            Source::File(file) => file.read(buf),
        }
    }
}
