//! The on-disk backing store for flushable records.
//!
//! Extents are append-allocated; nothing is reclaimed within a render
//! context. The layout is opaque to everything above the database.

use crate::error::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug)]
pub struct Extent {
    pub offset: u64,
    pub len: u32,
}

pub struct PageFile {
    file: File,
    path: PathBuf,
    next_offset: u64,
}

impl PageFile {
    pub fn open(path: &Path) -> Result<PageFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(PageFile {
            file,
            path: path.to_owned(),
            next_offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record image, returning the extent to read it back.
    pub fn write_record(&mut self, type_id: u32, bytes: &[u8]) -> Result<Extent> {
        let offset = self.next_offset;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_u32::<LittleEndian>(type_id)?;
        self.file.write_u32::<LittleEndian>(bytes.len() as u32)?;
        self.file.write_all(bytes)?;
        self.next_offset = offset + 8 + bytes.len() as u64;
        Ok(Extent {
            offset,
            len: bytes.len() as u32,
        })
    }

    /// Reads a record image back; the stored type id is returned so the
    /// caller can cross-check against the record header.
    pub fn read_record(&mut self, extent: Extent) -> Result<(u32, Vec<u8>)> {
        self.file.seek(SeekFrom::Start(extent.offset))?;
        let type_id = self.file.read_u32::<LittleEndian>()?;
        let len = self.file.read_u32::<LittleEndian>()?;
        debug_assert_eq!(len, extent.len);
        let mut bytes = vec![0u8; len as usize];
        self.file.read_exact(&mut bytes)?;
        Ok((type_id, bytes))
    }

    pub fn bytes_written(&self) -> u64 {
        self.next_offset
    }
}

impl Drop for PageFile {
    fn drop(&mut self) {
        // best-effort cleanup, the file is per render context
        let _ = std::fs::remove_file(&self.path);
    }
}
