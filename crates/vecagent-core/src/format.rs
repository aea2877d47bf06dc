//! Object file format (`objects.vdb`)
//!
//! # File Structure
//!
//! ```text
//! Offset   Size        Type        Description
//! ──────────────────────────────────────────────────
//! 0x00     8           [u8; 8]     Magic: "VAOBJ001"
//! 0x08     4           u32 LE      N: Number of objects
//! 0x0C     4           u32 LE      D: Dimensions
//! 0x10     N*(4+D*4)   records     ObjectId (u32 LE) + D × f32 LE
//! ```
//!
//! Records are written in ascending ObjectId order; ids are not contiguous
//! once objects have been removed.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use thiserror::Error;

/// Magic bytes identifying an object file: "VAOBJ001"
pub const MAGIC: [u8; 8] = *b"VAOBJ001";

/// Header size in bytes: 8 (magic) + 4 (count) + 4 (dims) = 16
pub const HEADER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected VAOBJ001")]
    InvalidMagic,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Reserved object id 0 in object file")]
    ReservedId,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed object file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub count: u32,
    pub dimensions: u32,
}

impl ObjectHeader {
    /// Parse header from the first 16 bytes of a file
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "File too small for header",
            )));
        }
        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[8..12]);
        let count = u32::from_le_bytes(word);
        word.copy_from_slice(&bytes[12..16]);
        let dimensions = u32::from_le_bytes(word);

        Ok(Self { count, dimensions })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf
    }

    /// Size of one `(id, vector)` record in bytes
    pub fn record_size(&self) -> usize {
        4 + self.dimensions as usize * std::mem::size_of::<f32>()
    }
}

/// Streaming writer for object files
pub struct ObjectWriter {
    writer: BufWriter<File>,
    dimensions: usize,
    count: u32,
}

impl ObjectWriter {
    pub fn new<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        // Placeholder count, patched in finish()
        let header = ObjectHeader {
            count: 0,
            dimensions: dimensions as u32,
        };
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            writer,
            dimensions,
            count: 0,
        })
    }

    pub fn write_object(&mut self, id: u32, vector: &[f32]) -> Result<(), FormatError> {
        if id == 0 {
            return Err(FormatError::ReservedId);
        }
        if vector.len() != self.dimensions {
            return Err(FormatError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        self.writer.write_all(&id.to_le_bytes())?;
        for &val in vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    /// Patch the header count and fsync. Returns the number of records.
    pub fn finish(mut self) -> Result<u32, FormatError> {
        self.writer.flush()?;

        let file = self.writer.get_mut();
        file.seek(io::SeekFrom::Start(8))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;

        Ok(self.count)
    }
}

/// Read every `(id, vector)` record of an object file.
pub fn read_objects<P: AsRef<Path>>(path: P) -> Result<(ObjectHeader, Vec<(u32, Vec<f32>)>), FormatError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut head = [0u8; HEADER_SIZE];
    reader.read_exact(&mut head)?;
    let header = ObjectHeader::from_bytes(&head)?;

    let dim = header.dimensions as usize;
    let mut records = Vec::with_capacity(header.count as usize);
    let mut record = vec![0u8; header.record_size()];
    for _ in 0..header.count {
        reader.read_exact(&mut record)?;
        let id = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        if id == 0 {
            return Err(FormatError::ReservedId);
        }
        let vector = record[4..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect::<Vec<_>>();
        debug_assert_eq!(vector.len(), dim);
        records.push((id, vector));
    }

    Ok((header, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writer_then_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("objects.vdb");

        let mut writer = ObjectWriter::new(&path, 3).unwrap();
        writer.write_object(1, &[1.0, 2.0, 3.0]).unwrap();
        writer.write_object(7, &[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let (header, records) = read_objects(&path).unwrap();
        assert_eq!(header, ObjectHeader { count: 2, dimensions: 3 });
        assert_eq!(records[1], (7, vec![4.0, 5.0, 6.0]));
    }

    #[test]
    fn test_header_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("objects.vdb");

        let mut writer = ObjectWriter::new(&path, 2).unwrap();
        writer.write_object(3, &[0.5, 0.25]).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..8], b"VAOBJ001");
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 2);
        assert_eq!(bytes.len(), HEADER_SIZE + 4 + 2 * 4);
    }

    #[test]
    fn test_writer_rejects_bad_records() {
        let dir = tempdir().unwrap();
        let mut writer = ObjectWriter::new(dir.path().join("o.vdb"), 4).unwrap();

        let wrong_dim = writer.write_object(1, &[1.0, 2.0, 3.0]);
        assert!(matches!(wrong_dim, Err(FormatError::DimensionMismatch { .. })));

        let reserved = writer.write_object(0, &[1.0, 2.0, 3.0, 4.0]);
        assert!(matches!(reserved, Err(FormatError::ReservedId)));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = ObjectHeader { count: 0, dimensions: 4 }.to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            ObjectHeader::from_bytes(&bytes),
            Err(FormatError::InvalidMagic)
        ));
    }
}
