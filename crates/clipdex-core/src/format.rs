//! Sealed segment file format (`.vec`)
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "CLIPSEG1"
//! 0x08     4       u32 LE      N: Number of rows
//! 0x0C     4       u32 LE      D: Dimensions
//! 0x10     N*D*4   [f32]       Row-major vectors (Little Endian)
//! ```
//!
//! Segments are written once into a staging path and renamed into place by
//! the caller; they are never modified afterwards.
//!
//! # Example
//!
//! ```ignore
//! let mut writer = SegmentWriter::create("staging/seg.vec.tmp", 512)?;
//! writer.write_row(&embedding)?;
//! let rows = writer.finish()?;
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Seek, Write};
use std::path::Path;

use thiserror::Error;

/// Magic bytes identifying a segment file: "CLIPSEG1"
pub const MAGIC: [u8; 8] = *b"CLIPSEG1";

/// Header size in bytes: 8 (magic) + 4 (count) + 4 (dims) = 16
pub const HEADER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected CLIPSEG1")]
    InvalidMagic,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Truncated segment: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub count: u32,
    pub dimensions: u32,
}

impl SegmentHeader {
    /// Parse header from the first 16 bytes of a segment file
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let dimensions = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        Ok(Self { count, dimensions })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf
    }

    /// Byte offset of row `index`
    #[inline(always)]
    pub fn offset(&self, index: usize) -> usize {
        HEADER_SIZE + index * self.dimensions as usize * std::mem::size_of::<f32>()
    }

    /// Exact file size implied by the header
    pub fn file_size(&self) -> usize {
        self.offset(self.count as usize)
    }
}

/// Streaming writer for segment files
pub struct SegmentWriter {
    writer: BufWriter<File>,
    dimensions: usize,
    count: u32,
}

impl SegmentWriter {
    /// Create the file and write a placeholder header (count patched in `finish`)
    pub fn create<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let header = SegmentHeader {
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

    pub fn write_row(&mut self, vector: &[f32]) -> Result<(), FormatError> {
        if vector.len() != self.dimensions {
            return Err(FormatError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        for &val in vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u32 {
        self.count
    }

    /// Patch the row count into the header and fsync. Returns the row count.
    pub fn finish(mut self) -> Result<u32, FormatError> {
        self.writer.flush()?;

        let file = self.writer.get_mut();
        file.seek(io::SeekFrom::Start(8))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;

        Ok(self.count)
    }
}

/// Convenience: write all rows in one go.
pub fn write_segment<P: AsRef<Path>>(
    path: P,
    dimensions: usize,
    rows: &[Vec<f32>],
) -> Result<u32, FormatError> {
    let mut writer = SegmentWriter::create(path, dimensions)?;
    for row in rows {
        writer.write_row(row)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_layout() {
        let header = SegmentHeader {
            count: 1000,
            dimensions: 512,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..8], b"CLIPSEG1");
        assert_eq!(SegmentHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.offset(1), 16 + 512 * 4);
        assert_eq!(header.file_size(), 16 + 1000 * 512 * 4);
    }

    #[test]
    fn test_writer_patches_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.vec");

        let count = write_segment(&path, 2, &[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]])
            .unwrap();
        assert_eq!(count, 3);

        let bytes = std::fs::read(&path).unwrap();
        let header = SegmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.count, 3);
        assert_eq!(header.dimensions, 2);
        assert_eq!(bytes.len(), header.file_size());
    }

    #[test]
    fn test_writer_rejects_wrong_width() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path().join("seg.vec"), 4).unwrap();
        assert!(matches!(
            writer.write_row(&[1.0, 2.0, 3.0]),
            Err(FormatError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = SegmentHeader { count: 0, dimensions: 3 }.to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(FormatError::InvalidMagic)
        ));
    }
}
