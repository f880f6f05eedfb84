//! Memory-mapped segment reader
//!
//! Zero-copy access to sealed `.vec` segment files through the OS page cache.
//!
//! # Safety
//!
//! Rows are reinterpreted with `bytemuck::try_cast_slice`, which checks
//! alignment, so unaligned maps fail cleanly instead of faulting on ARM.
//! Sealed segments are immutable; the mapping is only invalid if someone
//! truncates a published file behind the index's back.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::format::{FormatError, SegmentHeader, HEADER_SIZE};

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Row out of bounds: {index} >= {count}")]
    RowOutOfBounds { index: usize, count: usize },

    #[error("Alignment error: segment bytes not aligned to f32")]
    AlignmentError,
}

/// Read-only view over one sealed segment
pub struct SegmentVectors {
    mmap: Mmap,
    pub count: usize,
    pub dim: usize,
}

impl SegmentVectors {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SegmentError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let header = SegmentHeader::from_bytes(&mmap)?;
        let expected = header.file_size();
        if mmap.len() != expected {
            return Err(FormatError::Truncated {
                expected,
                actual: mmap.len(),
            }
            .into());
        }

        Ok(Self {
            mmap,
            count: header.count as usize,
            dim: header.dimensions as usize,
        })
    }

    pub fn row(&self, index: usize) -> Result<&[f32], SegmentError> {
        if index >= self.count {
            return Err(SegmentError::RowOutOfBounds {
                index,
                count: self.count,
            });
        }

        let width = self.dim * std::mem::size_of::<f32>();
        let start = HEADER_SIZE + index * width;
        bytemuck::try_cast_slice(&self.mmap[start..start + width])
            .map_err(|_| SegmentError::AlignmentError)
    }

    /// All rows as one row-major slice of `count * dim` floats.
    pub fn as_flat(&self) -> Result<&[f32], SegmentError> {
        bytemuck::try_cast_slice(&self.mmap[HEADER_SIZE..]).map_err(|_| SegmentError::AlignmentError)
    }

    /// Copy every row out of the map.
    pub fn to_rows(&self) -> Result<Vec<Vec<f32>>, SegmentError> {
        (0..self.count).map(|i| self.row(i).map(|r| r.to_vec())).collect()
    }

    pub fn iter(&self) -> RowIter<'_> {
        RowIter {
            segment: self,
            index: 0,
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.mmap.len()
    }
}

/// Iterator over segment rows
pub struct RowIter<'a> {
    segment: &'a SegmentVectors,
    index: usize,
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Result<&'a [f32], SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.segment.count {
            return None;
        }
        let row = self.segment.row(self.index);
        self.index += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.segment.count - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for RowIter<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::write_segment;
    use tempfile::tempdir;

    #[test]
    fn test_open_and_read_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.vec");
        write_segment(&path, 3, &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]).unwrap();

        let seg = SegmentVectors::open(&path).unwrap();
        assert_eq!(seg.count, 2);
        assert_eq!(seg.dim, 3);
        assert_eq!(seg.row(1).unwrap(), &[0.0, 1.0, 0.0]);
        assert_eq!(seg.as_flat().unwrap(), &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(seg.iter().count(), 2);
        assert!(matches!(seg.row(2), Err(SegmentError::RowOutOfBounds { .. })));
    }

    #[test]
    fn test_truncated_segment_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.vec");
        write_segment(&path, 4, &[vec![1.0; 4], vec![2.0; 4]]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(matches!(
            SegmentVectors::open(&path),
            Err(SegmentError::Format(FormatError::Truncated { .. }))
        ));
    }

    #[test]
    fn test_empty_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.vec");
        write_segment(&path, 8, &[]).unwrap();
        let seg = SegmentVectors::open(&path).unwrap();
        assert_eq!(seg.count, 0);
        assert!(seg.to_rows().unwrap().is_empty());
    }
}
