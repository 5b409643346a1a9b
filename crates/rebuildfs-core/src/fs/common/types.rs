/// Read-only image access
use memmap2::MmapOptions;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{RebuildError, Result};

/// Size of a disk sector as seen by the scanner
pub const SECTOR_SIZE: u64 = 512;

/// A read-only, randomly addressable byte source of known length
///
/// Implementations must tolerate concurrent readers at disjoint offsets.
pub trait ImageSource: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    /// Read exactly `length` bytes at `offset`
    fn read_at(&self, offset: u64, length: usize) -> Result<&[u8]>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `length` bytes, truncated at the end of the image
    fn read_clamped(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let len = self.len();
        if offset >= len {
            return Ok(&[]);
        }
        let available = (len - offset).min(length as u64) as usize;
        self.read_at(offset, available)
    }

    /// Read whole sectors starting at `sector`
    fn read_sectors(&self, sector: u64, count: u64) -> Result<&[u8]> {
        self.read_at(sector * SECTOR_SIZE, (count * SECTOR_SIZE) as usize)
    }

    /// Path of the underlying file, when there is one
    fn path(&self) -> Option<&Path> {
        None
    }
}

fn out_of_range(offset: u64, length: usize, size: u64) -> RebuildError {
    RebuildError::ImageRead {
        offset,
        len: length as u64,
        reason: format!("read beyond end of image ({} bytes)", size),
    }
}

/// A memory-mapped image file or raw device
pub struct BlockDevice {
    _file: File,
    mmap: memmap2::Mmap,
    size: u64,
    path: PathBuf,
}

impl BlockDevice {
    /// Open a block device or image file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();

        if size == 0 {
            return Err(RebuildError::EmptyImage);
        }

        let mmap = unsafe { MmapOptions::new().map(&file)? };

        tracing::debug!("Mapped {} ({} bytes)", path.as_ref().display(), size);

        Ok(BlockDevice {
            _file: file,
            size: mmap.len() as u64,
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl ImageSource for BlockDevice {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(length as u64)
            .ok_or_else(|| out_of_range(offset, length, self.size))?;
        if end > self.size {
            return Err(out_of_range(offset, length, self.size));
        }
        Ok(&self.mmap[offset as usize..end as usize])
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// An image held in memory
///
/// Ranges listed as unreadable fail like a bad sector on a real device, which
/// lets tests exercise the error-tolerant paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    data: Vec<u8>,
    unreadable: Vec<std::ops::Range<u64>>,
}

impl MemoryImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            unreadable: Vec::new(),
        }
    }

    /// Mark a byte range as failing every read that touches it
    pub fn with_unreadable(mut self, range: std::ops::Range<u64>) -> Self {
        self.unreadable.push(range);
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl ImageSource for MemoryImage {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(length as u64)
            .ok_or_else(|| out_of_range(offset, length, self.len()))?;
        if end > self.len() {
            return Err(out_of_range(offset, length, self.len()));
        }
        if self
            .unreadable
            .iter()
            .any(|bad| offset < bad.end && bad.start < end)
        {
            return Err(RebuildError::ImageRead {
                offset,
                len: length as u64,
                reason: "simulated media error".to_string(),
            });
        }
        Ok(&self.data[offset as usize..end as usize])
    }
}

/// Common byte range representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    /// Part of this range lying inside `[0, limit)`
    pub fn clamp_to(&self, limit: u64) -> Option<ByteRange> {
        if self.start >= limit {
            return None;
        }
        Some(ByteRange::new(self.start, self.end().min(limit) - self.start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_image_reads() {
        let image = MemoryImage::new((0u8..=255).collect());
        assert_eq!(image.len(), 256);
        assert_eq!(image.read_at(10, 3).unwrap(), &[10, 11, 12]);
        assert!(image.read_at(250, 10).is_err());
        assert_eq!(image.read_clamped(250, 10).unwrap().len(), 6);
        assert!(image.read_clamped(300, 10).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_range() {
        let image = MemoryImage::new(vec![0u8; 2048]).with_unreadable(512..1024);
        assert!(image.read_sectors(0, 1).is_ok());
        assert!(matches!(
            image.read_sectors(1, 1),
            Err(RebuildError::ImageRead { .. })
        ));
        assert!(image.read_at(1000, 100).is_err());
        assert!(image.read_sectors(2, 2).is_ok());
    }

    #[test]
    fn test_byte_range_clamp() {
        let range = ByteRange::new(100, 50);
        assert_eq!(range.end(), 150);
        assert_eq!(range.clamp_to(120), Some(ByteRange::new(100, 20)));
        assert_eq!(range.clamp_to(200), Some(range));
        assert_eq!(range.clamp_to(100), None);
    }

    #[test]
    fn test_open_empty_file_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.img");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            BlockDevice::open(&path),
            Err(RebuildError::EmptyImage)
        ));
    }
}
