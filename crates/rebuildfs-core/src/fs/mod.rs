/// File system detection and module organization
use anyhow::Result;
use std::path::Path;

pub mod common;
pub mod ntfs;

use crate::FsKind;
use common::{BlockDevice, ImageSource, SECTOR_SIZE};

/// A boot sector found by a linear scan of the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedBootSector {
    pub kind: FsKind,
    pub sector: u64,
    pub consistent: bool,
}

/// Check every sector of `device` for boot sectors of a supported kind
pub fn detect_boot_sectors(device: &dyn ImageSource) -> Vec<DetectedBootSector> {
    let total = device.len() / SECTOR_SIZE;
    let mut found = Vec::new();

    for sector in 0..total {
        let Ok(data) = device.read_sectors(sector, 1) else {
            continue;
        };
        if ntfs::is_ntfs_boot_sector(data) {
            let consistent = ntfs::NtfsBootSector::parse(data)
                .map(|boot| boot.validate().is_ok())
                .unwrap_or(false);
            found.push(DetectedBootSector {
                kind: FsKind::Ntfs,
                sector,
                consistent,
            });
        }
    }

    found
}

/// Detect file system kind from the first sector of a device/image
pub fn detect_filesystem(device_path: &Path) -> Result<Option<FsKind>> {
    let device = BlockDevice::open(device_path)?;

    if let Ok(sector0) = device.read_sectors(0, 1) {
        if ntfs::is_ntfs_boot_sector(sector0) {
            return Ok(Some(FsKind::Ntfs));
        }
    }

    Ok(None)
}

/// Get human-readable file system information for a boot sector
pub fn get_filesystem_info(device: &dyn ImageSource, kind: FsKind, sector: u64) -> Result<String> {
    match kind {
        FsKind::Ntfs => ntfs::get_filesystem_info(device, sector),
    }
}
