/// NTFS file system support
use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::common::{ImageSource, SECTOR_SIZE};

// Sub-modules
pub mod geometry;
pub mod index;
pub mod parser;
pub mod partition;
pub mod record;

/// NTFS OEM identifier at offset 3 of the boot sector
pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";

/// Boot sector end-of-sector marker
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

// Well-known MFT record numbers
pub const MFT_RECORD: u64 = 0;
pub const MFT_MIRROR_RECORD: u64 = 1;
pub const ROOT_RECORD: u64 = 5;
pub const BAD_CLUSTERS_RECORD: u64 = 8;

/// Record size assumed when no boot sector tells us otherwise
pub const DEFAULT_RECORD_SIZE: u32 = 1024;

/// Index (INDX) block size assumed when scanning for index records
pub const DEFAULT_INDEX_BLOCK_SIZE: u32 = 4096;

/// Largest cluster size accepted as plausible (2 MiB)
const MAX_CLUSTER_SIZE: u64 = 2 * 1024 * 1024;

/// NTFS boot sector (BIOS parameter block fields we rely on)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtfsBootSector {
    pub oem_id: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster_raw: u8,
    pub total_sectors: u64,
    pub mft_cluster: u64,
    pub mft_mirror_cluster: u64,
    pub clusters_per_record: i8,
    pub clusters_per_index: i8,
    pub serial_number: u64,
    pub signature: [u8; 2],
}

impl NtfsBootSector {
    /// Parse an NTFS boot sector from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 512 {
            anyhow::bail!("Insufficient data for NTFS boot sector");
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(3);

        let mut oem_id = [0u8; 8];
        std::io::Read::read_exact(&mut cursor, &mut oem_id)?;

        if &oem_id != NTFS_OEM_ID {
            anyhow::bail!("Invalid NTFS OEM identifier");
        }

        let bytes_per_sector = cursor.read_u16::<LittleEndian>()?;
        let sectors_per_cluster_raw = cursor.read_u8()?;

        cursor.set_position(40);
        let total_sectors = cursor.read_u64::<LittleEndian>()?;
        let mft_cluster = cursor.read_u64::<LittleEndian>()?;
        let mft_mirror_cluster = cursor.read_u64::<LittleEndian>()?;
        let clusters_per_record = cursor.read_i8()?;

        cursor.set_position(68);
        let clusters_per_index = cursor.read_i8()?;

        cursor.set_position(72);
        let serial_number = cursor.read_u64::<LittleEndian>()?;

        let signature = [data[510], data[511]];

        Ok(NtfsBootSector {
            oem_id,
            bytes_per_sector,
            sectors_per_cluster_raw,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_record,
            clusters_per_index,
            serial_number,
            signature,
        })
    }

    /// Sectors per cluster; values above 0x80 encode a power of two
    pub fn sectors_per_cluster(&self) -> u32 {
        let raw = self.sectors_per_cluster_raw;
        if raw > 0x80 {
            1u32.checked_shl(256 - raw as u32).unwrap_or(0)
        } else {
            raw as u32
        }
    }

    /// Bytes per cluster
    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster() as u64
    }

    /// Size of one MFT record in bytes
    pub fn record_size(&self) -> u64 {
        decode_cluster_count(self.clusters_per_record, self.cluster_size())
    }

    /// Size of one index block in bytes
    pub fn index_block_size(&self) -> u64 {
        decode_cluster_count(self.clusters_per_index, self.cluster_size())
    }

    /// MFT position relative to the partition start, in 512-byte sectors
    pub fn mft_relative_sector(&self) -> u64 {
        self.mft_cluster.saturating_mul(self.cluster_size()) / SECTOR_SIZE
    }

    /// MFT mirror position relative to the partition start, in 512-byte sectors
    pub fn mirror_relative_sector(&self) -> u64 {
        self.mft_mirror_cluster.saturating_mul(self.cluster_size()) / SECTOR_SIZE
    }

    /// Volume size in 512-byte sectors
    pub fn volume_sectors(&self) -> u64 {
        self.total_sectors
            .saturating_mul(self.bytes_per_sector as u64)
            / SECTOR_SIZE
    }

    /// Check that the structural fields are internally consistent
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.signature != BOOT_SIGNATURE {
            return Err("missing 0x55AA marker");
        }
        let bps = self.bytes_per_sector;
        if !bps.is_power_of_two() || !(256..=4096).contains(&bps) {
            return Err("implausible bytes per sector");
        }
        let spc = self.sectors_per_cluster();
        if spc == 0 || !spc.is_power_of_two() {
            return Err("sectors per cluster is not a power of two");
        }
        if self.cluster_size() > MAX_CLUSTER_SIZE {
            return Err("implausible cluster size");
        }
        if self.total_sectors == 0 {
            return Err("empty volume");
        }
        let clusters = self.total_sectors / spc as u64;
        if self.mft_cluster == 0 || self.mft_cluster > clusters {
            return Err("MFT outside of the volume");
        }
        if self.mft_mirror_cluster == 0 || self.mft_mirror_cluster > clusters {
            return Err("MFT mirror outside of the volume");
        }
        let record = self.record_size();
        if !record.is_power_of_two() || !(256..=65536).contains(&record) {
            return Err("implausible record size");
        }
        Ok(())
    }
}

/// Decode a "clusters per X" byte: positive values count clusters, negative
/// values are a power-of-two byte size.
fn decode_cluster_count(value: i8, cluster_size: u64) -> u64 {
    if value > 0 {
        value as u64 * cluster_size
    } else {
        1u64.checked_shl((-(value as i32)) as u32).unwrap_or(0)
    }
}

/// Check if a sector looks like an NTFS boot sector
pub fn is_ntfs_boot_sector(data: &[u8]) -> bool {
    if data.len() < 512 {
        return false;
    }

    &data[3..11] == NTFS_OEM_ID && data[510..512] == BOOT_SIGNATURE
}

/// Human-readable NTFS information for the boot sector at `sector`
pub fn get_filesystem_info(device: &dyn ImageSource, sector: u64) -> Result<String> {
    let data = device.read_sectors(sector, 1)?;
    let boot = NtfsBootSector::parse(data)?;

    let volume_size_mb = boot.volume_sectors() * SECTOR_SIZE / (1024 * 1024);
    let status = match boot.validate() {
        Ok(()) => "consistent".to_string(),
        Err(reason) => format!("inconsistent ({})", reason),
    };

    Ok(format!(
        "NTFS Boot Sector at sector {}\n\
         - Bytes per Sector: {}\n\
         - Sectors per Cluster: {}\n\
         - Bytes per Cluster: {}\n\
         - Volume Size: {} MB\n\
         - MFT Cluster: {}\n\
         - MFT Mirror Cluster: {}\n\
         - Record Size: {} bytes\n\
         - Index Block Size: {} bytes\n\
         - Volume Serial: 0x{:016X}\n\
         - Fields: {}",
        sector,
        boot.bytes_per_sector,
        boot.sectors_per_cluster(),
        boot.cluster_size(),
        volume_size_mb,
        boot.mft_cluster,
        boot.mft_mirror_cluster,
        boot.record_size(),
        boot.index_block_size(),
        boot.serial_number,
        status
    ))
}
