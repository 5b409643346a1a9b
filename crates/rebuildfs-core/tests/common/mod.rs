//! Synthetic NTFS images for integration tests.
//!
//! The standard scenario is a 5 MiB image holding one volume that starts at
//! byte 1,048,576 with 4 KiB clusters and 1 KiB records. Its table holds the
//! root, nine files and directories, and one orphan whose parent is missing.
#![allow(dead_code)]

use rebuildfs_core::MemoryImage;

pub const SECTOR: u64 = 512;
pub const PART_START: u64 = 2048;
pub const VOLUME_SECTORS: u64 = 8192;
pub const SECTORS_PER_CLUSTER: u64 = 8;
pub const CLUSTER: u64 = SECTOR * SECTORS_PER_CLUSTER;
pub const MFT_CLUSTER: u64 = 4;
pub const MIRROR_CLUSTER: u64 = 512;
pub const MFT_SECTOR: u64 = PART_START + MFT_CLUSTER * SECTORS_PER_CLUSTER;
pub const RECORD_SIZE: usize = 1024;

const FLAG_IN_USE: u16 = 0x0001;
const FLAG_DIRECTORY: u16 = 0x0002;
const USN: [u8; 2] = [0x2A, 0x00];

/// Sector of record `n` in the scenario table
pub fn record_sector(n: u64) -> u64 {
    MFT_SECTOR + n * (RECORD_SIZE as u64 / SECTOR)
}

/// Absolute byte offset of cluster `lcn` of the scenario volume
pub fn cluster_offset(lcn: u64) -> u64 {
    PART_START * SECTOR + lcn * CLUSTER
}

/// Bytes written into the clusters of non-resident files
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 253) as u8)).collect()
}

fn filetime(unix: u64) -> u64 {
    (unix + 11_644_473_600) * 10_000_000
}

pub fn resident_attr(type_code: u32, content: &[u8]) -> Vec<u8> {
    let len = (24 + content.len() + 7) & !7;
    let mut attr = vec![0u8; len];
    attr[0..4].copy_from_slice(&type_code.to_le_bytes());
    attr[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    attr[16..20].copy_from_slice(&(content.len() as u32).to_le_bytes());
    attr[20..22].copy_from_slice(&24u16.to_le_bytes());
    attr[24..24 + content.len()].copy_from_slice(content);
    attr
}

fn file_name_content(parent: u64, name: &str, is_dir: bool, size: u64) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut content = vec![0u8; 66 + units.len() * 2];
    content[0..8].copy_from_slice(&(parent | (1u64 << 48)).to_le_bytes());
    // 2021-03-04T05:06:07Z
    let ft = filetime(1_614_834_367);
    for i in 0..4 {
        content[8 + i * 8..16 + i * 8].copy_from_slice(&ft.to_le_bytes());
    }
    content[40..48].copy_from_slice(&size.to_le_bytes());
    content[48..56].copy_from_slice(&size.to_le_bytes());
    if is_dir {
        content[56..60].copy_from_slice(&0x1000_0000u32.to_le_bytes());
    }
    content[64] = units.len() as u8;
    content[65] = 1; // Win32
    for (i, unit) in units.iter().enumerate() {
        content[66 + i * 2..68 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    content
}

pub fn file_name_attr(parent: u64, name: &str, is_dir: bool) -> Vec<u8> {
    resident_attr(0x30, &file_name_content(parent, name, is_dir, 0))
}

pub fn resident_data(content: &[u8]) -> Vec<u8> {
    resident_attr(0x80, content)
}

pub fn nonresident_data(runlist: &[u8], real_size: u64) -> Vec<u8> {
    nonresident_attr(0x80, runlist, real_size)
}

/// `$INDEX_ALLOCATION` of a directory whose blocks sit at `runlist`
pub fn index_allocation_attr(runlist: &[u8]) -> Vec<u8> {
    nonresident_attr(0xA0, runlist, 4096)
}

pub fn nonresident_attr(type_code: u32, runlist: &[u8], real_size: u64) -> Vec<u8> {
    let len = (64 + runlist.len() + 1 + 7) & !7;
    let mut attr = vec![0u8; len];
    attr[0..4].copy_from_slice(&type_code.to_le_bytes());
    attr[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    attr[8] = 1;
    attr[32..34].copy_from_slice(&64u16.to_le_bytes());
    attr[40..48].copy_from_slice(&real_size.to_le_bytes());
    attr[48..56].copy_from_slice(&real_size.to_le_bytes());
    attr[56..64].copy_from_slice(&real_size.to_le_bytes());
    attr[64..64 + runlist.len()].copy_from_slice(runlist);
    attr
}

/// Index entry for `$INDEX_ROOT` or an `INDX` block
pub fn index_entry(record: u64, parent: u64, name: &str, size: u64) -> Vec<u8> {
    let content = file_name_content(parent, name, false, size);
    let entry_len = (16 + content.len() + 7) & !7;
    let mut entry = vec![0u8; entry_len];
    entry[0..8].copy_from_slice(&record.to_le_bytes());
    entry[8..10].copy_from_slice(&(entry_len as u16).to_le_bytes());
    entry[10..12].copy_from_slice(&(content.len() as u16).to_le_bytes());
    entry[16..16 + content.len()].copy_from_slice(&content);
    entry
}

fn last_index_entry() -> Vec<u8> {
    let mut entry = vec![0u8; 16];
    entry[8..10].copy_from_slice(&16u16.to_le_bytes());
    entry[12..14].copy_from_slice(&2u16.to_le_bytes());
    entry
}

pub fn index_root_attr(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut content = vec![0u8; 32];
    content[0..4].copy_from_slice(&0x30u32.to_le_bytes());
    for entry in entries.iter().chain(std::iter::once(&last_index_entry())) {
        content.extend_from_slice(entry);
    }
    let used = (content.len() - 16) as u32;
    content[16..20].copy_from_slice(&16u32.to_le_bytes());
    content[20..24].copy_from_slice(&used.to_le_bytes());
    content[24..28].copy_from_slice(&used.to_le_bytes());
    resident_attr(0x90, &content)
}

/// A 4 KiB `INDX` block with fixups applied
pub fn indx_block(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut block = vec![0u8; 4096];
    block[0..4].copy_from_slice(b"INDX");
    block[4..6].copy_from_slice(&40u16.to_le_bytes());
    block[6..8].copy_from_slice(&9u16.to_le_bytes());

    let first = 64usize;
    let mut body = Vec::new();
    for entry in entries.iter().chain(std::iter::once(&last_index_entry())) {
        body.extend_from_slice(entry);
    }
    block[24..28].copy_from_slice(&((first - 24) as u32).to_le_bytes());
    block[28..32].copy_from_slice(&((first - 24 + body.len()) as u32).to_le_bytes());
    block[first..first + body.len()].copy_from_slice(&body);

    block[40..42].copy_from_slice(&USN);
    for i in 1..9usize {
        let end = i * 512;
        block[40 + 2 * i] = block[end - 2];
        block[41 + 2 * i] = block[end - 1];
        block[end - 2..end].copy_from_slice(&USN);
    }
    block
}

/// Resident `$ATTRIBUTE_LIST` naming the record that holds each attribute
pub fn attribute_list_attr(entries: &[(u32, u64)]) -> Vec<u8> {
    let mut content = Vec::new();
    for &(type_code, holder) in entries {
        let mut entry = [0u8; 32];
        entry[0..4].copy_from_slice(&type_code.to_le_bytes());
        entry[4..6].copy_from_slice(&32u16.to_le_bytes());
        entry[16..24].copy_from_slice(&(holder | (1u64 << 48)).to_le_bytes());
        content.extend_from_slice(&entry);
    }
    resident_attr(0x20, &content)
}

/// A 1 KiB `FILE` record with fixups applied
pub fn file_record(record_n: u32, is_dir: bool, attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = vec![0u8; RECORD_SIZE];
    let flags = if is_dir { FLAG_IN_USE | FLAG_DIRECTORY } else { FLAG_IN_USE };
    buf[0..4].copy_from_slice(b"FILE");
    buf[4..6].copy_from_slice(&48u16.to_le_bytes());
    buf[6..8].copy_from_slice(&3u16.to_le_bytes());
    buf[16..18].copy_from_slice(&1u16.to_le_bytes());
    buf[18..20].copy_from_slice(&1u16.to_le_bytes());
    buf[20..22].copy_from_slice(&56u16.to_le_bytes());
    buf[22..24].copy_from_slice(&flags.to_le_bytes());
    buf[28..32].copy_from_slice(&(RECORD_SIZE as u32).to_le_bytes());
    buf[44..48].copy_from_slice(&record_n.to_le_bytes());

    let mut off = 56;
    for attr in attrs {
        buf[off..off + attr.len()].copy_from_slice(attr);
        off += attr.len();
    }
    buf[off..off + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    off += 8;
    buf[24..28].copy_from_slice(&(off as u32).to_le_bytes());

    buf[48..50].copy_from_slice(&USN);
    for i in 1..3usize {
        let end = i * 512;
        buf[48 + 2 * i] = buf[end - 2];
        buf[49 + 2 * i] = buf[end - 1];
        buf[end - 2..end].copy_from_slice(&USN);
    }
    buf
}

pub fn boot_sector(total_sectors: u64, mft_cluster: u64, mirror_cluster: u64, serial: u64) -> Vec<u8> {
    let mut data = vec![0u8; 512];
    data[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    data[3..11].copy_from_slice(b"NTFS    ");
    data[11..13].copy_from_slice(&512u16.to_le_bytes());
    data[13] = SECTORS_PER_CLUSTER as u8;
    data[40..48].copy_from_slice(&total_sectors.to_le_bytes());
    data[48..56].copy_from_slice(&mft_cluster.to_le_bytes());
    data[56..64].copy_from_slice(&mirror_cluster.to_le_bytes());
    data[64] = 0xF6; // 1 KiB records
    data[68] = 1;
    data[72..80].copy_from_slice(&serial.to_le_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;
    data
}

/// Mutable byte image with helpers to place NTFS structures
pub struct ImageBuilder {
    data: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0u8; (sectors * SECTOR) as usize],
        }
    }

    /// The standard scenario: 11 valid records, one of them orphaned
    pub fn scenario() -> Self {
        let mut image = Self::new(PART_START + VOLUME_SECTORS);
        image.put_sector(PART_START, &boot_sector(VOLUME_SECTORS, MFT_CLUSTER, MIRROR_CLUSTER, 0xC0FFEE));

        image.put_record(5, true, &[file_name_attr(5, ".", true)]);
        image.put_record(16, true, &[file_name_attr(5, "docs", true)]);
        image.put_record(
            17,
            false,
            &[file_name_attr(16, "report.txt", false), resident_data(b"quarterly numbers\n")],
        );
        // one cluster at LCN 100
        image.put_record(
            18,
            false,
            &[file_name_attr(16, "photo.jpg", false), nonresident_data(&[0x11, 0x01, 0x64], CLUSTER)],
        );
        image.put_bytes(cluster_offset(100), &pattern(18, CLUSTER as usize));
        image.put_record(19, true, &[file_name_attr(5, "music", true)]);
        // two clusters at LCN 200
        image.put_record(
            20,
            false,
            &[
                file_name_attr(19, "song.mp3", false),
                nonresident_data(&[0x21, 0x02, 0xC8, 0x00], 2 * CLUSTER),
            ],
        );
        image.put_bytes(cluster_offset(200), &pattern(20, 2 * CLUSTER as usize));
        image.put_record(21, false, &[file_name_attr(5, "notes.txt", false), resident_data(b"remember")]);
        image.put_record(22, false, &[file_name_attr(19, "a.txt", false), resident_data(b"a")]);
        // same name as record 17 in the same directory
        image.put_record(
            23,
            false,
            &[file_name_attr(16, "report.txt", false), resident_data(b"second draft\n")],
        );
        image.put_record(24, false, &[file_name_attr(5, "empty.bin", false)]);
        image.put_record(
            30,
            false,
            &[file_name_attr(200, "orphan.dat", false), resident_data(b"lost and found")],
        );
        image
    }

    pub fn put_bytes(&mut self, offset: u64, bytes: &[u8]) {
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn put_sector(&mut self, sector: u64, bytes: &[u8]) {
        self.put_bytes(sector * SECTOR, bytes);
    }

    /// Write record `n` into its slot of the scenario table
    pub fn put_record(&mut self, n: u32, is_dir: bool, attrs: &[Vec<u8>]) {
        let record = file_record(n, is_dir, attrs);
        self.put_sector(record_sector(n as u64), &record);
    }

    /// Write record `n` as an extension record of `base`
    pub fn put_extension_record(&mut self, n: u32, base: u64, attrs: &[Vec<u8>]) {
        let mut record = file_record(n, false, attrs);
        record[32..40].copy_from_slice(&(base | (1u64 << 48)).to_le_bytes());
        self.put_sector(record_sector(n as u64), &record);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn into_image(self) -> MemoryImage {
        MemoryImage::new(self.data)
    }
}
