//! MFT `FILE` record decoding.
//!
//! A raw slot is copied, its update sequence array is verified and applied,
//! and the attribute list is walked. Only the attributes needed to rebuild the
//! tree are decoded: `$STANDARD_INFORMATION`, `$FILE_NAME`, the unnamed
//! `$DATA` stream and `$INDEX_ROOT`. Anything malformed turns the slot into a
//! damaged placeholder rather than an error.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, TimeZone, Utc};
use encoding_rs::UTF_16LE;

use super::index::{self, IndexEntry};
use crate::{DataRun, FileRecord, RecordCondition, RecordSource, Timestamps};

pub const FILE_SIGNATURE: &[u8; 4] = b"FILE";
pub const BAAD_SIGNATURE: &[u8; 4] = b"BAAD";
pub const INDX_SIGNATURE: &[u8; 4] = b"INDX";

/// Fixups protect the last two bytes of every 512-byte stride
const FIXUP_STRIDE: usize = 512;

pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_END: u32 = 0xFFFF_FFFF;

const RECORD_IN_USE: u16 = 0x0001;
const RECORD_IS_DIRECTORY: u16 = 0x0002;

const ATTR_FLAG_COMPRESSED: u16 = 0x0001;

/// Directory bit in `$FILE_NAME` flags
pub const FILE_NAME_DIRECTORY: u32 = 0x1000_0000;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

const REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// `$FILE_NAME` namespaces
pub const NAMESPACE_POSIX: u8 = 0;
pub const NAMESPACE_WIN32: u8 = 1;
pub const NAMESPACE_DOS: u8 = 2;
pub const NAMESPACE_WIN32_AND_DOS: u8 = 3;

fn u16_at(buf: &[u8], off: usize) -> Option<u16> {
    buf.get(off..off + 2).map(LittleEndian::read_u16)
}

fn u32_at(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off + 4).map(LittleEndian::read_u32)
}

fn u64_at(buf: &[u8], off: usize) -> Option<u64> {
    buf.get(off..off + 8).map(LittleEndian::read_u64)
}

/// Fixed part of a `FILE` record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence: u16,
    pub link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_record: u64,
    /// Only present from NTFS 3.1 on
    pub record_number: Option<u32>,
}

impl RecordHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < 42 {
            return Err("record shorter than its header".to_string());
        }
        let usa_offset = LittleEndian::read_u16(&buf[4..6]);
        let record_number = if usa_offset >= 48 {
            u32_at(buf, 44)
        } else {
            None
        };

        Ok(RecordHeader {
            usa_offset,
            usa_count: LittleEndian::read_u16(&buf[6..8]),
            lsn: LittleEndian::read_u64(&buf[8..16]),
            sequence: LittleEndian::read_u16(&buf[16..18]),
            link_count: LittleEndian::read_u16(&buf[18..20]),
            attrs_offset: LittleEndian::read_u16(&buf[20..22]),
            flags: LittleEndian::read_u16(&buf[22..24]),
            bytes_in_use: LittleEndian::read_u32(&buf[24..28]),
            bytes_allocated: LittleEndian::read_u32(&buf[28..32]),
            base_record: LittleEndian::read_u64(&buf[32..40]) & REFERENCE_MASK,
            record_number,
        })
    }

    pub fn in_use(&self) -> bool {
        self.flags & RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_IS_DIRECTORY != 0
    }
}

/// Record number stored in a raw `FILE` header, if the format carries one
pub fn peek_record_number(raw: &[u8]) -> Option<u64> {
    if raw.get(0..4)? != FILE_SIGNATURE {
        return None;
    }
    RecordHeader::parse(raw)
        .ok()?
        .record_number
        .map(u64::from)
}

/// Verify and apply the update sequence array of a multi-sector record
pub fn apply_fixups(buf: &mut [u8], usa_offset: usize, usa_count: usize) -> Result<(), String> {
    if usa_count == 0 {
        return Err("empty update sequence array".to_string());
    }
    let usa_end = usa_offset + 2 * usa_count;
    if usa_end > buf.len() {
        return Err("update sequence array outside record".to_string());
    }
    if (usa_count - 1) * FIXUP_STRIDE > buf.len() {
        return Err("update sequence array longer than record".to_string());
    }

    let usn = [buf[usa_offset], buf[usa_offset + 1]];
    for i in 1..usa_count {
        let end = i * FIXUP_STRIDE;
        if buf[end - 2..end] != usn {
            return Err(format!("fixup mismatch in stride {}", i));
        }
        let fix = usa_offset + 2 * i;
        buf[end - 2] = buf[fix];
        buf[end - 1] = buf[fix + 1];
    }
    Ok(())
}

/// Convert a Windows FILETIME (100ns ticks since 1601) to UTC
pub fn filetime_to_datetime(value: u64) -> Option<DateTime<Utc>> {
    if value == 0 {
        return None;
    }
    let secs = (value / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((value % 10_000_000) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Decode a UTF-16LE name, replacing unprintable characters with `#`
pub fn decode_name(bytes: &[u8]) -> String {
    let (decoded, _had_errors) = UTF_16LE.decode_without_bom_handling(bytes);
    decoded
        .chars()
        .map(|c| if c.is_control() { '#' } else { c })
        .collect()
}

/// One run of a non-resident runlist, in clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRun {
    pub clusters: u64,
    /// Absolute logical cluster number; `None` for a sparse run
    pub lcn: Option<u64>,
}

/// Decode a runlist (mapping pairs). Decoding stops at the terminator or at
/// the first malformed header.
pub fn decode_runlist(data: &[u8]) -> Vec<RawRun> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut lcn: i64 = 0;

    while let Some(&header) = data.get(pos) {
        if header == 0 {
            break;
        }
        let len_bytes = (header & 0x0F) as usize;
        let off_bytes = (header >> 4) as usize;
        pos += 1;

        if len_bytes == 0 || len_bytes > 8 || off_bytes > 8 {
            break;
        }
        if pos + len_bytes + off_bytes > data.len() {
            break;
        }

        let clusters = LittleEndian::read_uint(&data[pos..pos + len_bytes], len_bytes);
        pos += len_bytes;

        if off_bytes == 0 {
            runs.push(RawRun { clusters, lcn: None });
            continue;
        }

        let delta = LittleEndian::read_int(&data[pos..pos + off_bytes], off_bytes);
        pos += off_bytes;

        lcn = match lcn.checked_add(delta) {
            Some(value) if value >= 0 => value,
            _ => break,
        };
        runs.push(RawRun {
            clusters,
            lcn: Some(lcn as u64),
        });
    }

    runs
}

/// Decoded `$FILE_NAME` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameAttribute {
    pub parent: u64,
    pub parent_sequence: u16,
    pub timestamps: Timestamps,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub namespace: u8,
    pub name: String,
}

impl FileNameAttribute {
    pub fn parse(content: &[u8]) -> Option<Self> {
        if content.len() < 66 {
            return None;
        }
        let name_len = content[64] as usize;
        let name_bytes = content.get(66..66 + 2 * name_len)?;

        Some(FileNameAttribute {
            parent: u64_at(content, 0)? & REFERENCE_MASK,
            parent_sequence: u16_at(content, 6)?,
            timestamps: Timestamps {
                creation: filetime_to_datetime(u64_at(content, 8)?),
                modification: filetime_to_datetime(u64_at(content, 16)?),
                mft_modification: filetime_to_datetime(u64_at(content, 24)?),
                access: filetime_to_datetime(u64_at(content, 32)?),
            },
            allocated_size: u64_at(content, 40)?,
            real_size: u64_at(content, 48)?,
            flags: u32_at(content, 56)?,
            namespace: content[65],
            name: decode_name(name_bytes),
        })
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FILE_NAME_DIRECTORY != 0
    }

    /// Lower is better: long names first, then POSIX, then DOS short names
    fn namespace_rank(&self) -> u8 {
        match self.namespace {
            NAMESPACE_WIN32 | NAMESPACE_WIN32_AND_DOS => 0,
            NAMESPACE_POSIX => 1,
            _ => 2,
        }
    }
}

/// Unnamed `$DATA` stream content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataContent {
    Resident(Vec<u8>),
    NonResident {
        start_vcn: u64,
        real_size: u64,
        runs: Vec<RawRun>,
    },
}

/// Declared length of a stream made of `pieces`
pub fn stream_size(pieces: &[DataContent]) -> u64 {
    pieces
        .iter()
        .map(|content| match content {
            DataContent::Resident(bytes) => bytes.len() as u64,
            DataContent::NonResident {
                start_vcn: 0,
                real_size,
                ..
            } => *real_size,
            DataContent::NonResident { .. } => 0,
        })
        .max()
        .unwrap_or(0)
}

/// A stream as a list of runs, pieces taken in VCN order. With no cluster
/// size the extents cannot be placed and are kept as raw cluster numbers.
pub fn stream_runs(pieces: &[DataContent], cluster_size: Option<u64>) -> Vec<DataRun> {
    let mut ordered: Vec<&DataContent> = pieces.iter().collect();
    ordered.sort_by_key(|content| match content {
        DataContent::Resident(_) => 0,
        DataContent::NonResident { start_vcn, .. } => *start_vcn,
    });

    let mut runs = Vec::new();
    for piece in ordered {
        match piece {
            DataContent::Resident(bytes) => runs.push(DataRun::resident(bytes.clone())),
            DataContent::NonResident { runs: raw, .. } => {
                for run in raw {
                    let unmapped = DataRun::unmapped(run.lcn, run.clusters);
                    runs.push(match cluster_size {
                        Some(cs) => unmapped.placed(cs),
                        None => unmapped,
                    });
                }
            }
        }
    }
    runs
}

/// Preferred name among the hard links of a record
pub fn best_file_name(names: &[FileNameAttribute]) -> Option<&FileNameAttribute> {
    names.iter().min_by_key(|fname| fname.namespace_rank())
}

/// One entry of an `$ATTRIBUTE_LIST`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub start_vcn: u64,
    /// Record holding the attribute
    pub file_ref: u64,
}

/// `$ATTRIBUTE_LIST` of a record, either inline or in clusters elsewhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeList {
    Resident(Vec<AttributeListEntry>),
    NonResident { real_size: u64, runs: Vec<RawRun> },
}

/// Decode the entries of an attribute list
pub fn parse_attribute_list(content: &[u8]) -> Vec<AttributeListEntry> {
    let mut entries = Vec::new();
    let mut off = 0usize;
    while let (Some(type_code), Some(length)) = (u32_at(content, off), u16_at(content, off + 4)) {
        if type_code == ATTR_END || length < 26 {
            break;
        }
        let (Some(start_vcn), Some(file_ref)) = (u64_at(content, off + 8), u64_at(content, off + 16))
        else {
            break;
        };
        entries.push(AttributeListEntry {
            type_code,
            start_vcn,
            file_ref: file_ref & REFERENCE_MASK,
        });
        off += length as usize;
    }
    entries
}

/// Attribute-level view of a decoded record
#[derive(Debug, Clone, Default)]
pub struct ParsedRecord {
    pub header: Option<RecordHeader>,
    pub standard_times: Option<Timestamps>,
    pub file_names: Vec<FileNameAttribute>,
    pub data: Vec<DataContent>,
    pub compressed: bool,
    pub index_entries: Vec<IndexEntry>,
    pub attribute_list: Option<AttributeList>,
    /// Runs of `$INDEX_ALLOCATION`, in clusters
    pub index_allocation: Vec<RawRun>,
}

impl ParsedRecord {
    pub fn best_name(&self) -> Option<&FileNameAttribute> {
        best_file_name(&self.file_names)
    }

    /// Declared length of the unnamed stream
    pub fn data_size(&self) -> u64 {
        stream_size(&self.data)
    }

    pub fn data_runs(&self, cluster_size: Option<u64>) -> Vec<DataRun> {
        stream_runs(&self.data, cluster_size)
    }

    /// Base record this one extends, if it is an extension record
    pub fn base_record(&self) -> Option<u64> {
        self.header
            .as_ref()
            .map(|h| h.base_record)
            .filter(|&base| base != 0)
    }

    /// First cluster of every allocated index run
    pub fn index_clusters(&self) -> Vec<u64> {
        self.index_allocation.iter().filter_map(|run| run.lcn).collect()
    }

    /// Build the tree-facing record
    pub fn to_file_record(
        &self,
        id: u64,
        source: RecordSource,
        offset_sector: Option<u64>,
        cluster_size: Option<u64>,
    ) -> FileRecord {
        let best = self.best_name();
        let flags = self.header.as_ref().map(|h| h.flags).unwrap_or(0);

        let mut timestamps = self.standard_times.clone().unwrap_or_default();
        if let Some(fname) = best {
            timestamps.fill_from(&fname.timestamps);
        }

        FileRecord {
            id,
            name: best.map(|f| f.name.clone()).unwrap_or_default(),
            parent: best.map(|f| f.parent),
            is_directory: flags & RECORD_IS_DIRECTORY != 0,
            is_deleted: flags & RECORD_IN_USE == 0,
            is_ghost: false,
            compressed: self.compressed,
            timestamps,
            size: self.data_size(),
            data_runs: self.data_runs(cluster_size),
            source,
            offset_sector,
            condition: RecordCondition::Valid,
            index_clusters: self.index_clusters(),
        }
    }
}

/// Decode a raw `FILE` slot. Any structural problem is returned as the reason
/// the slot is damaged.
pub fn parse_file_record(raw: &[u8]) -> Result<ParsedRecord, String> {
    match raw.get(0..4) {
        Some(sig) if sig == FILE_SIGNATURE => {}
        Some(sig) if sig == BAAD_SIGNATURE => return Err("record marked BAAD".to_string()),
        _ => return Err("invalid FILE signature".to_string()),
    }

    let header = RecordHeader::parse(raw)?;
    let mut buf = raw.to_vec();
    apply_fixups(&mut buf, header.usa_offset as usize, header.usa_count as usize)?;

    if header.bytes_allocated as usize > buf.len() {
        return Err(format!(
            "allocated size {} exceeds slot size {}",
            header.bytes_allocated,
            buf.len()
        ));
    }
    if header.bytes_in_use > header.bytes_allocated {
        return Err("used size exceeds allocated size".to_string());
    }
    let limit = header.bytes_in_use as usize;
    let mut off = header.attrs_offset as usize;
    if off < 24 || off >= limit {
        return Err("first attribute outside record".to_string());
    }

    let mut parsed = ParsedRecord::default();

    while off + 8 <= limit {
        let type_code = LittleEndian::read_u32(&buf[off..off + 4]);
        if type_code == ATTR_END {
            break;
        }
        let length = LittleEndian::read_u32(&buf[off + 4..off + 8]) as usize;
        if length < 16 || off + length > limit {
            break;
        }
        decode_attribute(&buf[off..off + length], type_code, &mut parsed);
        off += length;
    }

    parsed.header = Some(header);
    Ok(parsed)
}

fn decode_attribute(attr: &[u8], type_code: u32, parsed: &mut ParsedRecord) {
    let non_resident = attr[8] != 0;
    let name_len = attr[9] as usize;
    let flags = LittleEndian::read_u16(&attr[12..14]);
    let named = name_len > 0;

    if non_resident {
        match type_code {
            ATTR_DATA if !named => {
                let (Some(start_vcn), Some(runlist_off), Some(real_size)) =
                    (u64_at(attr, 16), u16_at(attr, 32), u64_at(attr, 48))
                else {
                    return;
                };
                let runs = attr
                    .get(runlist_off as usize..)
                    .map(decode_runlist)
                    .unwrap_or_default();
                parsed.compressed |= flags & ATTR_FLAG_COMPRESSED != 0;
                parsed.data.push(DataContent::NonResident {
                    start_vcn,
                    real_size,
                    runs,
                });
            }
            ATTR_ATTRIBUTE_LIST => {
                let (Some(runlist_off), Some(real_size)) = (u16_at(attr, 32), u64_at(attr, 48)) else {
                    return;
                };
                let runs = attr
                    .get(runlist_off as usize..)
                    .map(decode_runlist)
                    .unwrap_or_default();
                parsed.attribute_list = Some(AttributeList::NonResident { real_size, runs });
            }
            ATTR_INDEX_ALLOCATION => {
                if let Some(runlist) = u16_at(attr, 32).and_then(|off| attr.get(off as usize..)) {
                    parsed.index_allocation.extend(decode_runlist(runlist));
                }
            }
            _ => {}
        }
        return;
    }

    let (Some(size), Some(content_off)) = (u32_at(attr, 16), u16_at(attr, 20)) else {
        return;
    };
    let start = content_off as usize;
    let Some(content) = attr.get(start..start + size as usize) else {
        return;
    };

    match type_code {
        ATTR_STANDARD_INFORMATION if content.len() >= 32 => {
            parsed.standard_times = Some(Timestamps {
                creation: filetime_to_datetime(LittleEndian::read_u64(&content[0..8])),
                modification: filetime_to_datetime(LittleEndian::read_u64(&content[8..16])),
                mft_modification: filetime_to_datetime(LittleEndian::read_u64(&content[16..24])),
                access: filetime_to_datetime(LittleEndian::read_u64(&content[24..32])),
            });
        }
        ATTR_FILE_NAME => {
            if let Some(fname) = FileNameAttribute::parse(content) {
                parsed.file_names.push(fname);
            }
        }
        ATTR_DATA if !named => {
            parsed.compressed |= flags & ATTR_FLAG_COMPRESSED != 0;
            parsed.data.push(DataContent::Resident(content.to_vec()));
        }
        ATTR_INDEX_ROOT => {
            parsed.index_entries.extend(index::parse_index_root(content));
        }
        ATTR_ATTRIBUTE_LIST => {
            parsed.attribute_list = Some(AttributeList::Resident(parse_attribute_list(content)));
        }
        _ => {}
    }
}

/// Placeholder for a slot that could not be decoded
pub fn damaged_record(
    id: u64,
    source: RecordSource,
    offset_sector: Option<u64>,
    reason: impl Into<String>,
) -> FileRecord {
    FileRecord {
        id,
        name: String::new(),
        parent: None,
        is_directory: false,
        is_deleted: false,
        is_ghost: false,
        compressed: false,
        timestamps: Timestamps::default(),
        size: 0,
        data_runs: Vec::new(),
        source,
        offset_sector,
        condition: RecordCondition::Damaged {
            reason: reason.into(),
        },
        index_clusters: Vec::new(),
    }
}


#[cfg(test)]
mod tests {
    use super::builder::*;
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_runlist_negative_offset_and_sparse() {
        // 0x10 clusters at LCN 0x100, 8 sparse clusters, 4 clusters at 0x100 - 0x20
        let data = [
            0x21, 0x10, 0x00, 0x01, //
            0x01, 0x08, //
            0x11, 0x04, 0xE0, //
            0x00,
        ];
        let runs = decode_runlist(&data);
        assert_eq!(
            runs,
            vec![
                RawRun { clusters: 0x10, lcn: Some(0x100) },
                RawRun { clusters: 8, lcn: None },
                RawRun { clusters: 4, lcn: Some(0xE0) },
            ]
        );
    }

    #[test]
    fn test_runlist_stops_on_truncation() {
        let data = [0x21, 0x10, 0x00, 0x01, 0x33, 0x01];
        assert_eq!(decode_runlist(&data).len(), 1);
    }

    #[test]
    fn test_filetime_conversion() {
        let ft: u64 = (1_577_836_800 + 11_644_473_600) * 10_000_000;
        let dt = filetime_to_datetime(ft).unwrap();
        assert_eq!(dt.timestamp(), 1_577_836_800);
        assert_eq!(dt.year(), 2020);
        assert!(filetime_to_datetime(0).is_none());
    }

    #[test]
    fn test_decode_name_replaces_control_chars() {
        let bytes: Vec<u8> = "a\u{1}b".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(decode_name(&bytes), "a#b");
    }

    #[test]
    fn test_parse_valid_record() {
        let raw = file_record(
            42,
            0x0001,
            &[
                file_name_attr(5, "REPORT~1.TXT", NAMESPACE_DOS, false),
                file_name_attr(5, "report.txt", NAMESPACE_WIN32, false),
                resident_attr(ATTR_DATA, b"hello"),
            ],
        );
        let parsed = parse_file_record(&raw).unwrap();
        assert_eq!(parsed.header.as_ref().unwrap().record_number, Some(42));
        assert_eq!(peek_record_number(&raw), Some(42));

        let record = parsed.to_file_record(42, RecordSource::Primary, Some(100), Some(4096));
        assert_eq!(record.name, "report.txt");
        assert_eq!(record.parent, Some(5));
        assert_eq!(record.size, 5);
        assert!(!record.is_deleted);
        assert!(!record.is_directory);
        assert_eq!(record.data_runs, vec![DataRun::resident(b"hello".to_vec())]);
        assert!(record.timestamps.modification.is_some());
    }

    #[test]
    fn test_nonresident_runs_use_cluster_size() {
        let raw = file_record(
            43,
            0x0000,
            &[
                file_name_attr(5, "big.bin", NAMESPACE_WIN32, false),
                nonresident_data(&[0x11, 0x02, 0x10, 0x01, 0x01, 0x00], 10000),
            ],
        );
        let parsed = parse_file_record(&raw).unwrap();
        let record = parsed.to_file_record(43, RecordSource::Primary, None, Some(4096));
        assert!(record.is_deleted);
        assert_eq!(record.size, 10000);
        assert_eq!(
            record.data_runs,
            vec![DataRun::extent(16 * 4096, 2 * 4096), DataRun::sparse(4096)]
        );

        let unplaced = parsed.to_file_record(43, RecordSource::Primary, None, None);
        assert_eq!(unplaced.data_runs[0], DataRun::unmapped(Some(16), 2));
    }

    #[test]
    fn test_named_stream_is_not_content() {
        // $UsnJrnl keeps its journal in the named `$J` stream
        let mut journal = nonresident_data(&[0x11, 0x02, 0x10, 0x00], 8192);
        let name_offset = journal.len();
        journal.extend("$J".encode_utf16().flat_map(u16::to_le_bytes));
        journal.resize(name_offset + 8, 0);
        let len = journal.len() as u32;
        journal[4..8].copy_from_slice(&len.to_le_bytes());
        journal[9] = 2;
        journal[10..12].copy_from_slice(&(name_offset as u16).to_le_bytes());

        let raw = file_record(
            38,
            0x0001,
            &[file_name_attr(11, "$UsnJrnl", NAMESPACE_WIN32, false), journal],
        );
        let record = parse_file_record(&raw)
            .unwrap()
            .to_file_record(38, RecordSource::Primary, None, Some(4096));
        assert_eq!(record.size, 0);
        assert!(record.data_runs.is_empty());
    }

    #[test]
    fn test_attribute_list_and_index_allocation() {
        let raw = file_record(
            60,
            0x0003,
            &[
                attribute_list_attr(&[(ATTR_FILE_NAME, 0, 60), (ATTR_DATA, 0, 61), (ATTR_DATA, 4, 62)]),
                file_name_attr(5, "big", NAMESPACE_WIN32, true),
                nonresident_attr(ATTR_INDEX_ALLOCATION, &[0x21, 0x01, 0x2C, 0x01, 0x00], 0, 4096),
            ],
        );
        let parsed = parse_file_record(&raw).unwrap();
        assert_eq!(parsed.base_record(), None);
        let Some(AttributeList::Resident(entries)) = &parsed.attribute_list else {
            panic!("expected a resident attribute list");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[2],
            AttributeListEntry {
                type_code: ATTR_DATA,
                start_vcn: 4,
                file_ref: 62
            }
        );

        let record = parsed.to_file_record(60, RecordSource::Primary, None, None);
        assert_eq!(record.index_clusters, vec![300]);
        assert!(record.data_runs.is_empty());
    }

    #[test]
    fn test_extension_pieces_join_in_vcn_order() {
        let tail = extension_record(62, 60, &[nonresident_attr(ATTR_DATA, &[0x11, 0x02, 0x40, 0x00], 4, 0)]);
        let head = extension_record(61, 60, &[nonresident_attr(ATTR_DATA, &[0x11, 0x04, 0x20, 0x00], 0, 6 * 4096)]);
        let tail = parse_file_record(&tail).unwrap();
        let head = parse_file_record(&head).unwrap();
        assert_eq!(head.base_record(), Some(60));

        let pieces: Vec<DataContent> = tail.data.into_iter().chain(head.data).collect();
        assert_eq!(stream_size(&pieces), 6 * 4096);
        assert_eq!(
            stream_runs(&pieces, Some(4096)),
            vec![
                DataRun::extent(0x20 * 4096, 4 * 4096),
                DataRun::extent(0x40 * 4096, 2 * 4096),
            ]
        );
    }

    #[test]
    fn test_attribute_list_stops_at_short_entry() {
        let mut content = vec![0u8; 40];
        content[0..4].copy_from_slice(&ATTR_DATA.to_le_bytes());
        content[4..6].copy_from_slice(&32u16.to_le_bytes());
        content[16..24].copy_from_slice(&70u64.to_le_bytes());
        // second entry claims a length of zero
        content[32..36].copy_from_slice(&ATTR_DATA.to_le_bytes());
        assert_eq!(parse_attribute_list(&content).len(), 1);
        assert!(parse_attribute_list(&[]).is_empty());
    }

    #[test]
    fn test_fixup_mismatch_is_damage() {
        let mut raw = file_record(7, 0x0001, &[file_name_attr(5, "x", NAMESPACE_WIN32, false)]);
        raw[1022] ^= 0xFF;
        let err = parse_file_record(&raw).unwrap_err();
        assert!(err.contains("fixup mismatch"));
    }

    #[test]
    fn test_fixups_restore_protected_bytes() {
        let mut attrs = vec![0u8; 600];
        attrs[0..4].copy_from_slice(&0x100u32.to_le_bytes());
        attrs[4..8].copy_from_slice(&600u32.to_le_bytes());
        attrs[510 - 56] = 0xAB;
        let raw = file_record(9, 0x0001, &[attrs]);
        assert_eq!(&raw[510..512], &USN);
        let mut buf = raw.clone();
        apply_fixups(&mut buf, 48, 3).unwrap();
        assert_eq!(buf[454 + 56], 0xAB);
        assert_ne!(&buf[510..512], &USN);
    }

    #[test]
    fn test_baad_and_garbage_slots() {
        let mut raw = file_record(3, 0x0001, &[]);
        raw[0..4].copy_from_slice(BAAD_SIGNATURE);
        assert_eq!(parse_file_record(&raw).unwrap_err(), "record marked BAAD");
        assert!(parse_file_record(&[0x41u8; 1024]).is_err());
    }

    #[test]
    fn test_inconsistent_header_sizes() {
        let mut raw = file_record(3, 0x0001, &[]);
        raw[28..32].copy_from_slice(&4096u32.to_le_bytes());
        assert!(parse_file_record(&raw).unwrap_err().contains("allocated size"));

        let mut raw = file_record(3, 0x0001, &[]);
        raw[20..22].copy_from_slice(&1000u16.to_le_bytes());
        assert!(parse_file_record(&raw).is_err());
    }
}
