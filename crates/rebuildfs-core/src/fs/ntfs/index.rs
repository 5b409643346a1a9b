//! Directory index entries (`$INDEX_ROOT` and `INDX` blocks).
//!
//! Index entries embed a full `$FILE_NAME` of the child, so a directory's
//! index can vouch for files whose own MFT record has been lost. Those files
//! become ghost records.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

use super::record::{apply_fixups, FileNameAttribute, INDX_SIGNATURE, NAMESPACE_WIN32_AND_DOS};
use crate::{FileRecord, RecordCondition, RecordSource};

const ENTRY_LAST: u16 = 0x0002;
const REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Offset of the node header inside an `INDX` block
const INDX_NODE_HEADER: usize = 24;

/// Offset of the node header inside `$INDEX_ROOT` content
const ROOT_NODE_HEADER: usize = 16;

/// A child reference taken from a directory index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub record: u64,
    pub file_name: FileNameAttribute,
}

impl IndexEntry {
    /// Record known only through this entry
    pub fn to_ghost(&self, offset_sector: Option<u64>) -> FileRecord {
        let fname = &self.file_name;
        FileRecord {
            id: self.record,
            name: fname.name.clone(),
            parent: Some(fname.parent),
            is_directory: fname.is_directory(),
            is_deleted: false,
            is_ghost: true,
            compressed: false,
            timestamps: fname.timestamps.clone(),
            size: fname.real_size,
            data_runs: Vec::new(),
            source: RecordSource::Index,
            offset_sector,
            condition: RecordCondition::Valid,
            index_clusters: Vec::new(),
        }
    }
}

/// Walk the entries of an index node whose header starts at `node`
fn parse_node(buf: &[u8], node: usize) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    let (Some(first), Some(used)) = (
        buf.get(node..node + 4).map(LittleEndian::read_u32),
        buf.get(node + 4..node + 8).map(LittleEndian::read_u32),
    ) else {
        return entries;
    };

    let end = (node + used as usize).min(buf.len());
    let mut off = node + first as usize;

    while off + 16 <= end {
        let file_ref = LittleEndian::read_u64(&buf[off..off + 8]);
        let entry_len = LittleEndian::read_u16(&buf[off + 8..off + 10]) as usize;
        let content_len = LittleEndian::read_u16(&buf[off + 10..off + 12]) as usize;
        let flags = LittleEndian::read_u16(&buf[off + 12..off + 14]);

        if flags & ENTRY_LAST != 0 || entry_len < 16 {
            break;
        }

        if let Some(content) = buf.get(off + 16..off + 16 + content_len) {
            if let Some(file_name) = FileNameAttribute::parse(content) {
                if !file_name.name.is_empty() && file_name.namespace <= NAMESPACE_WIN32_AND_DOS {
                    entries.push(IndexEntry {
                        record: file_ref & REFERENCE_MASK,
                        file_name,
                    });
                }
            }
        }

        off += entry_len;
    }

    entries
}

/// Entries of a resident `$INDEX_ROOT` attribute
pub fn parse_index_root(content: &[u8]) -> Vec<IndexEntry> {
    parse_node(content, ROOT_NODE_HEADER)
}

/// Entries of an `INDX` block, after fixups
pub fn parse_indx_record(raw: &[u8]) -> Result<Vec<IndexEntry>, String> {
    if raw.len() < INDX_NODE_HEADER + 16 || &raw[0..4] != INDX_SIGNATURE {
        return Err("invalid INDX signature".to_string());
    }
    let usa_offset = LittleEndian::read_u16(&raw[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&raw[6..8]) as usize;

    let mut buf = raw.to_vec();
    apply_fixups(&mut buf, usa_offset, usa_count)?;
    Ok(parse_node(&buf, INDX_NODE_HEADER))
}

/// Most frequent parent among the entries; ties go to the lowest identity
pub fn dominant_parent(entries: &[IndexEntry]) -> Option<u64> {
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.file_name.parent).or_default() += 1;
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(u64, usize)>, (parent, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((parent, count)),
        })
        .map(|(parent, _)| parent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::ntfs::record::NAMESPACE_WIN32;

    pub(crate) fn entry_bytes(record: u64, parent: u64, name: &str) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let content_len = 66 + units.len() * 2;
        let entry_len = (16 + content_len + 7) & !7;
        let mut entry = vec![0u8; entry_len];
        entry[0..8].copy_from_slice(&record.to_le_bytes());
        entry[8..10].copy_from_slice(&(entry_len as u16).to_le_bytes());
        entry[10..12].copy_from_slice(&(content_len as u16).to_le_bytes());
        let c = 16;
        entry[c..c + 8].copy_from_slice(&parent.to_le_bytes());
        entry[c + 48..c + 56].copy_from_slice(&123u64.to_le_bytes());
        entry[c + 64] = units.len() as u8;
        entry[c + 65] = NAMESPACE_WIN32;
        for (i, unit) in units.iter().enumerate() {
            entry[c + 66 + i * 2..c + 68 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        entry
    }

    fn last_entry() -> Vec<u8> {
        let mut entry = vec![0u8; 16];
        entry[8..10].copy_from_slice(&16u16.to_le_bytes());
        entry[12..14].copy_from_slice(&ENTRY_LAST.to_le_bytes());
        entry
    }

    pub(crate) fn index_root(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut content = vec![0u8; 32];
        content[0..4].copy_from_slice(&0x30u32.to_le_bytes());
        for entry in entries.iter().chain(std::iter::once(&last_entry())) {
            content.extend_from_slice(entry);
        }
        let used = (content.len() - 16) as u32;
        content[16..20].copy_from_slice(&16u32.to_le_bytes());
        content[20..24].copy_from_slice(&used.to_le_bytes());
        content[24..28].copy_from_slice(&used.to_le_bytes());
        content
    }

    #[test]
    fn test_index_root_entries() {
        let content = index_root(&[entry_bytes(40, 5, "a.txt"), entry_bytes(41, 5, "b.txt")]);
        let entries = parse_index_root(&content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].record, 40);
        assert_eq!(entries[1].file_name.name, "b.txt");

        let ghost = entries[0].to_ghost(None);
        assert!(ghost.is_ghost);
        assert_eq!(ghost.parent, Some(5));
        assert_eq!(ghost.size, 123);
        assert_eq!(ghost.source, RecordSource::Index);
    }

    #[test]
    fn test_indx_block() {
        let mut block = vec![0u8; 4096];
        block[0..4].copy_from_slice(INDX_SIGNATURE);
        block[4..6].copy_from_slice(&40u16.to_le_bytes());
        block[6..8].copy_from_slice(&9u16.to_le_bytes());

        let mut entries = Vec::new();
        for (i, name) in ["x", "y", "z"].iter().enumerate() {
            entries.extend(entry_bytes(60 + i as u64, if i == 2 { 9 } else { 70 }, name));
        }
        entries.extend(last_entry());
        let first = 64usize;
        block[INDX_NODE_HEADER..INDX_NODE_HEADER + 4]
            .copy_from_slice(&((first - INDX_NODE_HEADER) as u32).to_le_bytes());
        let used = (first - INDX_NODE_HEADER + entries.len()) as u32;
        block[INDX_NODE_HEADER + 4..INDX_NODE_HEADER + 8].copy_from_slice(&used.to_le_bytes());
        block[first..first + entries.len()].copy_from_slice(&entries);

        // update sequence
        block[40..42].copy_from_slice(&[0x11, 0x22]);
        for i in 1..9usize {
            let end = i * 512;
            block[40 + 2 * i] = block[end - 2];
            block[41 + 2 * i] = block[end - 1];
            block[end - 2..end].copy_from_slice(&[0x11, 0x22]);
        }

        let parsed = parse_indx_record(&block).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(dominant_parent(&parsed), Some(70));
    }

    #[test]
    fn test_dominant_parent_tie() {
        let entries = parse_index_root(&index_root(&[
            entry_bytes(40, 12, "a"),
            entry_bytes(41, 11, "b"),
        ]));
        assert_eq!(dominant_parent(&entries), Some(11));
        assert_eq!(dominant_parent(&[]), None);
    }
}
