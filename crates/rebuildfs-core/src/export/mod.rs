//! Structural exports of a reconstructed partition: CSV, TSK body file,
//! indented tree listing and partition listings, plus path lookups.

use chrono::{DateTime, Utc};
use std::io::{self, Write};

use crate::error::{RebuildError, Result};
use crate::recovery::directory::NodeId;
use crate::{display_id, FileRecord, Partition, RecoverabilityStatus, SECTOR_SIZE};

pub const CSV_HEADER: &str = "Id,Parent,Name,Full Path,Modification Time,Access Time,Creation Time,Size (bytes),Size (human),Offset (bytes),Offset (sectors),Directory,Deleted,Ghost";

/// Which partitions a listing shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFilter {
    Recoverable,
    Other,
    All,
}

impl PartitionFilter {
    fn accepts(&self, partition: &Partition) -> bool {
        let recoverable = partition.status == RecoverabilityStatus::Recoverable;
        match self {
            PartitionFilter::Recoverable => recoverable,
            PartitionFilter::Other => !recoverable,
            PartitionFilter::All => true,
        }
    }
}

/// Human readable size with binary units
pub fn readable_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

fn or_unknown<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "??".to_string(), |v| v.to_string())
}

/// One line of a partition listing
pub fn partition_line(partition: &Partition) -> String {
    format!(
        "Partition #{} -> Partition ({}, {}, {} files, {}, Offset: {}, Offset (b): {}, Sec/Clus: {}, MFT offset: {}, MFT mirror offset: {})",
        partition.index,
        partition.kind,
        or_unknown(partition.size_bytes().map(readable_bytes)),
        partition.file_count(),
        partition.status,
        or_unknown(partition.start_sector),
        or_unknown(partition.start_offset_bytes()),
        or_unknown(partition.sectors_per_cluster),
        partition.mft_sector,
        or_unknown(partition.mft_mirror_sector),
    )
}

pub fn partition_listing(partitions: &[Partition], filter: PartitionFilter) -> Vec<String> {
    partitions
        .iter()
        .filter(|p| filter.accepts(p))
        .map(partition_line)
        .collect()
}

fn csv_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn csv_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn unix_time(time: Option<DateTime<Utc>>) -> i64 {
    time.map_or(0, |t| t.timestamp())
}

/// Record nodes of the tree with the record behind them, in walk order
fn record_nodes(partition: &Partition) -> impl Iterator<Item = (NodeId, &FileRecord)> + '_ {
    let tree = &partition.tree;
    tree.walk_all().into_iter().filter_map(move |node| {
        let tree_node = tree.node(node);
        if tree_node.is_synthetic() {
            return None;
        }
        partition.get(tree_node.identity()).map(|record| (node, record))
    })
}

/// One CSV row per record node; the two synthetic roots are left out
pub fn write_csv<W: Write>(partition: &Partition, mut out: W) -> io::Result<()> {
    let tree = &partition.tree;
    writeln!(out, "{}", CSV_HEADER)?;
    for (node, record) in record_nodes(partition) {
        let parent = tree
            .parent(node)
            .map(|p| display_id(tree.identity(p)))
            .unwrap_or_default();
        let offset_sectors = record.offset_sector;
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            display_id(record.id),
            parent,
            csv_quote(&tree.node(node).name),
            csv_quote(&tree.full_path(node)),
            csv_time(record.timestamps.modification),
            csv_time(record.timestamps.access),
            csv_time(record.timestamps.creation),
            record.size,
            readable_bytes(record.size),
            offset_sectors.map(|s| (s * SECTOR_SIZE).to_string()).unwrap_or_default(),
            offset_sectors.map(|s| s.to_string()).unwrap_or_default(),
            record.is_directory,
            record.is_deleted,
            record.is_ghost,
        )?;
    }
    Ok(())
}

/// TSK 3.x body file: `MD5|name|inode|mode|UID|GID|size|atime|mtime|ctime|crtime`
pub fn write_bodyfile<W: Write>(partition: &Partition, mut out: W) -> io::Result<()> {
    let tree = &partition.tree;
    for (node, record) in record_nodes(partition) {
        let mut name = tree.full_path(node);
        let mode = if record.is_directory {
            name.push('/');
            "d/drwxrwxrwx"
        } else {
            "r/rrwxrwxrwx"
        };
        let times = &record.timestamps;
        writeln!(
            out,
            "0|{}|{}|{}|0|0|{}|{}|{}|{}|{}",
            name,
            record.id,
            mode,
            record.size,
            unix_time(times.access),
            unix_time(times.modification),
            unix_time(times.mft_modification),
            unix_time(times.creation),
        )?;
    }
    Ok(())
}

/// Indented listing of both top-level subtrees
pub fn tree_listing(partition: &Partition) -> String {
    let tree = &partition.tree;
    let mut listing = String::new();
    for node in tree.walk_all() {
        let depth = tree.ancestors(node).len();
        let tree_node = tree.node(node);
        let record = if tree_node.is_synthetic() {
            None
        } else {
            partition.get(tree_node.identity())
        };

        let mut line = format!(
            "{}{} (Id: {}",
            "  ".repeat(depth),
            tree_node.name,
            display_id(tree_node.identity())
        );
        if let Some(record) = record {
            line.push_str(&format!(
                ", Offset: {}, Size: {}",
                or_unknown(record.offset_sector),
                readable_bytes(record.size)
            ));
        }
        line.push(')');
        if record.is_some_and(|r| r.is_ghost) {
            line.push_str(" [GHOST]");
        }
        if record.is_some_and(|r| r.is_deleted) {
            line.push_str(" [DELETED]");
        }
        listing.push_str(&line);
        listing.push('\n');
    }
    listing
}

const TIKZ_BEGIN: &str = r"\begin{tikzpicture}[%
grow via three points={one child at (1.75em,-1.75em) and
two children at (1.75em,-1.75em) and (1.75em,-3.5em)},
edge from parent path={(\tikzparentnode.south) |- (\tikzchildnode.west)}]
\scriptsize";

/// LaTeX for a TikZ drawing of the directory tree, using the `trees` library
pub fn tikz_tree(partition: &Partition) -> String {
    let tree = &partition.tree;
    let mut lines = vec![r"\node [root] {File System Structure}".to_string()];
    for top in [tree.root(), tree.lost()] {
        tikz_subtree(partition, top, &mut lines);
    }
    lines.push(";".to_string());
    format!(
        "%\\usepackage{{tikz}}\n%\\usetikzlibrary{{trees}}\n\n{}\n{}\n\\end{{tikzpicture}}\n",
        TIKZ_BEGIN,
        lines.join("\n")
    )
}

/// Rows of `top` and everything below it. A child spanning several rows is
/// followed by as many `missing` children, which keeps the next sibling
/// below it.
fn tikz_subtree(partition: &Partition, top: NodeId, lines: &mut Vec<String>) {
    struct Frame {
        children: Vec<NodeId>,
        next: usize,
        rows: usize,
    }

    let tree = &partition.tree;
    lines.push(tikz_row(partition, top, 4));
    let mut stack = vec![Frame {
        children: tree.children(top).collect(),
        next: 0,
        rows: 0,
    }];
    while let Some(frame) = stack.last_mut() {
        if let Some(&child) = frame.children.get(frame.next) {
            frame.next += 1;
            lines.push(tikz_row(partition, child, 4 * (stack.len() + 1)));
            stack.push(Frame {
                children: tree.children(child).collect(),
                next: 0,
                rows: 0,
            });
            continue;
        }

        let rows = frame.rows;
        stack.pop();
        if let Some(last) = lines.last_mut() {
            last.push('}');
        }
        lines.extend(std::iter::repeat("child [missing] {}".to_string()).take(rows));
        if let Some(parent) = stack.last_mut() {
            parent.rows += 1 + rows;
        }
    }
}

fn tikz_row(partition: &Partition, node: NodeId, padding: usize) -> String {
    let tree_node = partition.tree.node(node);
    let record = if tree_node.is_synthetic() {
        None
    } else {
        partition.get(tree_node.identity())
    };
    let style = match record {
        Some(r) if r.is_ghost => "[ghost]",
        Some(r) if r.is_deleted => "[deleted]",
        _ => "",
    };
    format!(
        "{}child {{node {}{{{}\\enskip{{}}{}}}",
        " ".repeat(padding),
        style,
        latex_escape(&display_id(tree_node.identity())),
        latex_escape(&tree_node.name)
    )
}

fn latex_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '$' | '_' | '%' | '&' | '#' | '{' | '}' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\\' => escaped.push_str(r"\textbackslash{}"),
            _ => escaped.push(c),
        }
    }
    match escaped.strip_prefix('-') {
        Some(rest) => format!(r"\textminus{{}}{}", rest),
        None => escaped,
    }
}

/// Every node whose full path contains `text`, ignoring case
pub fn locate(partition: &Partition, text: &str) -> Vec<(u64, String)> {
    let tree = &partition.tree;
    let needle = text.to_lowercase();
    tree.walk_all()
        .into_iter()
        .map(|node| (tree.identity(node), tree.full_path(node)))
        .filter(|(_, path)| path.to_lowercase().contains(&needle))
        .collect()
}

/// The node `id` followed by its ancestors up to the top-level node
pub fn traceback(partition: &Partition, id: u64) -> Result<Vec<(u64, String)>> {
    let tree = &partition.tree;
    let node = tree.get(id).ok_or(RebuildError::UnknownNode(id))?;
    let mut chain = vec![node];
    chain.extend(tree.ancestors(node));
    Ok(chain
        .into_iter()
        .map(|n| (tree.identity(n), tree.full_path(n)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RebuildConfig;
    use crate::error::WarningSink;
    use crate::fs::ntfs::record::damaged_record;
    use crate::recovery::engine::rebuild_partition;
    use crate::{FsKind, RecordCondition, RecordSource, LOST_FILES_ID};
    use chrono::TimeZone;

    fn record(id: u64, name: &str, parent: u64, is_directory: bool) -> FileRecord {
        let mut record = damaged_record(id, RecordSource::Primary, Some(100 + id * 2), "");
        record.condition = RecordCondition::Valid;
        record.name = name.to_string();
        record.parent = Some(parent);
        record.is_directory = is_directory;
        record
    }

    fn sample() -> Partition {
        let mut partition = Partition::new(FsKind::Ntfs, 100);
        partition.start_sector = Some(0);
        partition.sectors_per_cluster = Some(8);
        partition.size_sectors = Some(2048);

        let mut quoted = record(17, "say \"hi\".txt", 16, false);
        quoted.size = 2048;
        quoted.timestamps.modification = Some(Utc.with_ymd_and_hms(2020, 5, 17, 12, 30, 0).unwrap());
        let mut ghost = record(18, "gone.txt", 16, false);
        ghost.is_ghost = true;
        ghost.is_deleted = true;

        for r in [
            record(5, ".", 5, true),
            record(16, "docs", 5, true),
            quoted,
            ghost,
            record(30, "orphan", 999, false),
        ] {
            partition.records.insert(r.id, r);
        }
        rebuild_partition(&mut partition, &RebuildConfig::default(), &WarningSink::new());
        partition
    }

    #[test]
    fn test_readable_bytes() {
        assert_eq!(readable_bytes(512), "512 B");
        assert_eq!(readable_bytes(1536), "1.50 KiB");
        assert_eq!(readable_bytes(1024 * 1024 * 1024), "1.00 GiB");
    }

    #[test]
    fn test_csv_rows_and_quoting() {
        let mut out = Vec::new();
        write_csv(&sample(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 1 + 5);
        assert!(text.contains("\"say \"\"hi\"\".txt\""));
        assert!(text.contains("\"Root/docs/say \"\"hi\"\".txt\""));
        assert!(text.contains("2020-05-17 12:30:00"));
        assert!(lines.iter().any(|l| l.starts_with("30,-1,\"orphan\",\"LostFiles/orphan\"")));
    }

    #[test]
    fn test_bodyfile() {
        let mut out = Vec::new();
        write_bodyfile(&sample(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("0|Root/docs/|16|d/drwxrwxrwx|0|0|0|0|0|0|0"));
        assert!(text.contains(&format!(
            "|17|r/rrwxrwxrwx|0|0|2048|0|{}|0|0",
            Utc.with_ymd_and_hms(2020, 5, 17, 12, 30, 0).unwrap().timestamp()
        )));
    }

    #[test]
    fn test_tikz_tree_rows() {
        let tikz = tikz_tree(&sample());
        assert!(tikz.starts_with("%\\usepackage{tikz}"));
        assert!(tikz.trim_end().ends_with("\\end{tikzpicture}"));

        let lines: Vec<&str> = tikz.lines().collect();
        let root = lines.iter().position(|l| l.contains("{5\\enskip{}Root}")).unwrap();
        assert_eq!(lines[root], "    child {node {5\\enskip{}Root}");
        assert_eq!(lines[root + 1], "        child {node {16\\enskip{}docs}");
        assert_eq!(lines[root + 2], "            child {node [ghost]{18\\enskip{}gone.txt}}");
        assert!(lines[root + 3].ends_with("say \"hi\".txt}}}"));
        // docs spans two rows, then root spans three
        assert_eq!(lines[root + 4], "child [missing] {}");
        assert_eq!(lines[root + 5], "child [missing] {}}");
        assert_eq!(lines[root + 6], "child [missing] {}");
        assert!(tikz.contains("child {node {\\textminus{}1\\enskip{}LostFiles}"));
        assert!(tikz.contains(";\n\\end{tikzpicture}"));
    }

    #[test]
    fn test_latex_escape() {
        assert_eq!(latex_escape("$MFT"), "\\$MFT");
        assert_eq!(latex_escape("a_b"), "a\\_b");
        assert_eq!(latex_escape("-1"), "\\textminus{}1");
    }

    #[test]
    fn test_tree_listing_tags() {
        let listing = tree_listing(&sample());
        assert!(listing.starts_with("Root (Id: 5"));
        assert!(listing.contains("    gone.txt (Id: 18, Offset: 136, Size: 0 B) [GHOST] [DELETED]"));
        assert!(listing.contains("LostFiles (Id: -1)"));
    }

    #[test]
    fn test_partition_line() {
        let line = partition_line(&sample());
        assert!(line.starts_with("Partition #0 -> Partition (NTFS, 1.00 MiB, 4 files, "));
        assert!(line.ends_with("Offset: 0, Offset (b): 0, Sec/Clus: 8, MFT offset: 100, MFT mirror offset: ??)"));
        assert_eq!(partition_listing(&[sample()], PartitionFilter::All).len(), 1);
    }

    #[test]
    fn test_locate_and_traceback() {
        let partition = sample();
        let found = locate(&partition, "DOCS");
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], (16, "Root/docs".to_string()));

        let chain = traceback(&partition, 17).unwrap();
        let ids: Vec<u64> = chain.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![17, 16, 5]);
        assert_eq!(traceback(&partition, 30).unwrap()[1].0, LOST_FILES_ID);
        assert!(traceback(&partition, 4242).is_err());
    }
}
