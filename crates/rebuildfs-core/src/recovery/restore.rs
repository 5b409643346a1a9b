//! Restore of reconstructed files and directories to a host directory.
//!
//! Content is assembled from the data runs of each record: resident bytes
//! are copied, sparse runs become zeros and extents are read from the image
//! relative to the partition start. Anything that cannot be read is reported
//! as a warning and the file is flagged partial; only failures writing the
//! output abort the restore.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::RebuildConfig;
use crate::error::{RebuildError, Result, Warning, WarningKind, WarningSink};
use crate::fs::common::{ByteRange, ImageSource};
use crate::recovery::directory::{DirectoryTree, NodeId, NodeKind};
use crate::{display_id, FileRecord, Partition, RunKind};

/// Appended to the content of a record that is both a directory and a file
pub const CONTENT_SUFFIX: &str = "_rebuildfs_content";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredFile {
    pub id: u64,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub files_written: usize,
    pub directories_created: usize,
    pub bytes_written: u64,
    pub partial_files: usize,
    /// Ignored records and ghosts without content
    pub skipped: usize,
    pub manifest: Vec<RestoredFile>,
    pub warnings: Vec<Warning>,
}

/// Restore the node `id` of `partition`, and everything below it, under
/// `output_dir`
pub fn restore(
    image: &dyn ImageSource,
    partition: &Partition,
    id: u64,
    output_dir: &Path,
    config: &RebuildConfig,
) -> Result<RestoreReport> {
    let tree = &partition.tree;
    let start = tree.get(id).ok_or(RebuildError::UnknownNode(id))?;

    tracing::info!(
        "💾 Restoring {} of partition #{} to {}",
        display_id(id),
        partition.index,
        output_dir.display()
    );

    let restorer = Restorer {
        image,
        partition,
        chunk: config.max_restore_chunk.max(4096) as usize,
        warnings: WarningSink::new(),
    };
    let mut report = RestoreReport::default();

    for node in tree.walk(start) {
        let path = node_path(tree, node, output_dir);
        let record = match tree.node(node).kind {
            NodeKind::Record(identity) => partition.get(identity),
            NodeKind::GhostRoot(_) | NodeKind::LostFiles => None,
        };

        let is_directory = record.map_or(true, |r| r.is_directory) || tree.children(node).next().is_some();
        if is_directory {
            fs::create_dir_all(&path)?;
            report.directories_created += 1;
        }

        let Some(record) = record else {
            continue;
        };
        if record.is_ignored() {
            tracing::debug!("Skipping {} ({})", record.name, record.id);
            report.skipped += 1;
            continue;
        }
        if record.data_runs.is_empty() && (is_directory || record.is_ghost) {
            if !is_directory {
                report.skipped += 1;
            }
            continue;
        }

        let target = if is_directory {
            let mut name = path.as_os_str().to_owned();
            name.push(CONTENT_SUFFIX);
            PathBuf::from(name)
        } else {
            path
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let restored = restorer.write_file(record, &target)?;
        report.files_written += 1;
        report.bytes_written += restored.size;
        if restored.partial {
            report.partial_files += 1;
        }
        report.manifest.push(restored);
    }

    report.warnings = restorer.warnings.drain();
    tracing::info!(
        "✅ Restored {} files ({} bytes) and {} directories, {} partial",
        report.files_written,
        report.bytes_written,
        report.directories_created,
        report.partial_files
    );
    Ok(report)
}

/// Host path of a node: the output directory followed by its tree path
fn node_path(tree: &DirectoryTree, node: NodeId, output_dir: &Path) -> PathBuf {
    let mut chain = tree.ancestors(node);
    chain.reverse();
    chain.push(node);

    let mut path = output_dir.to_path_buf();
    for part in chain {
        path.push(sanitize(&tree.node(part).name));
    }
    path
}

/// Make a record name safe as a single path component
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

struct Restorer<'a> {
    image: &'a dyn ImageSource,
    partition: &'a Partition,
    chunk: usize,
    warnings: WarningSink,
}

struct Output {
    writer: BufWriter<File>,
    hasher: Sha256,
    written: u64,
}

impl Output {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }
}

impl Restorer<'_> {
    fn write_file(&self, record: &FileRecord, target: &Path) -> Result<RestoredFile> {
        let mut out = Output {
            writer: BufWriter::new(File::create(target)?),
            hasher: Sha256::new(),
            written: 0,
        };
        let mut partial = false;

        if record.compressed {
            self.warnings.warn(
                WarningKind::Unsupported,
                format!("record #{} is compressed, content not restored", record.id),
            );
            partial = true;
        } else {
            let mut remaining = record.size;
            for run in &record.data_runs {
                if remaining == 0 {
                    break;
                }
                let take = run.length.min(remaining);
                match &run.kind {
                    RunKind::Resident(data) => {
                        let end = (take as usize).min(data.len());
                        out.write(&data[..end])?;
                    }
                    RunKind::Sparse => self.write_zeros(&mut out, take)?,
                    RunKind::Extent => partial |= self.copy_extent(&mut out, record.id, run.offset, take)?,
                    RunKind::Unmapped { lcn, clusters } => {
                        self.warnings.warn(
                            WarningKind::Unsupported,
                            format!(
                                "record #{}: run of {} clusters at {:?} cannot be placed without a cluster size",
                                record.id, clusters, lcn
                            ),
                        );
                        partial = true;
                    }
                }
                remaining -= take;
            }
            if remaining > 0 {
                tracing::debug!("Record #{} is {} bytes short of its size", record.id, remaining);
                partial = true;
            }
        }

        out.writer.flush()?;
        Ok(RestoredFile {
            id: record.id,
            path: target.to_path_buf(),
            size: out.written,
            sha256: format!("{:x}", out.hasher.finalize()),
            partial,
        })
    }

    fn write_zeros(&self, out: &mut Output, length: u64) -> Result<()> {
        let zeros = vec![0u8; (length as usize).min(self.chunk)];
        let mut left = length;
        while left > 0 {
            let n = (left as usize).min(zeros.len());
            out.write(&zeros[..n])?;
            left -= n as u64;
        }
        Ok(())
    }

    /// Copy the in-bounds part of an extent. Returns whether anything was
    /// lost.
    fn copy_extent(&self, out: &mut Output, id: u64, offset: u64, length: u64) -> Result<bool> {
        let Some(base) = self.partition.start_offset_bytes() else {
            self.warnings.warn(
                WarningKind::Unsupported,
                format!("record #{}: partition start unknown, extent not restored", id),
            );
            return Ok(true);
        };

        let image_len = self.image.len();
        let Some(start) = base.checked_add(offset) else {
            self.warnings.report(&RebuildError::OutOfBoundsExtent {
                id,
                offset,
                len: length,
                image_len,
            });
            return Ok(true);
        };
        let wanted = ByteRange::new(start, length);
        let mut lost = false;
        let Some(range) = wanted.clamp_to(image_len) else {
            self.warnings.report(&RebuildError::OutOfBoundsExtent {
                id,
                offset: wanted.start,
                len: length,
                image_len,
            });
            return Ok(true);
        };
        if range.len < length {
            self.warnings.report(&RebuildError::OutOfBoundsExtent {
                id,
                offset: wanted.start,
                len: length,
                image_len,
            });
            lost = true;
        }

        let mut position = range.start;
        while position < range.end() {
            let n = ((range.end() - position) as usize).min(self.chunk);
            match self.image.read_at(position, n) {
                Ok(data) => out.write(data)?,
                Err(err) => {
                    // Keep the file aligned, the gap reads as zeros
                    self.warnings.report(&err);
                    self.write_zeros(out, n as u64)?;
                    lost = true;
                }
            }
            position += n as u64;
        }
        Ok(lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::common::MemoryImage;
    use crate::fs::ntfs::record::damaged_record;
    use crate::recovery::engine::rebuild_partition;
    use crate::{DataRun, FsKind, RecordCondition, RecordSource, LOST_FILES_ID};
    use tempfile::TempDir;

    fn record(id: u64, name: &str, parent: u64, is_directory: bool) -> FileRecord {
        let mut record = damaged_record(id, RecordSource::Primary, None, "");
        record.condition = RecordCondition::Valid;
        record.name = name.to_string();
        record.parent = Some(parent);
        record.is_directory = is_directory;
        record
    }

    /// Image of 64 KiB whose byte at offset `i` is `i % 251`
    fn image() -> MemoryImage {
        MemoryImage::new((0..65536u32).map(|i| (i % 251) as u8).collect())
    }

    fn partition(records: Vec<FileRecord>) -> Partition {
        let mut partition = Partition::new(FsKind::Ntfs, 8);
        partition.start_sector = Some(8);
        partition.sectors_per_cluster = Some(1);
        partition.records = records.into_iter().map(|r| (r.id, r)).collect();
        rebuild_partition(&mut partition, &RebuildConfig::default(), &WarningSink::new());
        partition
    }

    #[test]
    fn test_restore_runs_in_order() {
        let mut file = record(16, "mixed.bin", 5, false);
        file.size = 1000;
        file.data_runs = vec![
            DataRun::extent(0, 512),
            DataRun::sparse(256),
            DataRun::extent(1024, 512),
        ];
        let partition = partition(vec![record(5, ".", 5, true), file]);

        let dir = TempDir::new().unwrap();
        let report = restore(&image(), &partition, 16, dir.path(), &RebuildConfig::default()).unwrap();

        let written = fs::read(dir.path().join("Root").join("mixed.bin")).unwrap();
        assert_eq!(written.len(), 1000);
        let img = image().into_inner();
        assert_eq!(&written[..512], &img[4096..4608]);
        assert!(written[512..768].iter().all(|&b| b == 0));
        assert_eq!(&written[768..], &img[5120..5120 + 232]);

        assert_eq!(report.files_written, 1);
        assert_eq!(report.partial_files, 0);
        assert_eq!(report.manifest[0].sha256, format!("{:x}", Sha256::digest(&written)));
    }

    #[test]
    fn test_out_of_bounds_extent_is_truncated() {
        let mut file = record(16, "tail.bin", 5, false);
        file.size = 8192;
        file.data_runs = vec![DataRun::extent(65536 - 4096 - 1000, 8192)];
        let partition = partition(vec![file]);

        let dir = TempDir::new().unwrap();
        let report = restore(&image(), &partition, 16, dir.path(), &RebuildConfig::default()).unwrap();

        assert_eq!(report.bytes_written, 1000);
        assert_eq!(report.partial_files, 1);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::OutOfBoundsExtent));
    }

    #[test]
    fn test_extent_offset_overflowing_image_space() {
        let mut file = record(16, "wild.bin", 5, false);
        file.size = 1024;
        file.data_runs = vec![DataRun::extent(u64::MAX, 8192), DataRun::extent(0, 512)];
        let partition = partition(vec![file]);

        let dir = TempDir::new().unwrap();
        let report = restore(&image(), &partition, 16, dir.path(), &RebuildConfig::default()).unwrap();

        assert_eq!(report.files_written, 1);
        assert_eq!(report.bytes_written, 0);
        assert_eq!(report.partial_files, 1);
        assert_eq!(
            report
                .warnings
                .iter()
                .filter(|w| w.kind == WarningKind::OutOfBoundsExtent)
                .count(),
            1
        );
    }

    #[test]
    fn test_restore_tree_and_lost_files() {
        let mut docs = record(20, "docs", 5, true);
        docs.size = 0;
        let mut note = record(21, "note.txt", 20, false);
        note.data_runs = vec![DataRun::resident(b"hello".to_vec())];
        note.size = 5;
        let mut orphan = record(30, "orphan.txt", 77, false);
        orphan.data_runs = vec![DataRun::resident(b"lost".to_vec())];
        orphan.size = 4;
        let mut ghost = record(31, "ghost.txt", 20, false);
        ghost.is_ghost = true;
        ghost.size = 100;
        let partition = partition(vec![docs, note, orphan, ghost]);

        let dir = TempDir::new().unwrap();
        let config = RebuildConfig::default();
        let report = restore(&image(), &partition, 5, dir.path(), &config).unwrap();
        assert_eq!(
            fs::read(dir.path().join("Root/docs/note.txt")).unwrap(),
            b"hello"
        );
        assert!(!dir.path().join("Root/docs/ghost.txt").exists());
        assert_eq!(report.directories_created, 2);
        assert_eq!(report.skipped, 1);

        restore(&image(), &partition, LOST_FILES_ID, dir.path(), &config).unwrap();
        assert_eq!(
            fs::read(dir.path().join("LostFiles/orphan.txt")).unwrap(),
            b"lost"
        );
    }

    #[test]
    fn test_directory_with_content_and_ignored_records() {
        let mut odd = record(40, "odd", 5, true);
        odd.data_runs = vec![DataRun::resident(b"data".to_vec())];
        odd.size = 4;
        let mut bad = record(8, "$BadClus", 5, false);
        bad.size = 1 << 40;
        bad.data_runs = vec![DataRun::sparse(1 << 40)];
        let partition = partition(vec![odd, bad]);

        let dir = TempDir::new().unwrap();
        let report = restore(&image(), &partition, 5, dir.path(), &RebuildConfig::default()).unwrap();

        assert!(dir.path().join("Root/odd").is_dir());
        assert_eq!(
            fs::read(dir.path().join(format!("Root/odd{}", CONTENT_SUFFIX))).unwrap(),
            b"data"
        );
        assert!(!dir.path().join("Root/$BadClus").exists());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_unknown_node() {
        let partition = partition(Vec::new());
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            restore(&image(), &partition, 1234, dir.path(), &RebuildConfig::default()),
            Err(RebuildError::UnknownNode(1234))
        ));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a/b"), "a_b");
        assert_eq!(sanitize(".."), "__");
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize("ok.txt"), "ok.txt");
    }
}
