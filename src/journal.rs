//! Append-only JSONL journal.
//!
//! Entries are written to `segment_NNNN.jsonl` files, one JSON object per
//! line, with a sequence number that keeps increasing across reopen.
//! Segments rotate at [`SEGMENT_MAX_BYTES`]. [`Journal::compact`] rewrites
//! the live state into a fresh segment and drops everything older.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const SEGMENT_MAX_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub kind: String,
    pub payload: serde_json::Value,
}

struct ActiveSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
    id: u32,
}

pub struct Journal {
    dir: PathBuf,
    current_seq: AtomicU64,
    segment: Mutex<ActiveSegment>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn segment_name(id: u32) -> String {
    format!("segment_{:04}.jsonl", id)
}

fn segment_id(name: &str) -> Option<u32> {
    name.strip_prefix("segment_")
        .and_then(|s| s.strip_suffix(".jsonl"))
        .and_then(|s| s.parse().ok())
}

impl Journal {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let (max_seq, max_seg_id) = Self::scan_existing(dir)?;
        let next_seg_id = if max_seg_id > 0 { max_seg_id } else { 1 };
        let seg_path = dir.join(segment_name(next_seg_id));
        let seg_size = seg_path.metadata().map(|m| m.len()).unwrap_or(0);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&seg_path)?;

        // Terminate a torn trailing line so the next append starts clean
        let mut seg_size = seg_size;
        if seg_size > 0 && !fs::read(&seg_path)?.ends_with(b"\n") {
            file.write_all(b"\n")?;
            seg_size += 1;
        }

        Ok(Journal {
            dir: dir.to_path_buf(),
            current_seq: AtomicU64::new(max_seq),
            segment: Mutex::new(ActiveSegment {
                writer: BufWriter::new(file),
                path: seg_path,
                size: seg_size,
                id: next_seg_id,
            }),
        })
    }

    fn segments(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
        let mut segments: Vec<(u32, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let id = e.file_name().to_str().and_then(segment_id)?;
                Some((id, e.path()))
            })
            .collect();
        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }

    fn read_segment(path: &Path) -> Result<Vec<JournalEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // A torn final line after a crash is expected; skip it
                Err(e) => tracing::warn!("[JOURNAL] skipping corrupt line in {}: {}", path.display(), e),
            }
        }
        Ok(entries)
    }

    fn scan_existing(dir: &Path) -> Result<(u64, u32)> {
        let segments = Self::segments(dir)?;
        let max_seg_id = segments.last().map(|(id, _)| *id).unwrap_or(0);
        let mut max_seq = 0;
        for (_, path) in &segments {
            for entry in Self::read_segment(path)? {
                max_seq = max_seq.max(entry.seq);
            }
        }
        Ok((max_seq, max_seg_id))
    }

    fn lock_segment(&self) -> MutexGuard<'_, ActiveSegment> {
        self.segment.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_seq(&self) -> u64 {
        self.current_seq.load(Ordering::SeqCst)
    }

    pub fn append(&self, kind: &str, payload: serde_json::Value) -> Result<u64> {
        let mut seg = self.lock_segment();
        let seq = self.current_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = JournalEntry {
            seq,
            timestamp_ms: now_ms(),
            kind: kind.to_string(),
            payload,
        };
        let line = serde_json::to_string(&entry)?;

        seg.writer.write_all(line.as_bytes())?;
        seg.writer.write_all(b"\n")?;
        seg.writer.flush()?;
        seg.size += line.len() as u64 + 1;

        if seg.size >= SEGMENT_MAX_BYTES {
            self.rotate_segment_locked(&mut seg)?;
        }

        Ok(seq)
    }

    fn rotate_segment_locked(&self, seg: &mut ActiveSegment) -> Result<()> {
        seg.writer.flush()?;
        seg.id += 1;
        let new_path = self.dir.join(segment_name(seg.id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)?;
        seg.writer = BufWriter::new(file);
        seg.path = new_path;
        seg.size = 0;
        Ok(())
    }

    /// All entries with `seq > since_seq`, in sequence order.
    pub fn read_since(&self, since_seq: u64) -> Result<Vec<JournalEntry>> {
        {
            let mut seg = self.lock_segment();
            seg.writer.flush()?;
        }

        let mut results = Vec::new();
        for (_, path) in Self::segments(&self.dir)? {
            results.extend(
                Self::read_segment(&path)?
                    .into_iter()
                    .filter(|e| e.seq > since_seq),
            );
        }
        results.sort_by_key(|e| e.seq);
        Ok(results)
    }

    /// Replace the journal's history with `live` entries written into a new
    /// segment. Older segments are removed once the new one is flushed.
    /// Returns the number of segments removed.
    pub fn compact(&self, live: &[(String, serde_json::Value)]) -> Result<usize> {
        let mut seg = self.lock_segment();
        seg.writer.flush()?;
        self.rotate_segment_locked(&mut seg)?;

        let now = now_ms();
        for (kind, payload) in live {
            let seq = self.current_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let entry = JournalEntry {
                seq,
                timestamp_ms: now,
                kind: kind.clone(),
                payload: payload.clone(),
            };
            let line = serde_json::to_string(&entry)?;
            seg.writer.write_all(line.as_bytes())?;
            seg.writer.write_all(b"\n")?;
            seg.size += line.len() as u64 + 1;
        }
        seg.writer.flush()?;

        let current_id = seg.id;
        let mut removed = 0;
        for (id, path) in Self::segments(&self.dir)? {
            if id < current_id {
                fs::remove_file(&path).map_err(|e| {
                    SyncError::Io(format!("failed to remove {}: {}", path.display(), e))
                })?;
                removed += 1;
            }
        }
        tracing::debug!(
            "[JOURNAL] compacted to {} live entries, removed {} segments",
            live.len(),
            removed
        );
        Ok(removed)
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(Self::segments(&self.dir)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(tmp.path()).unwrap();

        assert_eq!(journal.current_seq(), 0);
        assert_eq!(journal.append("record", json!({"id": "f1"})).unwrap(), 1);
        assert_eq!(journal.append("remove", json!({"id": "f1"})).unwrap(), 2);

        let all = journal.read_since(0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, "record");
        assert_eq!(all[1].seq, 2);

        let since1 = journal.read_since(1).unwrap();
        assert_eq!(since1.len(), 1);
        assert_eq!(since1[0].kind, "remove");
    }

    #[test]
    fn test_reopen_continues_seq() {
        let tmp = TempDir::new().unwrap();
        {
            let journal = Journal::open(tmp.path()).unwrap();
            journal.append("record", json!({"x": 1})).unwrap();
            journal.append("record", json!({"x": 2})).unwrap();
        }

        let journal = Journal::open(tmp.path()).unwrap();
        assert_eq!(journal.current_seq(), 2);
        assert_eq!(journal.append("remove", json!({"x": 3})).unwrap(), 3);
        assert_eq!(journal.read_since(0).unwrap().len(), 3);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let tmp = TempDir::new().unwrap();
        {
            let journal = Journal::open(tmp.path()).unwrap();
            journal.append("record", json!({"x": 1})).unwrap();
        }
        let seg = tmp.path().join("segment_0001.jsonl");
        let mut content = std::fs::read_to_string(&seg).unwrap();
        content.push_str("{\"seq\":2,\"timest");
        std::fs::write(&seg, content).unwrap();

        let journal = Journal::open(tmp.path()).unwrap();
        assert_eq!(journal.current_seq(), 1);
        assert_eq!(journal.read_since(0).unwrap().len(), 1);

        journal.append("record", json!({"x": 2})).unwrap();
        let entries = journal.read_since(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].payload["x"], 2);
    }

    #[test]
    fn test_compact_keeps_only_live_entries() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(tmp.path()).unwrap();
        for i in 0..5 {
            journal.append("record", json!({"i": i})).unwrap();
            journal.append("remove", json!({"i": i})).unwrap();
        }
        journal.append("record", json!({"i": 99})).unwrap();

        let removed = journal
            .compact(&[("record".to_string(), json!({"i": 99}))])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(journal.segment_count().unwrap(), 1);

        let entries = journal.read_since(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["i"], 99);
        assert_eq!(entries[0].seq, 12);

        // Sequence survives compaction and reopen
        drop(journal);
        let journal = Journal::open(tmp.path()).unwrap();
        assert_eq!(journal.current_seq(), 12);
    }
}
