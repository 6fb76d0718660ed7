//! Durable queue of sync operations.
//!
//! In outbox mode watchers append operations here instead of calling the
//! remote service, which takes the remote round trip out of the content write
//! path. `drain` replays the queue later. The file is JSON lines, one
//! [`OutboxEntry`] per line. Readers and writers serialize on an fs2 lock held
//! on a sidecar `.lock` file, so the queue itself can be replaced by rename.
//! Operations the service refuses outright are moved to a `.rejected` file
//! next to the queue.

use crate::error::{Result, SyncError};
use crate::index::{dedupe_operations, BatchReport, SyncOperation};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub index_id: String,
    pub operation: SyncOperation,
    /// Unix time in milliseconds
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// Entries read from the outbox
    pub entries: usize,
    /// Operations sent after deduplication
    pub delivered: usize,
    pub failed: usize,
    /// Entries dropped because their index no longer exists
    pub discarded: usize,
    /// Operations refused by the service, moved to the rejected file
    pub rejected: usize,
    /// Entries left in the outbox for the next drain
    pub remaining: usize,
    pub remote_calls: usize,
}

pub struct Outbox {
    path: PathBuf,
}

impl Outbox {
    /// Open (creating if needed) the outbox file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| outbox_error(&path, "create directory", e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| outbox_error(&path, "open", e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where refused operations end up
    pub fn rejected_path(&self) -> PathBuf {
        sibling(&self.path, "rejected")
    }

    /// Append operations for one index. Returns the number of entries written.
    pub fn enqueue(&self, index_id: &str, operations: Vec<SyncOperation>) -> Result<usize> {
        if operations.is_empty() {
            return Ok(0);
        }
        let _lock = self.lock(true)?;

        let enqueued_at = chrono::Utc::now().timestamp_millis();
        let entries: Vec<OutboxEntry> = operations
            .into_iter()
            .map(|operation| OutboxEntry {
                index_id: index_id.to_string(),
                operation,
                enqueued_at,
            })
            .collect();
        append_entries(&self.path, &entries)?;

        debug!(index = %index_id, count = entries.len(), "Operations queued in outbox");
        Ok(entries.len())
    }

    /// Entries currently queued, oldest first
    pub fn pending(&self) -> Result<Vec<OutboxEntry>> {
        let _lock = self.lock(false)?;
        self.read_entries()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Replay queued operations through `deliver`, grouped per index.
    ///
    /// Operations are deduplicated per index (last wins). Failed operations
    /// and whole groups whose delivery errored stay queued, except operations
    /// the service rejected, which move to the rejected file. Groups refused
    /// with a configuration error (unknown index) are discarded.
    pub fn drain<F>(&self, mut deliver: F) -> Result<DrainReport>
    where
        F: FnMut(&str, Vec<SyncOperation>) -> Result<BatchReport>,
    {
        let _lock = self.lock(true)?;

        let entries = self.read_entries()?;
        let mut report = DrainReport {
            entries: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        // Group by index, keeping first-seen order of indices
        let mut groups: Vec<(String, Vec<OutboxEntry>)> = Vec::new();
        for entry in entries {
            match groups.iter_mut().find(|(id, _)| *id == entry.index_id) {
                Some((_, group)) => group.push(entry),
                None => groups.push((entry.index_id.clone(), vec![entry])),
            }
        }

        let mut kept: Vec<OutboxEntry> = Vec::new();
        let mut rejected: Vec<OutboxEntry> = Vec::new();
        for (index_id, group) in groups {
            let enqueued_at = group.iter().map(|e| e.enqueued_at).min().unwrap_or_default();
            let operations = dedupe_operations(group.into_iter().map(|e| e.operation).collect());
            let count = operations.len();
            let entry = |operation: SyncOperation| OutboxEntry {
                index_id: index_id.clone(),
                operation,
                enqueued_at,
            };

            match deliver(&index_id, operations.clone()) {
                Ok(batch) => {
                    report.remote_calls += batch.remote_calls;
                    report.delivered += batch.succeeded();
                    report.failed += batch.failed.len();
                    let refused: HashSet<&str> = batch
                        .failed
                        .iter()
                        .filter(|f| f.rejected)
                        .map(|f| f.object_id.as_str())
                        .collect();
                    let failed: HashSet<&str> =
                        batch.failed.iter().map(|f| f.object_id.as_str()).collect();
                    for operation in operations {
                        if refused.contains(operation.object_id()) {
                            warn!(
                                index = %index_id,
                                object_id = %operation.object_id(),
                                "Operation rejected by the service; moving it out of the outbox"
                            );
                            rejected.push(entry(operation));
                        } else if failed.contains(operation.object_id()) {
                            kept.push(entry(operation));
                        }
                    }
                }
                Err(SyncError::Configuration(message)) => {
                    warn!(index = %index_id, count, reason = %message, "Discarding outbox entries");
                    report.discarded += count;
                }
                Err(e) => {
                    warn!(index = %index_id, count, error = %e, "Outbox delivery failed; keeping entries");
                    report.failed += count;
                    kept.extend(operations.into_iter().map(entry));
                }
            }
        }

        if !rejected.is_empty() {
            append_entries(&self.rejected_path(), &rejected)?;
        }
        self.replace_entries(&kept)?;

        report.rejected = rejected.len();
        report.remaining = kept.len();
        info!(
            path = %self.path.display(),
            entries = report.entries,
            delivered = report.delivered,
            remaining = report.remaining,
            rejected = report.rejected,
            discarded = report.discarded,
            "Outbox drained"
        );
        Ok(report)
    }

    /// Lock the sidecar lock file, shared or exclusive. Released on drop.
    fn lock(&self, exclusive: bool) -> Result<File> {
        let path = sibling(&self.path, "lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| outbox_error(&path, "open", e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| outbox_error(&path, "lock", e))?;
        Ok(file)
    }

    /// Swap the queue for `entries` through a temp file and a rename, so a
    /// crash leaves either the old or the new queue.
    fn replace_entries(&self, entries: &[OutboxEntry]) -> Result<()> {
        let tmp = sibling(&self.path, "tmp");
        let mut file = File::create(&tmp).map_err(|e| outbox_error(&tmp, "create", e))?;
        file.write_all(&encode_entries(entries)?)
            .map_err(|e| outbox_error(&tmp, "write", e))?;
        file.sync_all().map_err(|e| outbox_error(&tmp, "sync", e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| outbox_error(&self.path, "replace", e))
    }

    fn read_entries(&self) -> Result<Vec<OutboxEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(outbox_error(&self.path, "open", e)),
        };
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| outbox_error(&self.path, "read", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|e| SyncError::Outbox {
                path: self.path.clone(),
                message: format!("malformed entry on line {}: {}", n + 1, e),
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn encode_entries(entries: &[OutboxEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn append_entries(path: &Path, entries: &[OutboxEntry]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| outbox_error(path, "open", e))?;
    file.write_all(&encode_entries(entries)?)
        .map_err(|e| outbox_error(path, "write", e))
}

/// `outbox.jsonl` -> `outbox.jsonl.{suffix}`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn outbox_error(path: &Path, action: &str, e: std::io::Error) -> SyncError {
    SyncError::Outbox {
        path: path.to_path_buf(),
        message: format!("failed to {}: {}", action, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RemoteError, RemoteErrorKind};
    use crate::index::Record;
    use tempfile::TempDir;

    fn outbox(dir: &TempDir) -> Outbox {
        Outbox::open(dir.path().join("queue").join("outbox.jsonl")).unwrap()
    }

    #[test]
    fn test_enqueue_and_pending() {
        let dir = TempDir::new().unwrap();
        let outbox = outbox(&dir);
        assert!(outbox.is_empty().unwrap());

        outbox
            .enqueue(
                "posts_post",
                vec![
                    SyncOperation::upsert(Record::new("post_1")),
                    SyncOperation::delete("post_2"),
                ],
            )
            .unwrap();
        outbox.enqueue("users", vec![SyncOperation::delete("user_1")]).unwrap();

        let pending = outbox.pending().unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].index_id, "posts_post");
        assert_eq!(pending[2].operation, SyncOperation::delete("user_1"));
    }

    #[test]
    fn test_drain_dedupes_and_keeps_failures() {
        let dir = TempDir::new().unwrap();
        let outbox = outbox(&dir);
        outbox
            .enqueue(
                "posts_post",
                vec![
                    SyncOperation::upsert(Record::new("post_1").with("v", 1)),
                    SyncOperation::upsert(Record::new("post_2")),
                    SyncOperation::upsert(Record::new("post_1").with("v", 2)),
                ],
            )
            .unwrap();

        let mut seen = Vec::new();
        let report = outbox
            .drain(|index_id, ops| {
                seen.push((index_id.to_string(), ops.len()));
                let mut batch = BatchReport::default();
                batch.remote_calls = 1;
                batch.upserted.push("post_1".into());
                batch.record_failure("post_2", "rejected");
                Ok(batch)
            })
            .unwrap();

        assert_eq!(seen, vec![("posts_post".to_string(), 2)]);
        assert_eq!(report.entries, 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 1);
        let pending = outbox.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.object_id(), "post_2");
    }

    #[test]
    fn test_drain_discards_unknown_index_and_keeps_unreachable() {
        let dir = TempDir::new().unwrap();
        let outbox = outbox(&dir);
        outbox.enqueue("gone", vec![SyncOperation::delete("post_1")]).unwrap();
        outbox.enqueue("users", vec![SyncOperation::delete("user_1")]).unwrap();

        let report = outbox
            .drain(|index_id, _| match index_id {
                "gone" => Err(SyncError::Configuration("unknown index".into())),
                _ => Err(SyncError::Io(std::io::Error::other("offline"))),
            })
            .unwrap();

        assert_eq!(report.discarded, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(outbox.pending().unwrap()[0].index_id, "users");
    }

    #[test]
    fn test_drain_moves_rejected_operations_out() {
        let dir = TempDir::new().unwrap();
        let outbox = outbox(&dir);
        outbox
            .enqueue(
                "posts_post",
                vec![
                    SyncOperation::upsert(Record::new("post_1")),
                    SyncOperation::upsert(Record::new("post_2")),
                    SyncOperation::upsert(Record::new("post_3")),
                ],
            )
            .unwrap();

        let report = outbox
            .drain(|_, _| {
                let mut batch = BatchReport::default();
                batch.upserted.push("post_1".into());
                batch.record_remote_failure(
                    "post_2",
                    &RemoteError::with_status(400, "record too big"),
                );
                batch.record_remote_failure(
                    "post_3",
                    &RemoteError::new(RemoteErrorKind::Timeout, "timed out"),
                );
                Ok(batch)
            })
            .unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.remaining, 1);
        let pending = outbox.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.object_id(), "post_3");

        let rejected = std::fs::read_to_string(outbox.rejected_path()).unwrap();
        let rejected: Vec<OutboxEntry> = rejected
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].operation.object_id(), "post_2");

        // The poison record is not retried on the next drain
        let mut delivered = Vec::new();
        outbox
            .drain(|_, ops| {
                let ids: Vec<String> = ops.iter().map(|o| o.object_id().to_string()).collect();
                delivered.extend(ids.iter().cloned());
                Ok(BatchReport {
                    upserted: ids,
                    ..Default::default()
                })
            })
            .unwrap();
        assert_eq!(delivered, vec!["post_3"]);
        assert!(outbox.is_empty().unwrap());
    }

    #[test]
    fn test_drain_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let outbox = outbox(&dir);
        outbox.enqueue("users", vec![SyncOperation::delete("user_1")]).unwrap();
        outbox.drain(|_, _| Ok(BatchReport::default())).unwrap();
        assert!(!sibling(outbox.path(), "tmp").exists());
        assert!(outbox.path().exists());
    }
}
