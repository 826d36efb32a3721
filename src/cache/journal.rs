//! Append-only journal for the disk tier index.
//!
//! One JSON object per line. The first line is a header carrying the journal
//! format and the app version; every later line is an operation on a disk key:
//!
//! ```text
//! {"op":"header","magic":"image-cache-tier.journal","format":1,"app_version":1}
//! {"op":"dirty","key":"a9993e36..."}
//! {"op":"clean","key":"a9993e36...","len":5321}
//! {"op":"read","key":"a9993e36..."}
//! {"op":"remove","key":"a9993e36..."}
//! ```
//!
//! Replaying the journal rebuilds the LRU order: `clean` and `read` move a key
//! to the most-recently-used end, `remove` drops it, and a `dirty` without a
//! following `clean` or `remove` marks an interrupted write.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const JOURNAL_MAGIC: &str = "image-cache-tier.journal";
pub const JOURNAL_FORMAT: u32 = 1;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal record does not serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("journal header missing or unreadable")]
    MissingHeader,

    #[error("journal header mismatch: found {found}")]
    HeaderMismatch { found: String },

    #[error("corrupt journal record at line {line}")]
    Corrupt { line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Header {
        magic: String,
        format: u32,
        app_version: u32,
    },
    Dirty {
        key: String,
    },
    Clean {
        key: String,
        len: u64,
    },
    Remove {
        key: String,
    },
    Read {
        key: String,
    },
}

impl JournalRecord {
    pub fn header(app_version: u32) -> Self {
        JournalRecord::Header {
            magic: JOURNAL_MAGIC.to_string(),
            format: JOURNAL_FORMAT,
            app_version,
        }
    }
}

/// Index state rebuilt from a journal.
#[derive(Debug)]
pub struct Replay {
    /// Committed entries and their sizes, least recently used first.
    pub entries: Vec<(String, u64)>,
    /// Keys with a write that never committed.
    pub dirty: Vec<String>,
    /// Records that no longer describe a live entry.
    pub redundant: usize,
}

/// Rebuild the index from journal text.
///
/// A truncated final line is tolerated (the process died mid-append); any
/// other unparsable line is corruption.
pub fn replay(contents: &str, app_version: u32) -> Result<Replay, JournalError> {
    let mut lines = contents.lines().enumerate().peekable();

    let (_, first) = lines.next().ok_or(JournalError::MissingHeader)?;
    match serde_json::from_str::<JournalRecord>(first) {
        Ok(header) if header == JournalRecord::header(app_version) => {}
        Ok(other) => {
            return Err(JournalError::HeaderMismatch {
                found: format!("{other:?}"),
            })
        }
        Err(_) => return Err(JournalError::MissingHeader),
    }

    let mut entries: LruCache<String, u64> = LruCache::unbounded();
    let mut dirty: HashSet<String> = HashSet::new();
    let mut total = 0usize;

    while let Some((idx, line)) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        let record = match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => record,
            Err(_) if lines.peek().is_none() => {
                warn!(line = idx + 1, "Ignoring truncated journal tail");
                break;
            }
            Err(_) => return Err(JournalError::Corrupt { line: idx + 1 }),
        };
        total += 1;
        match record {
            JournalRecord::Dirty { key } => {
                dirty.insert(key);
            }
            JournalRecord::Clean { key, len } => {
                dirty.remove(&key);
                entries.put(key, len);
            }
            JournalRecord::Remove { key } => {
                dirty.remove(&key);
                entries.pop(&key);
            }
            JournalRecord::Read { key } => {
                entries.get(&key);
            }
            JournalRecord::Header { .. } => return Err(JournalError::Corrupt { line: idx + 1 }),
        }
    }

    let mut ordered = Vec::with_capacity(entries.len());
    while let Some(entry) = entries.pop_lru() {
        ordered.push(entry);
    }
    // A dirty key may still have an older committed entry in `ordered`.
    let dirty: Vec<String> = dirty.into_iter().collect();
    let redundant = total.saturating_sub(ordered.len());

    Ok(Replay {
        entries: ordered,
        dirty,
        redundant,
    })
}

/// Open journal file, appended to record by record.
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Write a fresh journal holding the header and one `clean` record per
    /// entry (least recently used first), then open it for appending.
    ///
    /// The new journal is written to a temporary file and renamed into place,
    /// so a crash leaves either the old or the new journal intact.
    pub async fn create(
        dir: &Path,
        app_version: u32,
        entries: impl Iterator<Item = (&String, &u64)>,
    ) -> Result<Self, JournalError> {
        let path = dir.join(JOURNAL_FILE);
        let tmp = dir.join(format!("{JOURNAL_FILE}.tmp"));

        let mut body = serde_json::to_string(&JournalRecord::header(app_version))?;
        body.push('\n');
        let mut count = 0usize;
        for (key, len) in entries {
            let record = JournalRecord::Clean {
                key: key.clone(),
                len: *len,
            };
            body.push_str(&serde_json::to_string(&record)?);
            body.push('\n');
            count += 1;
        }

        fs::write(&tmp, body.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), entries = count, "Rewrote journal");

        let file = OpenOptions::new().append(true).open(&path).await?;
        Ok(Self { path, file })
    }

    pub async fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), JournalError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(record: &JournalRecord) -> String {
        serde_json::to_string(record).unwrap()
    }

    fn journal(records: &[JournalRecord]) -> String {
        let mut out = line(&JournalRecord::header(1));
        for record in records {
            out.push('\n');
            out.push_str(&line(record));
        }
        out.push('\n');
        out
    }

    fn clean(key: &str, len: u64) -> JournalRecord {
        JournalRecord::Clean {
            key: key.into(),
            len,
        }
    }

    #[test]
    fn test_record_wire_format() {
        assert_eq!(
            line(&JournalRecord::Remove { key: "ab".into() }),
            r#"{"op":"remove","key":"ab"}"#
        );
    }

    #[test]
    fn test_replay_rebuilds_lru_order() {
        let text = journal(&[
            clean("a", 10),
            clean("b", 20),
            clean("c", 30),
            JournalRecord::Read { key: "a".into() },
            JournalRecord::Remove { key: "b".into() },
        ]);
        let replay = replay(&text, 1).unwrap();
        assert_eq!(
            replay.entries,
            vec![("c".to_string(), 30), ("a".to_string(), 10)]
        );
        assert!(replay.dirty.is_empty());
        assert_eq!(replay.redundant, 3);
    }

    #[test]
    fn test_replay_reports_dangling_dirty() {
        let text = journal(&[
            JournalRecord::Dirty { key: "a".into() },
            clean("a", 10),
            JournalRecord::Dirty { key: "b".into() },
        ]);
        let replay = replay(&text, 1).unwrap();
        assert_eq!(replay.entries, vec![("a".to_string(), 10)]);
        assert_eq!(replay.dirty, vec!["b".to_string()]);
    }

    #[test]
    fn test_replay_rejects_other_app_version() {
        let text = journal(&[clean("a", 10)]);
        assert!(matches!(
            replay(&text, 2),
            Err(JournalError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn test_replay_tolerates_truncated_tail_only() {
        let mut text = journal(&[clean("a", 10)]);
        text.push_str(r#"{"op":"clean","key":"b","#);
        let replay = replay(&text, 1).unwrap();
        assert_eq!(replay.entries.len(), 1);

        let broken = format!(
            "{}\n{{garbage\n{}\n",
            line(&JournalRecord::header(1)),
            line(&clean("a", 10))
        );
        assert!(matches!(
            super::replay(&broken, 1),
            Err(JournalError::Corrupt { line: 2 })
        ));
    }

    #[test]
    fn test_empty_journal_has_no_header() {
        assert!(matches!(replay("", 1), Err(JournalError::MissingHeader)));
    }

    #[tokio::test]
    async fn test_create_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![("a".to_string(), 10u64)];
        let mut journal = Journal::create(dir.path(), 1, entries.iter().map(|(k, v)| (k, v)))
            .await
            .unwrap();
        journal
            .append(&JournalRecord::Remove { key: "a".into() })
            .await
            .unwrap();
        journal.sync().await.unwrap();

        let text = std::fs::read_to_string(journal.path()).unwrap();
        let replay = replay(&text, 1).unwrap();
        assert!(replay.entries.is_empty());
        assert_eq!(replay.redundant, 2);
    }
}
