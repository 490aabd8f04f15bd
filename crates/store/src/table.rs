//! Append-only JSONL row tables with a bounded in-memory ring.
//!
//! Rows are appended to a JSONL file and kept in memory up to a cap for
//! fast queries. On open, only the most recent rows are loaded; when the
//! file has grown past the cap it is rewritten with what was kept.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use std::collections::VecDeque;

/// A named, append-only table persisted as one JSONL file.
pub struct JsonlTable<T> {
    path: PathBuf,
    rows: RwLock<VecDeque<T>>,
    cap: usize,
}

impl<T> JsonlTable<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Open (or create) the table, loading the most recent `cap` rows.
    pub fn open(path: impl Into<PathBuf>, cap: usize) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let (rows, total_on_disk) = Self::load_recent(&path, cap);
        if total_on_disk > rows.len() {
            tracing::info!(
                table = %path.display(),
                kept = rows.len(),
                pruned = total_on_disk - rows.len(),
                "pruning table JSONL on disk"
            );
            Self::rewrite_jsonl(&path, &rows);
        }

        Self {
            path,
            rows: RwLock::new(rows),
            cap,
        }
    }

    fn load_recent(path: &Path, cap: usize) -> (VecDeque<T>, usize) {
        let mut rows = VecDeque::new();
        let mut total = 0;
        if let Ok(content) = std::fs::read_to_string(path) {
            let lines: Vec<&str> = content.lines().collect();
            total = lines.len();
            for line in lines.iter().rev().take(cap) {
                if let Ok(row) = serde_json::from_str::<T>(line) {
                    rows.push_front(row);
                }
            }
        }
        (rows, total)
    }

    fn rewrite_jsonl(path: &Path, rows: &VecDeque<T>) {
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for row in rows {
                if let Ok(json) = serde_json::to_string(row) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    /// Append a row: in-memory ring plus JSONL file.
    pub fn append(&self, row: T) {
        if let Ok(json) = serde_json::to_string(&row) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
        let mut rows = self.rows.write();
        rows.push_back(row);
        while rows.len() > self.cap {
            rows.pop_front();
        }
    }

    /// Most recent rows, newest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        self.rows.read().iter().rev().take(limit).cloned().collect()
    }

    /// All in-memory rows, oldest first.
    pub fn all(&self) -> Vec<T> {
        self.rows.read().iter().cloned().collect()
    }

    /// Newest row matching the predicate.
    pub fn find<F>(&self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        self.rows.read().iter().rev().find(|r| pred(r)).cloned()
    }

    /// Rows matching the predicate, newest first, up to `limit`.
    pub fn filter<F>(&self, pred: F, limit: usize) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.rows
            .read()
            .iter()
            .rev()
            .filter(|r| pred(r))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
