//! Request journal: one JSON line per notable event, with the most recent
//! entries kept in memory for `/debug/journal`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MAX_JOURNAL_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    RequestAccepted {
        request_id: String,
        model: String,
        stream: bool,
        tools: usize,
    },
    BackendCall {
        request_id: String,
        backend: String,
        model: String,
        status: u16,
        duration_ms: u64,
        attempts: u32,
    },
    ToolExecuted {
        request_id: String,
        tool: String,
        tool_use_id: String,
        is_error: bool,
        duration_ms: u64,
    },
    StreamAborted {
        request_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: JournalEvent,
}

impl JournalEntry {
    pub fn new(event: JournalEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Ring buffer of journal entries, optionally mirrored to a JSONL file.
pub struct Journal {
    entries: VecDeque<JournalEntry>,
    file_path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    capacity: usize,
    /// Lines currently in the file, kept entries included.
    file_lines: usize,
    /// Lines the file may hold beyond the ring before it is compacted.
    compact_every: usize,
}

impl Journal {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(MAX_JOURNAL_ENTRIES);
        let mut file_lines = 0;

        if file_path.exists() {
            let file = File::open(&file_path)?;
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(std::result::Result::ok) {
                file_lines += 1;
                if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
                    if entries.len() >= MAX_JOURNAL_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        Ok(Self {
            entries,
            file_path: Some(file_path),
            writer: Some(BufWriter::new(file)),
            capacity: MAX_JOURNAL_ENTRIES,
            file_lines,
            compact_every: MAX_JOURNAL_ENTRIES,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            file_path: None,
            writer: None,
            capacity: MAX_JOURNAL_ENTRIES,
            file_lines: 0,
            compact_every: MAX_JOURNAL_ENTRIES,
        }
    }

    pub fn record(&mut self, entry: JournalEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
                self.file_lines += 1;
            }
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);

        if self.file_lines >= self.entries.len() + self.compact_every {
            if let Err(e) = self.compact() {
                tracing::warn!(error = %e, "Journal compaction failed");
            }
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Rewrite the file from the ring so it never grows past the ring size.
    pub fn compact(&mut self) -> std::io::Result<()> {
        let Some(file_path) = self.file_path.clone() else {
            return Ok(());
        };

        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&file_path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            if let Ok(json) = serde_json::to_string(entry) {
                writeln!(writer, "{}", json)?;
            }
        }
        writer.flush()?;
        self.file_lines = self.entries.len();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedJournal(Arc<Mutex<Journal>>);

impl SharedJournal {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Journal::open(file_path)?))))
    }

    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Journal::in_memory())))
    }

    pub fn record(&self, event: JournalEvent) {
        if let Ok(mut journal) = self.0.lock() {
            journal.record(JournalEntry::new(event));
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        self.0.lock().map(|j| j.recent(limit)).unwrap_or_default()
    }

    pub fn compact(&self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut journal) => journal.compact(),
            Err(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for SharedJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedJournal").finish_non_exhaustive()
    }
}
