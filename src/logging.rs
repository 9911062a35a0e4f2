use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::error::{IoContext, PatchError, PatchResult};

const LOG_DIR: &str = ".deltabatch";
const LOG_FILE: &str = "history.jsonl";
const MAX_ENTRIES: usize = 500;

/// Receiver of the human-readable progress lines a job emits.
pub trait LogSink {
    fn line(&self, text: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str),
{
    fn line(&self, text: &str) {
        self(text)
    }
}

/// Discards every line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn line(&self, _text: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: String,
    pub job: Uuid,
    pub source: PathBuf,
    pub target: PathBuf,
    pub output_dir: PathBuf,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JournalEntry {
    pub fn now(
        job: Uuid,
        source: &Path,
        target: &Path,
        output_dir: &Path,
        failure: Option<&str>,
    ) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".into());
        Self {
            timestamp,
            job,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            outcome: if failure.is_some() {
                Outcome::Failed
            } else {
                Outcome::Ok
            },
            message: failure.map(str::to_string),
        }
    }
}

/// Append-only JSONL record of finished jobs, trimmed to the newest
/// entries.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Journal kept under `<root>/.deltabatch/`.
    pub fn in_dir(root: &Path) -> Self {
        Self {
            path: root.join(LOG_DIR).join(LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &JournalEntry) -> PatchResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).at_path("creating", dir)?;
        }
        let json = serde_json::to_string(entry)
            .map_err(|err| PatchError::Config(format!("serializing journal entry: {err}")))?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .at_path("opening", &self.path)?;
        writeln!(file, "{json}").at_path("appending to", &self.path)?;
        self.truncate()
    }

    /// Newest `limit` entries, oldest first. Unparseable lines are skipped.
    pub fn read_recent(&self, limit: usize) -> PatchResult<Vec<JournalEntry>> {
        let lines = match self.read_lines() {
            Ok(lines) => lines,
            Err(PatchError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        let entries: Vec<JournalEntry> = lines
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    fn read_lines(&self) -> PatchResult<Vec<String>> {
        let file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .at_path("reading", &self.path)?;
        BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .at_path("reading", &self.path)
    }

    fn truncate(&self) -> PatchResult<()> {
        let lines = self.read_lines()?;
        if lines.len() <= MAX_ENTRIES {
            return Ok(());
        }
        let keep = &lines[lines.len() - MAX_ENTRIES..];
        fs::write(&self.path, keep.join("\n") + "\n").at_path("truncating", &self.path)
    }
}
