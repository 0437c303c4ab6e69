//! # Offline Buffer
//!
//! Durable, append-only JSON-lines file of writes the store has not
//! acknowledged yet. One `BufferedRecord` per line, oldest first.
//!
//! Removal rewrites the whole file through a sibling `.tmp` file and a
//! `rename`, so a crash leaves either the old or the new contents, never a
//! mix. Unreadable lines are moved to a sibling `.corrupt` file.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::connections::store::{Row, Table};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Buffer file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize buffered record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A pending write: target table plus the serialized row body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub table: Table,
    pub row: serde_json::Value,
}

impl BufferedRecord {
    pub fn from_row(row: &Row) -> Result<Self, serde_json::Error> {
        Ok(Self {
            table: row.table(),
            row: row.payload()?,
        })
    }

    pub fn into_row(self) -> Result<Row, serde_json::Error> {
        Row::from_payload(self.table, self.row)
    }
}

/// One line of the buffer file.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferedLine {
    Record(Row),
    /// The raw text of a line that does not decode to a well-formed row.
    Corrupt(String),
}

fn decode_line(line: &str) -> BufferedLine {
    let row = serde_json::from_str::<BufferedRecord>(line).and_then(BufferedRecord::into_row);
    match row {
        Ok(row) if row.is_well_formed() => BufferedLine::Record(row),
        _ => BufferedLine::Corrupt(line.to_string()),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub struct OfflineBuffer {
    path: PathBuf,
    /// Serializes appends against rewrites.
    file_lock: Mutex<()>,
}

impl OfflineBuffer {
    /// Opens (without creating) the buffer at `path`.
    ///
    /// A file whose last line was cut short by a crash mid-append gets its
    /// missing newline back, so the next append starts on a fresh line and
    /// the torn line is later quarantined on its own.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, BufferError> {
        let path = path.into();
        match fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() && !bytes.ends_with(b"\n") => {
                let mut file = OpenOptions::new().append(true).open(&path).await?;
                file.write_all(b"\n").await?;
                file.sync_data().await?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            path,
            file_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn corrupt_path(&self) -> PathBuf {
        sibling(&self.path, ".corrupt")
    }

    /// Appends one record and syncs it to disk.
    pub async fn append(&self, record: &BufferedRecord) -> Result<(), BufferError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.file_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Every buffered line, oldest first.
    pub async fn read_all(&self) -> Result<Vec<BufferedLine>, BufferError> {
        let _guard = self.file_lock.lock().await;
        Ok(self.raw_lines().await?.iter().map(|l| decode_line(l)).collect())
    }

    pub async fn len(&self) -> Result<usize, BufferError> {
        let _guard = self.file_lock.lock().await;
        Ok(self.raw_lines().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, BufferError> {
        Ok(self.len().await? == 0)
    }

    /// Drops the oldest `count` lines in one rewrite. Returns how many lines
    /// remain.
    pub async fn remove_front(&self, count: usize) -> Result<usize, BufferError> {
        let _guard = self.file_lock.lock().await;
        let lines = self.raw_lines().await?;
        if count == 0 {
            return Ok(lines.len());
        }
        let rest = &lines[count.min(lines.len())..];
        self.rewrite(rest).await?;
        Ok(rest.len())
    }

    /// Moves the oldest line to the `.corrupt` file. Returns its text.
    pub async fn quarantine_front(&self) -> Result<Option<String>, BufferError> {
        let _guard = self.file_lock.lock().await;
        let lines = self.raw_lines().await?;
        let Some(first) = lines.first() else {
            return Ok(None);
        };

        let mut corrupt = OpenOptions::new().create(true).append(true).open(self.corrupt_path()).await?;
        corrupt.write_all(format!("{first}\n").as_bytes()).await?;
        corrupt.sync_data().await?;

        self.rewrite(&lines[1..]).await?;
        Ok(Some(first.clone()))
    }

    async fn raw_lines(&self) -> Result<Vec<String>, BufferError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn rewrite(&self, lines: &[String]) -> Result<(), BufferError> {
        let tmp = sibling(&self.path, ".tmp");
        let mut contents = String::new();
        for line in lines {
            contents.push_str(line);
            contents.push('\n');
        }

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
