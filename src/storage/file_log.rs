//! File-backed response log

use crate::storage::codec::{JsonLinesCodec, RecordCodec};
use crate::storage::traits::{ResponseLog, StorageError, StorageResult};
use crate::storage::FetchOutcome;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Newline-delimited response log on disk
pub struct FileResponseLog<C = JsonLinesCodec> {
    path: PathBuf,
    codec: C,
}

impl FileResponseLog<JsonLinesCodec> {
    /// Opens a JSON-lines log at `path`
    ///
    /// See [`FileResponseLog::with_codec`].
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::with_codec(path, JsonLinesCodec)
    }
}

impl<C> FileResponseLog<C>
where
    C: RecordCodec<FetchOutcome>,
{
    /// Opens a log at `path` using `codec`
    ///
    /// The file is not created until the first append. If a previous process died
    /// halfway through a write, the torn trailing record is cut off so the next
    /// append starts on a fresh line. A complete record that only lost its
    /// newline is kept and terminated.
    pub fn with_codec(path: &Path, codec: C) -> StorageResult<Self> {
        let log = Self {
            path: path.to_path_buf(),
            codec,
        };
        log.truncate_torn_tail()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the log file; a missing file is fine
    pub fn clear(&mut self) -> StorageResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate_torn_tail(&self) -> StorageResult<()> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if bytes.is_empty() || bytes.ends_with(b"\n") {
            return Ok(());
        }

        let keep = bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);

        let tail = std::str::from_utf8(&bytes[keep..]).ok();
        if tail.is_some_and(|line| self.codec.decode(line).is_ok()) {
            tracing::debug!("Terminating last record of {}", self.path.display());
            let mut file = OpenOptions::new().append(true).open(&self.path)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            return Ok(());
        }

        tracing::warn!(
            "Dropping {} bytes of incomplete trailing record from {}",
            bytes.len() - keep,
            self.path.display()
        );

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(keep as u64)?;
        file.sync_all()?;
        Ok(())
    }
}

impl<C> ResponseLog for FileResponseLog<C>
where
    C: RecordCodec<FetchOutcome>,
{
    fn append(&mut self, outcome: &FetchOutcome) -> StorageResult<()> {
        let mut line = self.codec.encode(outcome)?;
        if line.contains('\n') {
            return Err(StorageError::Encode(
                "codec produced a multi-line record".to_string(),
            ));
        }
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn load_all(&self) -> StorageResult<Vec<FetchOutcome>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No response log at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let torn_tail = !content.is_empty() && !content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();
        let mut outcomes = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            match self.codec.decode(line) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if torn_tail && i + 1 == lines.len() => {
                    tracing::warn!(
                        "Ignoring incomplete trailing record in {}: {}",
                        self.path.display(),
                        e
                    );
                }
                Err(e) => {
                    return Err(StorageError::Corrupt {
                        line: i + 1,
                        message: e.to_string(),
                    })
                }
            }
        }

        Ok(outcomes)
    }
}
