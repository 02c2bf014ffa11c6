//! Disk Spool: durable buffer for records that could not be delivered
//!
//! Two JSON-lines files live in the spool directory:
//!
//! - `spool.jsonl`: the active spool. Records are appended while the server
//!   is unreachable, flushed after every line.
//! - `replay.jsonl`: records claimed for replay. [`DiskSpool::claim`] appends
//!   the active spool here before truncating it, and the file is removed with
//!   [`DiskSpool::release_claimed`] once every replayed record is confirmed.
//!
//! A crash between claim and release replays the claimed records again on
//! the next start, so records may be duplicated but are never lost.

use crate::config::defaults;
use crate::types::MeasurementRecord;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Spool errors
#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("spool I/O error ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpoolError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Active spool plus replay file in one directory.
#[derive(Debug, Clone)]
pub struct DiskSpool {
    dir: PathBuf,
    active: PathBuf,
    replay: PathBuf,
}

impl DiskSpool {
    /// Create or open the spool directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, SpoolError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| SpoolError::io(&dir, e))?;

        let spool = Self {
            active: dir.join(defaults::SPOOL_FILE_NAME),
            replay: dir.join(defaults::REPLAY_FILE_NAME),
            dir,
        };

        let pending = spool.pending_count()?;
        if pending > 0 || spool.has_claimed() {
            info!(
                dir = %spool.dir.display(),
                pending,
                replay_file = spool.has_claimed(),
                "Spool opened with undelivered records"
            );
        } else {
            debug!(dir = %spool.dir.display(), "Spool opened (empty)");
        }

        Ok(spool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn active_path(&self) -> &Path {
        &self.active
    }

    pub fn replay_path(&self) -> &Path {
        &self.replay
    }

    /// Open the active spool for appending.
    pub fn appender(&self) -> Result<SpoolWriter, SpoolError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active)
            .map_err(|e| SpoolError::io(&self.active, e))?;
        Ok(SpoolWriter {
            path: self.active.clone(),
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Append records to the active spool, flushing each.
    pub fn append(&self, records: &[MeasurementRecord]) -> Result<usize, SpoolError> {
        let mut writer = self.appender()?;
        for record in records {
            writer.write(record)?;
        }
        Ok(writer.written())
    }

    /// Move the active spool into the replay file and return the moved
    /// records. A missing or empty spool claims nothing.
    pub fn claim(&self) -> Result<Vec<MeasurementRecord>, SpoolError> {
        let records = read_records(&self.active)?;
        if records.is_empty() {
            truncate(&self.active)?;
            return Ok(records);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.replay)
            .map_err(|e| SpoolError::io(&self.replay, e))?;
        let mut writer = BufWriter::new(file);
        for record in &records {
            write_line(&mut writer, record).map_err(|e| match e {
                LineError::Io(e) => SpoolError::io(&self.replay, e),
                LineError::Encode(e) => SpoolError::Serialization(e),
            })?;
        }
        writer
            .into_inner()
            .map_err(|e| SpoolError::io(&self.replay, e.into_error()))?
            .sync_all()
            .map_err(|e| SpoolError::io(&self.replay, e))?;

        truncate(&self.active)?;
        info!(records = records.len(), "Claimed spooled records for replay");
        Ok(records)
    }

    /// Records claimed by an earlier run that were never confirmed.
    pub fn recover_claimed(&self) -> Result<Vec<MeasurementRecord>, SpoolError> {
        let records = read_records(&self.replay)?;
        if !records.is_empty() {
            info!(records = records.len(), "Recovered unconfirmed replay records");
        }
        Ok(records)
    }

    /// Drop the replay file after every claimed record was confirmed.
    pub fn release_claimed(&self) -> Result<(), SpoolError> {
        match fs::remove_file(&self.replay) {
            Ok(()) => {
                debug!("Replay file released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::io(&self.replay, e)),
        }
    }

    pub fn has_claimed(&self) -> bool {
        self.replay.exists()
    }

    /// Number of records in the active spool
    pub fn pending_count(&self) -> Result<usize, SpoolError> {
        let file = match File::open(&self.active) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SpoolError::io(&self.active, e)),
        };
        Ok(BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .count())
    }
}

/// Line-at-a-time writer over the active spool
pub struct SpoolWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl SpoolWriter {
    /// Append one record and flush it to the file.
    pub fn write(&mut self, record: &MeasurementRecord) -> Result<(), SpoolError> {
        write_line(&mut self.writer, record).map_err(|e| match e {
            LineError::Io(e) => SpoolError::io(&self.path, e),
            LineError::Encode(e) => SpoolError::Serialization(e),
        })?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

enum LineError {
    Io(std::io::Error),
    Encode(serde_json::Error),
}

fn write_line<W: Write>(writer: &mut W, record: &MeasurementRecord) -> Result<(), LineError> {
    let mut line = serde_json::to_vec(record).map_err(LineError::Encode)?;
    line.push(b'\n');
    writer.write_all(&line).map_err(LineError::Io)?;
    writer.flush().map_err(LineError::Io)
}

fn truncate(path: &Path) -> Result<(), SpoolError> {
    match OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpoolError::io(path, e)),
    }
}

/// Read every parsable record; corrupted lines are logged and skipped.
fn read_records(path: &Path) -> Result<Vec<MeasurementRecord>, SpoolError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SpoolError::io(path, e)),
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| SpoolError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MeasurementRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Corrupted spool line, skipping"
                );
            }
        }
    }
    Ok(records)
}
